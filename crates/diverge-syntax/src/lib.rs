//! AST and source spans for the restricted teaching language.
//!
//! The parser that produces this AST lives in the host toolchain; the
//! detector only consumes it. The `build` module provides programmatic
//! constructors so embedders and tests can assemble programs directly.

pub mod ast;
pub mod build;
pub mod span;

pub use ast::*;
pub use span::Span;
