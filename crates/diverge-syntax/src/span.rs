//! Source spans.

use std::fmt;

/// A source span. Byte offsets are best-effort: programmatically built
/// ASTs carry the default zero span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Start byte offset (inclusive).
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
    /// Line number (1-indexed, 0 when unknown).
    pub line: u32,
}

impl Span {
    /// Create a new span.
    pub fn new(start: usize, end: usize, line: u32) -> Self {
        Self { start, end, line }
    }

    /// Whether this span carries real position information.
    pub fn is_known(&self) -> bool {
        *self != Span::default()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "line {}", self.line)
        } else {
            write!(f, "unknown location")
        }
    }
}
