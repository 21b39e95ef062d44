//! Symbolic expressions and the interning cache.
//!
//! Every hybrid value carries a `SymExpr` tree over named variables.
//! Frames never store trees directly: they store `ExprId`s handed out by
//! the per-run `ExprCache`, which interns structurally (by rendered text)
//! so that equal expressions always share an id. This makes the equality
//! checks in cycle and iteration-frame comparison O(1).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use diverge_syntax::{BinOp, UnaryOp};

use crate::value::render_number;

/// An immutable symbolic expression.
#[derive(Debug)]
pub enum SymExpr {
    Number(f64),
    Bool(bool),
    Str(String),
    /// A named source-level variable.
    Ident(String),
    Unary { op: UnaryOp, operand: ExprRef },
    Binary { op: BinOp, lhs: ExprRef, rhs: ExprRef },
}

pub type ExprRef = Rc<SymExpr>;

pub fn ident(name: impl Into<String>) -> ExprRef {
    Rc::new(SymExpr::Ident(name.into()))
}

pub fn number(n: f64) -> ExprRef {
    Rc::new(SymExpr::Number(n))
}

pub fn unary(op: UnaryOp, operand: ExprRef) -> ExprRef {
    Rc::new(SymExpr::Unary { op, operand })
}

pub fn binary(op: BinOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    Rc::new(SymExpr::Binary { op, lhs, rhs })
}

/// Render an expression to its canonical text. Fully parenthesized so the
/// rendering doubles as a structural interning key.
pub fn render(expr: &SymExpr) -> String {
    let mut out = String::new();
    render_into(expr, &mut out);
    out
}

fn render_into(expr: &SymExpr, out: &mut String) {
    match expr {
        SymExpr::Number(n) => out.push_str(&render_number(*n)),
        SymExpr::Bool(b) => {
            let _ = write!(out, "{}", b);
        }
        SymExpr::Str(s) => {
            let _ = write!(out, "\"{}\"", s);
        }
        SymExpr::Ident(name) => out.push_str(name),
        SymExpr::Unary { op, operand } => {
            out.push('(');
            out.push_str(op.symbol());
            render_into(operand, out);
            out.push(')');
        }
        SymExpr::Binary { op, lhs, rhs } => {
            out.push('(');
            render_into(lhs, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            render_into(rhs, out);
            out.push(')');
        }
    }
}

/// Collect the names of all variables referenced by an expression.
pub fn collect_idents(expr: &SymExpr, out: &mut Vec<String>) {
    match expr {
        SymExpr::Ident(name) => {
            if !out.iter().any(|n| n == name) {
                out.push(name.clone());
            }
        }
        SymExpr::Unary { operand, .. } => collect_idents(operand, out),
        SymExpr::Binary { lhs, rhs, .. } => {
            collect_idents(lhs, out);
            collect_idents(rhs, out);
        }
        _ => {}
    }
}

/// Interned expression id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Sentinel: the value had no solver-encodable symbolic form.
pub const NO_SMT: ExprId = ExprId(0);
/// Sentinel: the value was tainted by non-determinism.
pub const NO_CYCLE: ExprId = ExprId(1);

impl ExprId {
    pub fn is_sentinel(&self) -> bool {
        *self == NO_SMT || *self == NO_CYCLE
    }
}

/// Bidirectional expression interning: rendered text <-> id <-> tree.
///
/// Ids 0 and 1 are reserved for the two sentinels and never map to a tree.
pub struct ExprCache {
    by_text: HashMap<String, ExprId>,
    entries: Vec<CacheEntry>,
}

struct CacheEntry {
    text: String,
    expr: Option<ExprRef>,
}

impl ExprCache {
    pub fn new() -> Self {
        let mut cache = Self {
            by_text: HashMap::new(),
            entries: Vec::new(),
        };
        // Reserved sentinels occupy ids 0 and 1.
        cache.push_entry("<no-smt>".to_string(), None);
        cache.push_entry("<no-cycle>".to_string(), None);
        cache
    }

    fn push_entry(&mut self, text: String, expr: Option<ExprRef>) -> ExprId {
        let id = ExprId(self.entries.len() as u32);
        self.by_text.insert(text.clone(), id);
        self.entries.push(CacheEntry { text, expr });
        id
    }

    /// Intern an expression, returning the id shared by all expressions
    /// with the same rendering.
    pub fn intern(&mut self, expr: &ExprRef) -> ExprId {
        let text = render(expr);
        if let Some(id) = self.by_text.get(&text) {
            return *id;
        }
        self.push_entry(text, Some(expr.clone()))
    }

    /// The expression tree for an id. `None` for the sentinels.
    pub fn expr(&self, id: ExprId) -> Option<&ExprRef> {
        self.entries.get(id.0 as usize).and_then(|e| e.expr.as_ref())
    }

    /// The canonical text for an id.
    pub fn text(&self, id: ExprId) -> &str {
        self.entries
            .get(id.0 as usize)
            .map(|e| e.text.as_str())
            .unwrap_or("<unknown>")
    }
}

impl Default for ExprCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_structural() {
        let mut cache = ExprCache::new();
        let a = binary(BinOp::Add, ident("x"), number(1.0));
        let b = binary(BinOp::Add, ident("x"), number(1.0));
        assert_eq!(cache.intern(&a), cache.intern(&b));
        let c = binary(BinOp::Add, ident("x"), number(2.0));
        assert_ne!(cache.intern(&a), cache.intern(&c));
    }

    #[test]
    fn sentinels_are_reserved() {
        let mut cache = ExprCache::new();
        let id = cache.intern(&ident("x"));
        assert!(!id.is_sentinel());
        assert!(cache.expr(NO_SMT).is_none());
        assert!(cache.expr(NO_CYCLE).is_none());
    }

    #[test]
    fn rendering_is_fully_parenthesized() {
        let e = binary(
            BinOp::Lt,
            binary(BinOp::Add, ident("x"), number(1.0)),
            number(10.0),
        );
        assert_eq!(render(&e), "((x + 1) < 10)");
    }
}
