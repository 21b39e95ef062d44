//! Abstract syntax tree for the restricted teaching language.
//!
//! The language is the subset reachable through the instrumentor: numbers,
//! booleans, strings, `null`, arrays, first-class functions, conditionals,
//! `while`/`for` loops, and assignment. Anything outside this subset is the
//! host toolchain's concern.

use crate::span::Span;

/// A program: the top-level statement sequence of one evaluated snippet.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

impl Program {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// A statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `function NAME(params) { body }`
    FnDecl(FnDecl),
    /// `let NAME = expr;` (also used for `const`)
    Let { name: String, init: Expr, span: Span },
    /// `NAME = expr;`
    Assign { name: String, value: Expr, span: Span },
    /// `return expr;` / `return;`
    Return { value: Option<Expr>, span: Span },
    /// `if (cond) { then } else { alt }`
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
        span: Span,
    },
    /// `while (cond) { body }`
    While {
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `for (init; cond; update) { body }`
    For {
        init: Box<Stmt>,
        cond: Expr,
        update: Box<Stmt>,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `break;`
    Break { span: Span },
    /// `continue;`
    Continue { span: Span },
    /// A bare expression statement.
    Expr { expr: Expr, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::FnDecl(d) => d.span,
            Stmt::Let { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Expr { span, .. } => *span,
        }
    }
}

/// `function NAME(params) { body }`
#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// An expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Number { value: f64, span: Span },
    Bool { value: bool, span: Span },
    Str { value: String, span: Span },
    Null { span: Span },
    Undefined { span: Span },
    Ident { name: String, span: Span },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    /// `lhs && rhs` / `lhs || rhs` (short-circuiting).
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    /// `cond ? then : alt`
    Cond {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
        span: Span,
    },
    /// `callee(args)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    /// `(params) => body` / `(params) => { stmts }`
    Lambda {
        params: Vec<String>,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `[e0, e1, ...]`
    Array { elems: Vec<Expr>, span: Span },
    /// `base[index]`
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Number { span, .. }
            | Expr::Bool { span, .. }
            | Expr::Str { span, .. }
            | Expr::Null { span }
            | Expr::Undefined { span }
            | Expr::Ident { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Logical { span, .. }
            | Expr::Cond { span, .. }
            | Expr::Call { span, .. }
            | Expr::Lambda { span, .. }
            | Expr::Array { span, .. }
            | Expr::Index { span, .. } => *span,
        }
    }
}

/// Binary operators (strict equality only; the instrumentor never emits
/// loose equality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Source rendering of the operator.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "===",
            BinOp::Neq => "!==",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
        }
    }
}

/// Short-circuiting logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
}
