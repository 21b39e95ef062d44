//! Programmatic AST constructors.
//!
//! Embedders (the REPL driver, the detector's prelude, tests) assemble
//! programs through these instead of going through the parser. All nodes
//! carry the default span.

use crate::ast::*;
use crate::span::Span;

pub fn program(stmts: Vec<Stmt>) -> Program {
    Program::new(stmts)
}

// === Expressions ===

pub fn num(value: f64) -> Expr {
    Expr::Number {
        value,
        span: Span::default(),
    }
}

pub fn boolean(value: bool) -> Expr {
    Expr::Bool {
        value,
        span: Span::default(),
    }
}

pub fn string(value: impl Into<String>) -> Expr {
    Expr::Str {
        value: value.into(),
        span: Span::default(),
    }
}

pub fn null() -> Expr {
    Expr::Null {
        span: Span::default(),
    }
}

pub fn ident(name: impl Into<String>) -> Expr {
    Expr::Ident {
        name: name.into(),
        span: Span::default(),
    }
}

pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        span: Span::default(),
    }
}

pub fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Logical {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        span: Span::default(),
    }
}

pub fn cond(c: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
    Expr::Cond {
        cond: Box::new(c),
        then_branch: Box::new(then_branch),
        else_branch: Box::new(else_branch),
        span: Span::default(),
    }
}

pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
        span: Span::default(),
    }
}

/// `callee(args)` with an identifier callee.
pub fn call_named(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
    call(ident(callee), args)
}

pub fn lambda(params: Vec<&str>, body: Vec<Stmt>) -> Expr {
    Expr::Lambda {
        params: params.into_iter().map(String::from).collect(),
        body,
        span: Span::default(),
    }
}

/// `(params) => expr`
pub fn lambda_expr(params: Vec<&str>, body: Expr) -> Expr {
    lambda(params, vec![ret(Some(body))])
}

pub fn array(elems: Vec<Expr>) -> Expr {
    Expr::Array {
        elems,
        span: Span::default(),
    }
}

pub fn index(base: Expr, idx: Expr) -> Expr {
    Expr::Index {
        base: Box::new(base),
        index: Box::new(idx),
        span: Span::default(),
    }
}

// === Statements ===

pub fn fn_decl(name: impl Into<String>, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
    Stmt::FnDecl(FnDecl {
        name: name.into(),
        params: params.into_iter().map(String::from).collect(),
        body,
        span: Span::default(),
    })
}

pub fn let_(name: impl Into<String>, init: Expr) -> Stmt {
    Stmt::Let {
        name: name.into(),
        init,
        span: Span::default(),
    }
}

pub fn assign(name: impl Into<String>, value: Expr) -> Stmt {
    Stmt::Assign {
        name: name.into(),
        value,
        span: Span::default(),
    }
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return {
        value,
        span: Span::default(),
    }
}

pub fn if_(c: Expr, then_branch: Vec<Stmt>, else_branch: Vec<Stmt>) -> Stmt {
    Stmt::If {
        cond: c,
        then_branch,
        else_branch,
        span: Span::default(),
    }
}

pub fn while_(c: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::While {
        cond: c,
        body,
        span: Span::default(),
    }
}

pub fn for_(init: Stmt, c: Expr, update: Stmt, body: Vec<Stmt>) -> Stmt {
    Stmt::For {
        init: Box::new(init),
        cond: c,
        update: Box::new(update),
        body,
        span: Span::default(),
    }
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expr {
        expr,
        span: Span::default(),
    }
}
