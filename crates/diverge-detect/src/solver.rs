//! Inductive goals for the termination oracle and their Z3 discharge.
//!
//! A goal claims that one iteration of a loop re-establishes its own path
//! condition: `facts and path(v) and v' = update(v) implies path(v')`. We
//! prove validity by asserting the hypotheses together with the negated
//! conclusion and asking for unsatisfiability. Everything is encoded over
//! integers; any construct outside that fragment (division, fractional
//! constants, strings) makes the goal `NotProven`, never wrong.

use std::fmt::Write as _;

use diverge_syntax::{BinOp, UnaryOp};
use thiserror::Error;
use tracing::{debug, trace};
use z3::ast::{Bool, Int};
use z3::{SatResult, Solver};

use crate::symbolic::{self, ExprRef, SymExpr};
use crate::value::render_number;

/// Per-goal solver budget. Small on purpose: goals here are tiny, and an
/// unresponsive solver must not eat the analysis wall clock.
const SOLVE_BUDGET_MS: u64 = 1000;

/// A concrete observation about one variable, inferred from the recorded
/// iteration history and safe to assume as a hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub enum Fact {
    /// The variable held this exact value in every recorded iteration.
    Constant(String, f64),
    /// Strictly positive in every recorded iteration.
    Positive(String),
    /// Strictly negative in every recorded iteration.
    Negative(String),
}

/// One inductive proof obligation.
#[derive(Debug, Clone)]
pub struct Goal {
    /// Variables quantified over, in first-seen order.
    pub vars: Vec<String>,
    pub facts: Vec<Fact>,
    /// Conjunction of path conditions over the unprimed variables.
    pub path: Vec<ExprRef>,
    /// Per-variable update expressions defining the primed variables.
    pub updates: Vec<(String, ExprRef)>,
}

/// Outcome of a proof attempt. `NotProven` covers refutation, unknown,
/// timeout, and unencodable goals alike: only `Valid` is actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverVerdict {
    Valid,
    NotProven,
}

#[derive(Debug, Error)]
enum EncodeError {
    #[error("non-integral constant {0}")]
    NonIntegral(f64),
    #[error("unsupported construct: {0}")]
    Unsupported(&'static str),
    #[error("sort mismatch: expected {0}")]
    Sort(&'static str),
}

/// Assemble a goal from recorded path conditions and updates. Variables
/// that appear in the path but have no recorded update are carried over
/// unchanged, so the conclusion still ranges over all of them.
pub fn build_goal(path: Vec<ExprRef>, updates: Vec<(String, ExprRef)>, facts: Vec<Fact>) -> Goal {
    let mut vars = Vec::new();
    for expr in &path {
        symbolic::collect_idents(expr, &mut vars);
    }
    let mut updates = updates;
    for (_, expr) in &updates {
        symbolic::collect_idents(expr, &mut vars);
    }
    for var in &vars {
        if !updates.iter().any(|(name, _)| name == var) {
            updates.push((var.clone(), symbolic::ident(var.clone())));
        }
    }
    Goal {
        vars,
        facts,
        path,
        updates,
    }
}

/// Render the goal in the surface syntax, for logs and diagnostics.
pub fn render_goal(goal: &Goal) -> String {
    let mut out = String::from("goal g_1: forall ");
    for (i, var) in goal.vars.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}, {}'", var, var);
    }
    out.push_str(": int. ");

    let mut hyps: Vec<String> = Vec::new();
    for fact in &goal.facts {
        hyps.push(match fact {
            Fact::Constant(name, v) => format!("({} === {})", name, render_number(*v)),
            Fact::Positive(name) => format!("({} > 0)", name),
            Fact::Negative(name) => format!("({} < 0)", name),
        });
    }
    for expr in &goal.path {
        hyps.push(symbolic::render(expr));
    }
    for (name, expr) in &goal.updates {
        hyps.push(format!("({}' === {})", name, symbolic::render(expr)));
    }
    out.push_str(&hyps.join(" and "));
    out.push_str(" => ");

    let conclusion: Vec<String> = goal.path.iter().map(|e| render_primed(e)).collect();
    out.push_str(&conclusion.join(" and "));
    out
}

fn render_primed(expr: &SymExpr) -> String {
    match expr {
        SymExpr::Ident(name) => format!("{}'", name),
        SymExpr::Unary { op, operand } => format!("({}{})", op.symbol(), render_primed(operand)),
        SymExpr::Binary { op, lhs, rhs } => format!(
            "({} {} {})",
            render_primed(lhs),
            op.symbol(),
            render_primed(rhs)
        ),
        other => symbolic::render(other),
    }
}

enum Term {
    Int(Int),
    Bool(Bool),
}

impl Term {
    fn int(self) -> Result<Int, EncodeError> {
        match self {
            Term::Int(i) => Ok(i),
            Term::Bool(_) => Err(EncodeError::Sort("int")),
        }
    }

    fn bool(self) -> Result<Bool, EncodeError> {
        match self {
            Term::Bool(b) => Ok(b),
            Term::Int(_) => Err(EncodeError::Sort("bool")),
        }
    }
}

/// Encode over integer constants; `primed` switches identifiers to their
/// post-iteration counterparts.
fn encode(expr: &SymExpr, primed: bool) -> Result<Term, EncodeError> {
    match expr {
        SymExpr::Number(n) => {
            if n.fract() != 0.0 || !n.is_finite() {
                return Err(EncodeError::NonIntegral(*n));
            }
            Ok(Term::Int(Int::from_i64(*n as i64)))
        }
        SymExpr::Bool(b) => Ok(Term::Bool(Bool::from_bool(*b))),
        SymExpr::Str(_) => Err(EncodeError::Unsupported("string")),
        SymExpr::Ident(name) => Ok(Term::Int(Int::new_const(const_name(name, primed)))),
        SymExpr::Unary { op, operand } => {
            let inner = encode(operand, primed)?;
            match op {
                UnaryOp::Not => Ok(Term::Bool(inner.bool()?.not())),
                UnaryOp::Neg => Ok(Term::Int(Int::sub(&[Int::from_i64(0), inner.int()?]))),
            }
        }
        SymExpr::Binary { op, lhs, rhs } => {
            let l = encode(lhs, primed)?;
            let r = encode(rhs, primed)?;
            match op {
                BinOp::Add => Ok(Term::Int(Int::add(&[l.int()?, r.int()?]))),
                BinOp::Sub => Ok(Term::Int(Int::sub(&[l.int()?, r.int()?]))),
                BinOp::Mul => Ok(Term::Int(Int::mul(&[l.int()?, r.int()?]))),
                BinOp::Div => Err(EncodeError::Unsupported("division")),
                BinOp::Mod => Err(EncodeError::Unsupported("modulo")),
                BinOp::Lt => Ok(Term::Bool(l.int()?.lt(&r.int()?))),
                BinOp::Le => Ok(Term::Bool(l.int()?.le(&r.int()?))),
                BinOp::Gt => Ok(Term::Bool(l.int()?.gt(&r.int()?))),
                BinOp::Ge => Ok(Term::Bool(l.int()?.ge(&r.int()?))),
                BinOp::Eq => Ok(Term::Bool(l.int()?.eq(&r.int()?))),
                BinOp::Neq => Ok(Term::Bool(l.int()?.eq(&r.int()?).not())),
            }
        }
    }
}

fn const_name(name: &str, primed: bool) -> String {
    if primed {
        format!("{}'", name)
    } else {
        name.to_string()
    }
}

fn encode_fact(fact: &Fact) -> Result<Bool, EncodeError> {
    match fact {
        Fact::Constant(name, v) => {
            if v.fract() != 0.0 || !v.is_finite() {
                return Err(EncodeError::NonIntegral(*v));
            }
            Ok(Int::new_const(name.as_str()).eq(&Int::from_i64(*v as i64)))
        }
        Fact::Positive(name) => Ok(Int::new_const(name.as_str()).gt(&Int::from_i64(0))),
        Fact::Negative(name) => Ok(Int::new_const(name.as_str()).lt(&Int::from_i64(0))),
    }
}

/// Attempt the proof. `Valid` means Z3 found the negated goal
/// unsatisfiable; everything else is `NotProven`.
pub fn prove(goal: &Goal) -> SolverVerdict {
    trace!(goal = %render_goal(goal), "discharging goal");
    match try_prove(goal) {
        Ok(verdict) => verdict,
        Err(reason) => {
            debug!(%reason, "goal not encodable");
            SolverVerdict::NotProven
        }
    }
}

fn try_prove(goal: &Goal) -> Result<SolverVerdict, EncodeError> {
    z3::set_global_param("timeout", &SOLVE_BUDGET_MS.to_string());
    let solver = Solver::new();

    for fact in &goal.facts {
        solver.assert(&encode_fact(fact)?);
    }
    for expr in &goal.path {
        solver.assert(&encode(expr, false)?.bool()?);
    }
    for (name, expr) in &goal.updates {
        let primed = Int::new_const(const_name(name, true));
        solver.assert(&primed.eq(&encode(expr, false)?.int()?));
    }

    let mut conclusion = Vec::with_capacity(goal.path.len());
    for expr in &goal.path {
        conclusion.push(encode(expr, true)?.bool()?);
    }
    solver.assert(&Bool::and(&conclusion).not());

    match solver.check() {
        SatResult::Unsat => Ok(SolverVerdict::Valid),
        SatResult::Sat | SatResult::Unknown => Ok(SolverVerdict::NotProven),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diverge_syntax::BinOp;

    fn gt_zero(name: &str) -> ExprRef {
        symbolic::binary(BinOp::Gt, symbolic::ident(name), symbolic::number(0.0))
    }

    fn plus_one(name: &str) -> ExprRef {
        symbolic::binary(BinOp::Add, symbolic::ident(name), symbolic::number(1.0))
    }

    #[test]
    fn renders_in_surface_syntax() {
        let goal = build_goal(
            vec![gt_zero("x")],
            vec![("x".to_string(), plus_one("x"))],
            vec![],
        );
        assert_eq!(
            render_goal(&goal),
            "goal g_1: forall x, x': int. (x > 0) and (x' === (x + 1)) => (x' > 0)"
        );
    }

    #[test]
    fn unupdated_path_variables_carry_over() {
        let goal = build_goal(
            vec![symbolic::binary(
                BinOp::Lt,
                symbolic::ident("i"),
                symbolic::ident("n"),
            )],
            vec![("i".to_string(), plus_one("i"))],
            vec![],
        );
        assert!(goal
            .updates
            .iter()
            .any(|(name, expr)| name == "n" && symbolic::render(expr) == "n"));
    }

    #[test]
    fn increment_preserves_positivity() {
        let goal = build_goal(
            vec![gt_zero("x")],
            vec![("x".to_string(), plus_one("x"))],
            vec![],
        );
        assert_eq!(prove(&goal), SolverVerdict::Valid);
    }

    #[test]
    fn bounded_counter_is_not_proven() {
        // i < n with i := i + 1 eventually fails, so the goal is invalid.
        let goal = build_goal(
            vec![symbolic::binary(
                BinOp::Lt,
                symbolic::ident("i"),
                symbolic::ident("n"),
            )],
            vec![("i".to_string(), plus_one("i"))],
            vec![],
        );
        assert_eq!(prove(&goal), SolverVerdict::NotProven);
    }

    #[test]
    fn sign_fact_strengthens_the_goal() {
        // x !== 0 with x := x + 1 is invalid alone (x = -1 breaks it) but
        // valid under the hypothesis that x stays positive.
        let neq_zero = symbolic::binary(BinOp::Neq, symbolic::ident("x"), symbolic::number(0.0));
        let plain = build_goal(
            vec![neq_zero.clone()],
            vec![("x".to_string(), plus_one("x"))],
            vec![],
        );
        assert_eq!(prove(&plain), SolverVerdict::NotProven);

        let strengthened = build_goal(
            vec![neq_zero],
            vec![("x".to_string(), plus_one("x"))],
            vec![Fact::Positive("x".to_string())],
        );
        assert_eq!(prove(&strengthened), SolverVerdict::Valid);
    }

    #[test]
    fn fractional_constants_are_not_encodable() {
        let goal = build_goal(
            vec![symbolic::binary(
                BinOp::Gt,
                symbolic::ident("x"),
                symbolic::number(0.5),
            )],
            vec![("x".to_string(), plus_one("x"))],
            vec![],
        );
        assert_eq!(prove(&goal), SolverVerdict::NotProven);
    }
}
