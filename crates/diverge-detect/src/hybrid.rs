//! The hybrid value model: every shadow value carries its concrete result
//! and, when trustworthy, a symbolic expression that denotes it.
//!
//! Invariants:
//! - the concrete half is always exactly what the real execution produces;
//! - validity only degrades: a result is never more trustworthy than the
//!   worst of its inputs.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use diverge_syntax::{BinOp, UnaryOp};

use crate::symbolic::{self, ExprRef, SymExpr};
use crate::value::Value;
use crate::EvalError;

/// Trust level of a symbolic shadow, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    /// Safe for solver use.
    Valid,
    /// Concrete-only: structurally unrepresentable for the solver.
    NoSmt,
    /// Tainted by non-determinism; unusable even for cycle comparison.
    NoCycle,
}

/// A scalar with a symbolic shadow.
#[derive(Debug, Clone)]
pub struct HybridValue {
    pub concrete: Value,
    pub symbolic: ExprRef,
    pub validity: Validity,
    /// Pre-computed negation for comparison operators, so a false branch
    /// can record `!expr` without re-deriving it.
    pub negation: Option<ExprRef>,
}

impl HybridValue {
    pub fn valid(concrete: Value, symbolic: ExprRef) -> Self {
        Self {
            concrete,
            symbolic,
            validity: Validity::Valid,
            negation: None,
        }
    }

    /// A result whose symbolic half cannot be trusted. The concrete half
    /// still must be the real value.
    pub fn invalid(concrete: Value, validity: Validity) -> Self {
        Self {
            concrete,
            symbolic: symbolic::ident("<invalid>"),
            validity,
            negation: None,
        }
    }
}

/// An array whose elements are shadow values, so element-level hybrids sit
/// in place. Shared by reference: identity is `Rc` pointer identity.
#[derive(Debug, Clone)]
pub struct HybridArray {
    pub elems: Rc<RefCell<Vec<Shadow>>>,
    pub validity: Validity,
}

impl HybridArray {
    /// Wrap elements, taking the worst validity they carry: an array is
    /// never more trustworthy than its parts.
    pub fn new(elems: Vec<Shadow>) -> Self {
        let validity = elems
            .iter()
            .map(Shadow::validity)
            .fold(Validity::Valid, Validity::max);
        Self {
            elems: Rc::new(RefCell::new(elems)),
            validity,
        }
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.elems) as usize
    }
}

/// The dual-natured value threaded through the shadow run.
#[derive(Debug, Clone)]
pub enum Shadow {
    /// A value with no symbolic shadow.
    Plain(Value),
    Hybrid(HybridValue),
    Array(HybridArray),
}

impl Shadow {
    pub fn unit() -> Self {
        Shadow::Plain(Value::Unit)
    }

    pub fn validity(&self) -> Validity {
        match self {
            Shadow::Plain(_) => Validity::Valid,
            Shadow::Hybrid(h) => h.validity,
            Shadow::Array(a) => a.validity,
        }
    }

    /// The concrete scalar, if this is not an array.
    pub fn scalar(&self) -> Option<&Value> {
        match self {
            Shadow::Plain(v) => Some(v),
            Shadow::Hybrid(h) => Some(&h.concrete),
            Shadow::Array(_) => None,
        }
    }

    pub fn is_function(&self) -> bool {
        self.scalar().is_some_and(Value::is_function)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shadow::Array(_))
    }

    /// Function display name, for oracle-name disambiguation.
    pub fn function_name(&self) -> Option<String> {
        match self.scalar()? {
            Value::Closure(c) => Some(c.name().unwrap_or_else(|| "<function>".to_string())),
            Value::Builtin(name) => Some(name.to_string()),
            _ => None,
        }
    }
}

/// Whether the value is a function or an array reachable into one.
/// Rendering collapses every closure to the same placeholder, so such
/// values cannot be compared by their canonical text.
pub fn contains_function(shadow: &Shadow) -> bool {
    let mut visited = HashSet::new();
    function_in(shadow, &mut visited)
}

fn function_in(shadow: &Shadow, visited: &mut HashSet<usize>) -> bool {
    match shadow {
        Shadow::Array(a) => {
            visited.insert(a.key())
                && a.elems.borrow().iter().any(|e| function_in(e, visited))
        }
        _ => shadow.is_function(),
    }
}

/// Render a shadow's concrete value canonically. Re-entering a circular
/// array renders the fixed placeholder `...` instead of recursing.
pub fn render_shadow(shadow: &Shadow) -> String {
    let mut visited = HashSet::new();
    render_with(shadow, &mut visited)
}

fn render_with(shadow: &Shadow, visited: &mut HashSet<usize>) -> String {
    match shadow {
        Shadow::Plain(v) => v.to_string(),
        Shadow::Hybrid(h) => h.concrete.to_string(),
        Shadow::Array(a) => {
            if !visited.insert(a.key()) {
                return "...".to_string();
            }
            let parts: Vec<String> = a
                .elems
                .borrow()
                .iter()
                .map(|e| render_with(e, visited))
                .collect();
            visited.remove(&a.key());
            format!("[{}]", parts.join(", "))
        }
    }
}

/// Lift a plain value into a hybrid tagged with an identifier expression
/// built from `name`. Functions, null/undefined, and already-hybrid values
/// pass through unchanged; array elements are wrapped in place (numeric
/// leaves only), tolerating self-referential structures.
pub fn hybridize_named(name: &str, shadow: &Shadow) -> Shadow {
    match shadow {
        Shadow::Hybrid(_) => shadow.clone(),
        Shadow::Plain(v) => match v {
            Value::Number(_) | Value::Bool(_) | Value::Str(_) => Shadow::Hybrid(
                HybridValue::valid(v.clone(), symbolic::ident(name)),
            ),
            _ => shadow.clone(),
        },
        Shadow::Array(a) => {
            let mut visited = HashSet::new();
            hybridize_array(name, a, &mut visited);
            shadow.clone()
        }
    }
}

fn hybridize_array(name: &str, array: &HybridArray, visited: &mut HashSet<usize>) {
    if !visited.insert(array.key()) {
        return;
    }
    let mut elems = array.elems.borrow_mut();
    for elem in elems.iter_mut() {
        match elem {
            Shadow::Plain(Value::Number(n)) => {
                *elem = Shadow::Hybrid(HybridValue::valid(
                    Value::Number(*n),
                    symbolic::ident(name),
                ));
            }
            Shadow::Array(inner) => hybridize_array(name, inner, visited),
            _ => {}
        }
    }
}

/// Strip the symbolic shadow from the top level only.
pub fn shallow_concretize(shadow: &Shadow) -> Shadow {
    match shadow {
        Shadow::Hybrid(h) => Shadow::Plain(h.concrete.clone()),
        _ => shadow.clone(),
    }
}

/// Strip symbolic shadows everywhere, walking arrays in place. Uses an
/// identity-keyed visited set so circular structures are walked once.
pub fn deep_concretize_in_place(shadow: &Shadow) -> Shadow {
    let top = shallow_concretize(shadow);
    if let Shadow::Array(a) = &top {
        let mut visited = HashSet::new();
        concretize_array(a, &mut visited);
    }
    top
}

fn concretize_array(array: &HybridArray, visited: &mut HashSet<usize>) {
    if !visited.insert(array.key()) {
        return;
    }
    let mut elems = array.elems.borrow_mut();
    for elem in elems.iter_mut() {
        match elem {
            Shadow::Hybrid(h) => *elem = Shadow::Plain(h.concrete.clone()),
            Shadow::Array(inner) => concretize_array(inner, visited),
            _ => {}
        }
    }
}

/// Strict equality across shadows: arrays by identity, scalars by value.
fn shadow_strict_eq(lhs: &Shadow, rhs: &Shadow) -> bool {
    match (lhs, rhs) {
        (Shadow::Array(a), Shadow::Array(b)) => Rc::ptr_eq(&a.elems, &b.elems),
        (Shadow::Array(_), _) | (_, Shadow::Array(_)) => false,
        _ => match (lhs.scalar(), rhs.scalar()) {
            (Some(a), Some(b)) => a.strict_eq(b),
            _ => false,
        },
    }
}

/// Concrete semantics of a binary operator. This is the plain evaluation
/// the real run would perform; it must never be affected by shadows.
pub fn concrete_binary(op: BinOp, lhs: &Shadow, rhs: &Shadow) -> Result<Value, EvalError> {
    if matches!(op, BinOp::Eq) {
        return Ok(Value::Bool(shadow_strict_eq(lhs, rhs)));
    }
    if matches!(op, BinOp::Neq) {
        return Ok(Value::Bool(!shadow_strict_eq(lhs, rhs)));
    }
    let (a, b) = match (lhs.scalar(), rhs.scalar()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EvalError::TypeMismatch {
                op: op.symbol(),
                found: "array",
            })
        }
    };
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(match op {
            BinOp::Add => Value::Number(x + y),
            BinOp::Sub => Value::Number(x - y),
            BinOp::Mul => Value::Number(x * y),
            BinOp::Div => Value::Number(x / y),
            BinOp::Mod => Value::Number(x % y),
            BinOp::Lt => Value::Bool(x < y),
            BinOp::Le => Value::Bool(x <= y),
            BinOp::Gt => Value::Bool(x > y),
            BinOp::Ge => Value::Bool(x >= y),
            BinOp::Eq | BinOp::Neq => unreachable!("handled above"),
        }),
        (Value::Str(x), Value::Str(y)) => match op {
            BinOp::Add => Ok(Value::str(format!("{}{}", x, y))),
            BinOp::Lt => Ok(Value::Bool(x < y)),
            BinOp::Le => Ok(Value::Bool(x <= y)),
            BinOp::Gt => Ok(Value::Bool(x > y)),
            BinOp::Ge => Ok(Value::Bool(x >= y)),
            _ => Err(EvalError::TypeMismatch {
                op: op.symbol(),
                found: "string",
            }),
        },
        (other, _) | (_, other) => Err(EvalError::TypeMismatch {
            op: op.symbol(),
            found: other.type_name(),
        }),
    }
}

/// Symbolic form of an operand, when one exists.
fn sym_of(shadow: &Shadow) -> Option<ExprRef> {
    match shadow {
        Shadow::Hybrid(h) => Some(h.symbolic.clone()),
        Shadow::Plain(Value::Number(n)) => Some(symbolic::number(*n)),
        Shadow::Plain(Value::Bool(b)) => Some(Rc::new(SymExpr::Bool(*b))),
        Shadow::Plain(Value::Str(s)) => Some(Rc::new(SymExpr::Str(s.to_string()))),
        _ => None,
    }
}

/// `!==` carries little information on its own; against the known concrete
/// ordering it refines to a strict inequality, which is strictly more
/// useful to the solver.
fn refined_neq(lhs: &Shadow, rhs: &Shadow, le: ExprRef, re: ExprRef) -> ExprRef {
    if let (Some(Value::Number(a)), Some(Value::Number(b))) = (lhs.scalar(), rhs.scalar()) {
        if a < b {
            return symbolic::binary(BinOp::Lt, le, re);
        }
        if a > b {
            return symbolic::binary(BinOp::Gt, le, re);
        }
    }
    symbolic::binary(BinOp::Neq, le, re)
}

/// Evaluate a binary operator over shadows: concrete semantics always,
/// symbolic combination when both sides are trustworthy.
pub fn evaluate_binary(op: BinOp, lhs: &Shadow, rhs: &Shadow) -> Result<Shadow, EvalError> {
    let concrete = concrete_binary(op, lhs, rhs)?;
    let worst = lhs.validity().max(rhs.validity());

    let symbolic_involved = matches!(lhs, Shadow::Hybrid(_)) || matches!(rhs, Shadow::Hybrid(_));
    if !symbolic_involved {
        if worst == Validity::Valid {
            return Ok(Shadow::Plain(concrete));
        }
        return Ok(Shadow::Hybrid(HybridValue::invalid(concrete, worst)));
    }
    if worst != Validity::Valid {
        return Ok(Shadow::Hybrid(HybridValue::invalid(concrete, worst)));
    }

    let (le, re) = match (sym_of(lhs), sym_of(rhs)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            // One side is an array or function: no symbolic combination.
            return Ok(Shadow::Hybrid(HybridValue::invalid(
                concrete,
                Validity::NoSmt,
            )));
        }
    };

    let (expr, negation) = match op {
        BinOp::Eq => {
            let eq = symbolic::binary(BinOp::Eq, le.clone(), re.clone());
            (eq, Some(refined_neq(lhs, rhs, le, re)))
        }
        BinOp::Neq => {
            let eq = symbolic::binary(BinOp::Eq, le.clone(), re.clone());
            (refined_neq(lhs, rhs, le, re), Some(eq))
        }
        BinOp::Lt => (
            symbolic::binary(BinOp::Lt, le.clone(), re.clone()),
            Some(symbolic::binary(BinOp::Ge, le, re)),
        ),
        BinOp::Le => (
            symbolic::binary(BinOp::Le, le.clone(), re.clone()),
            Some(symbolic::binary(BinOp::Gt, le, re)),
        ),
        BinOp::Gt => (
            symbolic::binary(BinOp::Gt, le.clone(), re.clone()),
            Some(symbolic::binary(BinOp::Le, le, re)),
        ),
        BinOp::Ge => (
            symbolic::binary(BinOp::Ge, le.clone(), re.clone()),
            Some(symbolic::binary(BinOp::Lt, le, re)),
        ),
        _ => (symbolic::binary(op, le, re), None),
    };

    Ok(Shadow::Hybrid(HybridValue {
        concrete,
        symbolic: expr,
        validity: Validity::Valid,
        negation,
    }))
}

/// Evaluate a unary operator over a shadow.
pub fn evaluate_unary(op: UnaryOp, operand: &Shadow) -> Result<Shadow, EvalError> {
    let concrete = match (op, operand.scalar()) {
        (UnaryOp::Not, Some(Value::Bool(b))) => Value::Bool(!b),
        (UnaryOp::Neg, Some(Value::Number(n))) => Value::Number(-n),
        (_, Some(v)) => {
            return Err(EvalError::TypeMismatch {
                op: op.symbol(),
                found: v.type_name(),
            })
        }
        (_, None) => {
            return Err(EvalError::TypeMismatch {
                op: op.symbol(),
                found: "array",
            })
        }
    };

    match operand {
        Shadow::Hybrid(h) if h.validity == Validity::Valid => {
            let (expr, negation) = match op {
                // `!` swaps the condition with its pre-computed negation.
                UnaryOp::Not => (
                    h.negation
                        .clone()
                        .unwrap_or_else(|| symbolic::unary(UnaryOp::Not, h.symbolic.clone())),
                    Some(h.symbolic.clone()),
                ),
                UnaryOp::Neg => (symbolic::unary(UnaryOp::Neg, h.symbolic.clone()), None),
            };
            Ok(Shadow::Hybrid(HybridValue {
                concrete,
                symbolic: expr,
                validity: Validity::Valid,
                negation,
            }))
        }
        Shadow::Hybrid(h) => Ok(Shadow::Hybrid(HybridValue::invalid(concrete, h.validity))),
        Shadow::Plain(_) => Ok(Shadow::Plain(concrete)),
        Shadow::Array(_) => unreachable!("array operands rejected above"),
    }
}
