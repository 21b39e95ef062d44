//! Prepared builtins for the shadow run.
//!
//! Every builtin the instrumented program can reach is wrapped so that its
//! result carries honest validity: unmodeled computations poison to
//! `NoSmt`, non-deterministic ones to `NoCycle`, and the two introspection
//! special cases (`is_null`-style predicates, `display`) reproduce their
//! observable behavior without creating symbolic information.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::hybrid::{
    deep_concretize_in_place, render_shadow, HybridArray, HybridValue, Shadow, Validity,
};
use crate::state::State;
use crate::value::Value;
use crate::EvalError;

/// Handler variant for a prepared builtin; resolved once when the table
/// is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Operates on the shadow structure itself (pairs, lists); results
    /// keep the validity their parts already carry.
    Structural,
    /// Unmodeled scalar computation: result degrades to `NoSmt`.
    Opaque,
    /// Non-deterministic: result degrades to `NoCycle`.
    Nondet,
    /// `is_null`/`is_pair`: plain boolean, drives the stream heuristic.
    IsNull,
    /// `display`: passes its argument through unchanged.
    Display,
}

/// One table entry. `arity` of `None` means variadic.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub kind: BuiltinKind,
    pub arity: Option<usize>,
}

const TABLE: &[BuiltinDef] = &[
    BuiltinDef { name: "pair", kind: BuiltinKind::Structural, arity: Some(2) },
    BuiltinDef { name: "head", kind: BuiltinKind::Structural, arity: Some(1) },
    BuiltinDef { name: "tail", kind: BuiltinKind::Structural, arity: Some(1) },
    BuiltinDef { name: "list", kind: BuiltinKind::Structural, arity: None },
    BuiltinDef { name: "error", kind: BuiltinKind::Structural, arity: Some(1) },
    BuiltinDef { name: "is_null", kind: BuiltinKind::IsNull, arity: Some(1) },
    BuiltinDef { name: "is_pair", kind: BuiltinKind::IsNull, arity: Some(1) },
    BuiltinDef { name: "display", kind: BuiltinKind::Display, arity: Some(1) },
    BuiltinDef { name: "math_abs", kind: BuiltinKind::Opaque, arity: Some(1) },
    BuiltinDef { name: "math_floor", kind: BuiltinKind::Opaque, arity: Some(1) },
    BuiltinDef { name: "math_ceil", kind: BuiltinKind::Opaque, arity: Some(1) },
    BuiltinDef { name: "math_sqrt", kind: BuiltinKind::Opaque, arity: Some(1) },
    BuiltinDef { name: "math_pow", kind: BuiltinKind::Opaque, arity: Some(2) },
    BuiltinDef { name: "math_random", kind: BuiltinKind::Nondet, arity: Some(0) },
    BuiltinDef { name: "get_time", kind: BuiltinKind::Nondet, arity: Some(0) },
];

/// The full prepared table.
pub fn table() -> &'static [BuiltinDef] {
    TABLE
}

pub fn lookup(name: &str) -> Option<&'static BuiltinDef> {
    TABLE.iter().find(|def| def.name == name)
}

/// A pair whose tail is a thunk: the shape of a lazily-produced sequence.
fn is_lazy_pair(shadow: &Shadow) -> bool {
    match shadow {
        Shadow::Array(a) => {
            let elems = a.elems.borrow();
            elems.len() == 2 && elems[1].is_function()
        }
        _ => false,
    }
}

/// Invoke a prepared builtin.
pub fn apply(state: &mut State, def: &BuiltinDef, args: &[Shadow]) -> Result<Shadow, EvalError> {
    if let Some(expected) = def.arity {
        if args.len() != expected {
            return Err(EvalError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }
    }
    match def.kind {
        BuiltinKind::Structural => structural(def.name, args),
        BuiltinKind::Opaque => opaque(def.name, args),
        BuiltinKind::Nondet => nondet(def.name, args),
        BuiltinKind::IsNull => predicate(state, def.name, &args[0]),
        BuiltinKind::Display => {
            let concrete = deep_concretize_in_place(&args[0]);
            debug!(value = %render_shadow(&concrete), "display");
            Ok(args[0].clone())
        }
    }
}

fn structural(name: &str, args: &[Shadow]) -> Result<Shadow, EvalError> {
    match name {
        "pair" => Ok(Shadow::Array(HybridArray::new(vec![
            args[0].clone(),
            args[1].clone(),
        ]))),
        "head" | "tail" => {
            let Shadow::Array(a) = &args[0] else {
                return Err(EvalError::TypeMismatch {
                    op: if name == "head" { "head" } else { "tail" },
                    found: args[0].scalar().map_or("array", Value::type_name),
                });
            };
            let elems = a.elems.borrow();
            if elems.len() != 2 {
                return Err(EvalError::TypeMismatch {
                    op: if name == "head" { "head" } else { "tail" },
                    found: "array",
                });
            }
            Ok(elems[if name == "head" { 0 } else { 1 }].clone())
        }
        "list" => {
            let mut acc = Shadow::Plain(Value::Null);
            for arg in args.iter().rev() {
                acc = Shadow::Array(HybridArray::new(vec![arg.clone(), acc]));
            }
            Ok(acc)
        }
        "error" => {
            let msg = match args[0].scalar() {
                Some(Value::Str(s)) => s.to_string(),
                _ => render_shadow(&args[0]),
            };
            Err(EvalError::Program(msg))
        }
        _ => Err(EvalError::NotAFunction),
    }
}

/// Worst validity across arguments, floored at `floor`.
fn poisoned(floor: Validity, args: &[Shadow]) -> Validity {
    args.iter()
        .map(Shadow::validity)
        .fold(floor, |acc, v| acc.max(v))
}

fn opaque(name: &str, args: &[Shadow]) -> Result<Shadow, EvalError> {
    let mut nums = Vec::with_capacity(args.len());
    for arg in args {
        match arg.scalar().and_then(Value::as_number) {
            Some(n) => nums.push(n),
            None => {
                return Err(EvalError::TypeMismatch {
                    op: "math builtin",
                    found: arg.scalar().map_or("array", Value::type_name),
                })
            }
        }
    }
    let result = match name {
        "math_abs" => nums[0].abs(),
        "math_floor" => nums[0].floor(),
        "math_ceil" => nums[0].ceil(),
        "math_sqrt" => nums[0].sqrt(),
        "math_pow" => nums[0].powf(nums[1]),
        _ => return Err(EvalError::NotAFunction),
    };
    Ok(Shadow::Hybrid(HybridValue::invalid(
        Value::Number(result),
        poisoned(Validity::NoSmt, args),
    )))
}

fn nondet(name: &str, args: &[Shadow]) -> Result<Shadow, EvalError> {
    let result = match name {
        "math_random" => rand::random::<f64>(),
        "get_time" => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0),
        _ => return Err(EvalError::NotAFunction),
    };
    Ok(Shadow::Hybrid(HybridValue::invalid(
        Value::Number(result),
        poisoned(Validity::NoCycle, args),
    )))
}

/// `is_null` / `is_pair`. Returns a plain (never symbolic) boolean, and
/// counts predicate checks on lazily-produced pairs: past the stream
/// threshold the run flips to stream mode.
fn predicate(state: &mut State, name: &str, arg: &Shadow) -> Result<Shadow, EvalError> {
    if is_lazy_pair(arg) {
        state.stream_counter += 1;
        if state.stream_counter >= state.config.stream_threshold && !state.stream_mode {
            debug!(checks = state.stream_counter, "entering stream mode");
            state.stream_mode = true;
        }
    }
    let result = match name {
        "is_null" => matches!(arg, Shadow::Plain(Value::Null)),
        "is_pair" => matches!(arg, Shadow::Array(a) if a.elems.borrow().len() == 2),
        _ => return Err(EvalError::NotAFunction),
    };
    Ok(Shadow::Plain(Value::Bool(result)))
}
