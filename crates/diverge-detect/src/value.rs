//! Concrete scalar values of the shadow run.
//!
//! Arrays live on the shadow side (`hybrid::HybridArray`) so that element
//! hybrids can sit in place; `Value` covers everything with scalar identity.

use std::fmt;
use std::rc::Rc;

use crate::shadow::Closure;

/// A concrete scalar value. This is always exactly the value the real
/// execution would have produced at the same point.
#[derive(Debug, Clone)]
pub enum Value {
    /// `undefined`: the result of value-less returns and bare blocks.
    Unit,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    /// A user function (declaration or lambda).
    Closure(Rc<Closure>),
    /// A prepared builtin, identified by table name.
    Builtin(Rc<str>),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Builtin(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Closure(_) | Value::Builtin(_) => "function",
        }
    }

    /// Strict equality (`===`) on scalars. Functions compare by identity.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_eq(other)
    }
}

/// Render a number the way the teaching language prints it: integral
/// values without a fractional part.
pub fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", render_number(*n)),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Closure(c) => match c.name() {
                Some(name) => write!(f, "<function {}>", name),
                None => write!(f, "<function>"),
            },
            Value::Builtin(name) => write!(f, "<builtin {}>", name),
        }
    }
}
