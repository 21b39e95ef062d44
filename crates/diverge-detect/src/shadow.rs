//! The instrumented shadow evaluator.
//!
//! Executes the AST directly while firing the runtime hooks at the
//! instrumentation points: variable reads and writes, every boolean
//! condition, and function/loop boundaries. The concrete half of every
//! shadow value is exactly what the real evaluator would compute, so the
//! run is observationally transparent; only the symbolic bookkeeping and
//! the possibility of an early [`Interrupt`] distinguish it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use diverge_syntax::{Expr, FnDecl, LogicalOp, Program, Span, Stmt};

use crate::builtins;
use crate::hooks;
use crate::hybrid::{self, HybridArray, Shadow};
use crate::state::State;
use crate::value::Value;
use crate::{DetectorConfig, EvalError, Interrupt};

/// A user function value: declaration or lambda.
pub struct Closure {
    name: RefCell<Option<String>>,
    pub params: Vec<String>,
    pub body: Rc<Vec<Stmt>>,
    pub env: Rc<Env>,
    pub span: Span,
}

impl Closure {
    pub fn name(&self) -> Option<String> {
        self.name.borrow().clone()
    }

    /// Name a previously anonymous function (`let f = x => ...`).
    fn christen(&self, name: &str) {
        let mut slot = self.name.borrow_mut();
        if slot.is_none() {
            *slot = Some(name.to_string());
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Closure({})", name),
            None => write!(f, "Closure(<anonymous>)"),
        }
    }
}

/// Lexical environment for shadow values.
pub struct Env {
    vars: RefCell<HashMap<String, Shadow>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn root() -> Rc<Env> {
        Rc::new(Env {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Rc<Env>) -> Rc<Env> {
        Rc::new(Env {
            vars: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn define(&self, name: &str, shadow: Shadow) {
        self.vars.borrow_mut().insert(name.to_string(), shadow);
    }

    pub fn lookup(&self, name: &str) -> Option<Shadow> {
        if let Some(shadow) = self.vars.borrow().get(name) {
            return Some(shadow.clone());
        }
        self.parent.as_ref()?.lookup(name)
    }

    /// Overwrite an existing binding wherever it was defined.
    pub fn set_existing(&self, name: &str, shadow: Shadow) -> bool {
        if self.vars.borrow().contains_key(name) {
            self.vars.borrow_mut().insert(name.to_string(), shadow);
            return true;
        }
        match &self.parent {
            Some(parent) => parent.set_existing(name, shadow),
            None => false,
        }
    }
}

/// Statement outcome inside a block.
enum Flow {
    Normal,
    Return(Shadow),
    Break,
    Continue,
}

/// One shadow execution, owning its [`State`] for the whole run.
pub struct ShadowRun {
    pub state: State,
    depth: usize,
}

impl ShadowRun {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            state: State::new(config),
            depth: 0,
        }
    }

    /// Build the global environment with the prepared builtins bound.
    pub fn globals(&self) -> Rc<Env> {
        let env = Env::root();
        for def in builtins::table() {
            env.define(def.name, Shadow::Plain(Value::Builtin(def.name.into())));
        }
        env
    }

    /// Execute one program in `env`. `Ok(())` means it ran to completion
    /// without a verdict.
    pub fn run_program(&mut self, env: &Rc<Env>, program: &Program) -> Result<(), Interrupt> {
        self.exec_block(env, &program.stmts)?;
        Ok(())
    }

    /// Hoist function declarations, then run the statements in order.
    fn exec_block(&mut self, env: &Rc<Env>, stmts: &[Stmt]) -> Result<Flow, Interrupt> {
        for stmt in stmts {
            if let Stmt::FnDecl(decl) = stmt {
                self.declare_function(env, decl);
            }
        }
        for stmt in stmts {
            match self.exec_stmt(env, stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn declare_function(&mut self, env: &Rc<Env>, decl: &FnDecl) {
        let closure = Closure {
            name: RefCell::new(Some(decl.name.clone())),
            params: decl.params.clone(),
            body: Rc::new(decl.body.clone()),
            env: env.clone(),
            span: decl.span,
        };
        env.define(&decl.name, Shadow::Plain(Value::Closure(Rc::new(closure))));
    }

    fn exec_stmt(&mut self, env: &Rc<Env>, stmt: &Stmt) -> Result<Flow, Interrupt> {
        match stmt {
            // Bound during hoisting.
            Stmt::FnDecl(_) => Ok(Flow::Normal),

            Stmt::Let { name, init, .. } => {
                let shadow = self.eval(env, init)?;
                if let Some(Value::Closure(c)) = shadow.scalar() {
                    c.christen(name);
                }
                hooks::write_variable(&mut self.state, name, &shadow);
                env.define(name, shadow);
                Ok(Flow::Normal)
            }

            Stmt::Assign { name, value, .. } => {
                let shadow = self.eval(env, value)?;
                hooks::write_variable(&mut self.state, name, &shadow);
                if !env.set_existing(name, shadow) {
                    return Err(EvalError::UnboundVariable(name.clone()).into());
                }
                Ok(Flow::Normal)
            }

            Stmt::Return { value, .. } => {
                let shadow = match value {
                    Some(expr) => self.eval(env, expr)?,
                    None => Shadow::unit(),
                };
                Ok(Flow::Return(shadow))
            }

            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let c = self.eval(env, cond)?;
                if hooks::test_condition(&mut self.state, &c)? {
                    self.exec_block(&Env::child(env), then_branch)
                } else {
                    self.exec_block(&Env::child(env), else_branch)
                }
            }

            Stmt::While { cond, body, span } => {
                hooks::enter_loop(&mut self.state, *span)?;
                let flow = self.run_while(env, cond, body, *span)?;
                hooks::exit_loop(&mut self.state);
                Ok(flow)
            }

            Stmt::For {
                init,
                cond,
                update,
                body,
                span,
            } => {
                let scope = Env::child(env);
                match self.exec_stmt(&scope, init)? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
                hooks::enter_loop(&mut self.state, *span)?;
                let flow = self.run_for(&scope, cond, update, body, *span)?;
                hooks::exit_loop(&mut self.state);
                Ok(flow)
            }

            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),

            Stmt::Expr { expr, .. } => {
                self.eval(env, expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn run_while(
        &mut self,
        env: &Rc<Env>,
        cond: &Expr,
        body: &[Stmt],
        span: Span,
    ) -> Result<Flow, Interrupt> {
        loop {
            let c = self.eval(env, cond)?;
            if !hooks::test_condition(&mut self.state, &c)? {
                return Ok(Flow::Normal);
            }
            match self.exec_block(&Env::child(env), body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            hooks::post_loop(&mut self.state, span)?;
        }
    }

    fn run_for(
        &mut self,
        scope: &Rc<Env>,
        cond: &Expr,
        update: &Stmt,
        body: &[Stmt],
        span: Span,
    ) -> Result<Flow, Interrupt> {
        loop {
            let c = self.eval(scope, cond)?;
            if !hooks::test_condition(&mut self.state, &c)? {
                return Ok(Flow::Normal);
            }
            match self.exec_block(&Env::child(scope), body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            match self.exec_stmt(scope, update)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
            hooks::post_loop(&mut self.state, span)?;
        }
    }

    fn eval(&mut self, env: &Rc<Env>, expr: &Expr) -> Result<Shadow, Interrupt> {
        match expr {
            Expr::Number { value, .. } => Ok(Shadow::Plain(Value::Number(*value))),
            Expr::Bool { value, .. } => Ok(Shadow::Plain(Value::Bool(*value))),
            Expr::Str { value, .. } => Ok(Shadow::Plain(Value::str(value.clone()))),
            Expr::Null { .. } => Ok(Shadow::Plain(Value::Null)),
            Expr::Undefined { .. } => Ok(Shadow::unit()),

            Expr::Ident { name, .. } => {
                let current = env
                    .lookup(name)
                    .ok_or_else(|| EvalError::UnboundVariable(name.clone()))?;
                let shadow = hooks::read_variable(&mut self.state, name, &current);
                env.set_existing(name, shadow.clone());
                Ok(shadow)
            }

            Expr::Unary { op, operand, .. } => {
                let v = self.eval(env, operand)?;
                Ok(hybrid::evaluate_unary(*op, &v)?)
            }

            Expr::Binary { op, lhs, rhs, .. } => {
                let l = self.eval(env, lhs)?;
                let r = self.eval(env, rhs)?;
                Ok(hybrid::evaluate_binary(*op, &l, &r)?)
            }

            // Short-circuiting: `a && b` is `a ? b : false`, so the left
            // operand is a recorded branch condition.
            Expr::Logical { op, lhs, rhs, .. } => {
                let l = self.eval(env, lhs)?;
                let taken = hooks::test_condition(&mut self.state, &l)?;
                match (op, taken) {
                    (LogicalOp::And, true) | (LogicalOp::Or, false) => self.eval(env, rhs),
                    (LogicalOp::And, false) => Ok(Shadow::Plain(Value::Bool(false))),
                    (LogicalOp::Or, true) => Ok(Shadow::Plain(Value::Bool(true))),
                }
            }

            Expr::Cond {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let c = self.eval(env, cond)?;
                if hooks::test_condition(&mut self.state, &c)? {
                    self.eval(env, then_branch)
                } else {
                    self.eval(env, else_branch)
                }
            }

            Expr::Call { callee, args, span } => {
                let f = self.eval(env, callee)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(env, arg)?);
                }
                self.apply(&f, evaluated, *span)
            }

            Expr::Lambda { params, body, span } => {
                let closure = Closure {
                    name: RefCell::new(None),
                    params: params.clone(),
                    body: Rc::new(body.clone()),
                    env: env.clone(),
                    span: *span,
                };
                Ok(Shadow::Plain(Value::Closure(Rc::new(closure))))
            }

            Expr::Array { elems, .. } => {
                let mut shadows = Vec::with_capacity(elems.len());
                for elem in elems {
                    shadows.push(self.eval(env, elem)?);
                }
                Ok(Shadow::Array(HybridArray::new(shadows)))
            }

            Expr::Index { base, index, .. } => {
                let b = self.eval(env, base)?;
                let i = self.eval(env, index)?;
                let Shadow::Array(a) = &b else {
                    return Err(EvalError::BadIndex.into());
                };
                let idx = match i.scalar().and_then(Value::as_number) {
                    Some(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
                    _ => return Err(EvalError::BadIndex.into()),
                };
                let elems = a.elems.borrow();
                Ok(elems.get(idx).cloned().unwrap_or_else(Shadow::unit))
            }
        }
    }

    fn apply(&mut self, callee: &Shadow, args: Vec<Shadow>, span: Span) -> Result<Shadow, Interrupt> {
        match callee.scalar() {
            Some(Value::Builtin(name)) => {
                let def = builtins::lookup(name).ok_or(EvalError::NotAFunction)?;
                Ok(builtins::apply(&mut self.state, def, &args)?)
            }
            Some(Value::Closure(c)) => {
                let closure = c.clone();
                self.apply_closure(&closure, args, span)
            }
            _ => Err(EvalError::NotAFunction.into()),
        }
    }

    fn apply_closure(
        &mut self,
        closure: &Rc<Closure>,
        args: Vec<Shadow>,
        span: Span,
    ) -> Result<Shadow, Interrupt> {
        if args.len() != closure.params.len() {
            return Err(EvalError::ArityMismatch {
                expected: closure.params.len(),
                got: args.len(),
            }
            .into());
        }
        if self.depth >= self.state.config.max_depth {
            return Err(Interrupt::DepthExceeded);
        }

        // Disambiguate higher-order call sites, and flag the invocation so
        // the oracle never generalizes over callback behavior.
        let mut oracle_name = closure
            .name()
            .unwrap_or_else(|| "<function>".to_string());
        for arg in &args {
            if let Some(fn_name) = arg.function_name() {
                oracle_name.push('#');
                oracle_name.push_str(&fn_name);
                self.state.fn_was_passed = true;
            }
        }

        let params: Vec<(String, Shadow)> = closure
            .params
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();
        hooks::pre_function(&mut self.state, &oracle_name, span, &params)?;

        let scope = Env::child(&closure.env);
        for (name, arg) in &params {
            let entry = hybrid::hybridize_named(name, &hybrid::shallow_concretize(arg));
            scope.define(name, entry);
        }

        self.depth += 1;
        let flow = self.exec_block(&scope, &closure.body);
        self.depth -= 1;

        let result = match flow? {
            Flow::Return(v) => v,
            Flow::Normal => Shadow::unit(),
            Flow::Break | Flow::Continue => {
                return Err(EvalError::Program("break or continue outside a loop".into()).into())
            }
        };
        hooks::return_function(&mut self.state);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diverge_syntax::build::*;
    use diverge_syntax::BinOp;

    fn run_expr(expr: Expr) -> Shadow {
        let mut run = ShadowRun::new(DetectorConfig::default());
        let env = run.globals();
        env.define("result", Shadow::unit());
        let prog = program(vec![assign("result", expr)]);
        run.run_program(&env, &prog).expect("no interrupt");
        env.lookup("result").unwrap()
    }

    #[test]
    fn concrete_arithmetic_is_preserved() {
        let r = run_expr(binary(BinOp::Add, num(2.0), num(3.0)));
        assert_eq!(r.scalar(), Some(&Value::Number(5.0)));
    }

    #[test]
    fn function_calls_return_their_value() {
        let mut run = ShadowRun::new(DetectorConfig::default());
        let env = run.globals();
        let prog = program(vec![
            fn_decl(
                "double",
                vec!["x"],
                vec![ret(Some(binary(BinOp::Mul, ident("x"), num(2.0))))],
            ),
            let_("y", call_named("double", vec![num(21.0)])),
        ]);
        run.run_program(&env, &prog).expect("no interrupt");
        let y = env.lookup("y").unwrap();
        assert_eq!(y.scalar(), Some(&Value::Number(42.0)));
    }

    #[test]
    fn logical_operators_short_circuit() {
        // false && <unbound> never evaluates the right operand.
        let r = run_expr(logical(LogicalOp::And, boolean(false), ident("missing")));
        assert_eq!(r.scalar(), Some(&Value::Bool(false)));
        let r = run_expr(logical(LogicalOp::Or, boolean(true), ident("missing")));
        assert_eq!(r.scalar(), Some(&Value::Bool(true)));
    }

    #[test]
    fn bounded_while_loop_terminates_cleanly() {
        let mut run = ShadowRun::new(DetectorConfig::default());
        let env = run.globals();
        let prog = program(vec![
            let_("i", num(0.0)),
            while_(
                binary(BinOp::Lt, ident("i"), num(50.0)),
                vec![assign("i", binary(BinOp::Add, ident("i"), num(1.0)))],
            ),
        ]);
        run.run_program(&env, &prog).expect("no interrupt");
        let i = env.lookup("i").unwrap();
        assert_eq!(i.scalar(), Some(&Value::Number(50.0)));
        // The loop's frames were discarded by truncation.
        assert_eq!(run.state.sp(), 0);
    }

    #[test]
    fn depth_ceiling_is_benign() {
        let mut config = DetectorConfig::default();
        config.threshold = 1_000_000; // never reach an oracle check
        let mut run = ShadowRun::new(config);
        let env = run.globals();
        let prog = program(vec![
            fn_decl("f", vec!["x"], vec![ret(Some(call_named(
                "f",
                vec![binary(BinOp::Add, ident("x"), num(1.0))],
            )))]),
            expr_stmt(call_named("f", vec![num(0.0)])),
        ]);
        match run.run_program(&env, &prog) {
            Err(Interrupt::DepthExceeded) => {}
            other => panic!("expected DepthExceeded, got {:?}", other.err()),
        }
    }
}
