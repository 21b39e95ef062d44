//! The runtime hook surface: the fixed callback entry points instrumented
//! execution fires at variable accesses, conditions, and function/loop
//! boundaries. Hooks observe and record; they never change the concrete
//! value flowing through the program.

use diverge_syntax::Span;
use tracing::debug;

use crate::hybrid::{self, Shadow, Validity};
use crate::oracle;
use crate::state::State;
use crate::{Interrupt, Verdict};

/// Variable read. Rebuilds a fresh symbolic shadow for variables flagged
/// for reset (so stale expressions never leak across iterations) and lifts
/// plain scalars on first access. The caller stores the result back.
pub fn read_variable(state: &mut State, name: &str, current: &Shadow) -> Shadow {
    if state.take_reset(name) {
        let stripped = hybrid::deep_concretize_in_place(current);
        return hybrid::hybridize_named(name, &stripped);
    }
    hybrid::hybridize_named(name, current)
}

/// Variable write: remember it for the next `clean_up_variables`. Plain
/// values carry no symbolic information and are not recorded.
pub fn write_variable(state: &mut State, name: &str, shadow: &Shadow) {
    if matches!(shadow, Shadow::Hybrid(_) | Shadow::Array(_)) {
        state.record_write(name, shadow);
    }
}

/// Boolean condition. Records the taken branch as a path condition when
/// the condition is symbolic and trustworthy, invalidates the frame's
/// paths otherwise, and always returns the plain boolean so control flow
/// is unaffected.
pub fn test_condition(state: &mut State, shadow: &Shadow) -> Result<bool, Interrupt> {
    let value = match shadow.scalar().and_then(|v| v.as_bool()) {
        Some(b) => b,
        None => {
            return Err(crate::EvalError::TypeMismatch {
                op: "condition",
                found: "non-boolean",
            }
            .into())
        }
    };
    if let Shadow::Hybrid(h) = shadow {
        match h.validity {
            Validity::Valid => {
                let taken = if value {
                    h.symbolic.clone()
                } else {
                    h.negation.clone().unwrap_or_else(|| {
                        crate::symbolic::unary(diverge_syntax::UnaryOp::Not, h.symbolic.clone())
                    })
                };
                state.save_path(&taken);
            }
            Validity::NoSmt | Validity::NoCycle => state.set_invalid_path(),
        }
    }
    Ok(value)
}

/// Function entry. Commits pending variable updates and the parameter
/// bindings as transitions of the caller's frame, runs the threshold-gated
/// oracle check for this call site, then opens the callee's frame.
pub fn pre_function(
    state: &mut State,
    oracle_name: &str,
    loc: Span,
    params: &[(String, Shadow)],
) -> Result<(), Interrupt> {
    if state.has_timed_out() {
        return Err(Interrupt::Timeout);
    }
    state.clean_up_variables();
    for (name, shadow) in params {
        if matches!(shadow, Shadow::Hybrid(_) | Shadow::Array(_)) {
            state.save_transition(name, shadow);
        }
    }

    // A function value passed as an argument anywhere suppresses the
    // check for this invocation: generalizing over callback behavior
    // would be unsound.
    let skip = std::mem::take(&mut state.fn_was_passed);
    let due = match state.fn_trackers.get_mut(oracle_name) {
        Some(tracker) if !tracker.positions.is_empty() => {
            if tracker.positions.len() >= tracker.next_check {
                tracker.next_check = tracker.positions.len() * 2;
                Some(tracker.positions.clone())
            } else {
                None
            }
        }
        _ => None,
    };
    if let Some(positions) = due {
        if skip {
            debug!(site = oracle_name, "skipping check: function-valued argument");
        } else if let Some(verdict) = check(state, &positions) {
            return Err(Interrupt::Found(Box::new(verdict)));
        }
    }

    state.enter_function(oracle_name, loc);
    Ok(())
}

/// Function exit: discard the callee's frames by truncation.
pub fn return_function(state: &mut State) {
    state.return_last_function();
}

/// Loop entry: open the record and the first iteration's frame.
pub fn enter_loop(state: &mut State, loc: Span) -> Result<(), Interrupt> {
    if state.has_timed_out() {
        return Err(Interrupt::Timeout);
    }
    state.enter_loop(loc);
    Ok(())
}

/// End of one completed loop iteration (including the update step): commit
/// the iteration's variable updates, run the threshold-gated check, and
/// open the next iteration's frame.
pub fn post_loop(state: &mut State, loc: Span) -> Result<(), Interrupt> {
    if state.has_timed_out() {
        return Err(Interrupt::Timeout);
    }
    state.clean_up_variables();

    let due = match state.loop_stack.last_mut() {
        Some(record) if record.positions.len() >= record.next_check => {
            record.next_check = record.positions.len() * 2;
            Some(record.positions.clone())
        }
        _ => None,
    };
    if let Some(positions) = due {
        if let Some(verdict) = check(state, &positions) {
            return Err(Interrupt::Found(Box::new(verdict)));
        }
    }

    state.next_loop_iteration(loc);
    Ok(())
}

/// Loop exit (normal completion or break): discard iteration frames.
pub fn exit_loop(state: &mut State) {
    state.exit_loop();
}

fn check(state: &mut State, positions: &[usize]) -> Option<Verdict> {
    debug!(iterations = positions.len(), "running termination oracle");
    oracle::run_checks(state, positions)
}
