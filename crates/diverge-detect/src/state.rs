//! Per-run execution state: the expression cache, the mixed stack of
//! call/loop-iteration frames, the per-call-site trackers, and the run
//! clock. Constructed once per analysis and never shared across runs.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use diverge_syntax::Span;

use crate::hybrid::{contains_function, render_shadow, Shadow, Validity};
use crate::symbolic::{ExprCache, ExprId, ExprRef, NO_CYCLE, NO_SMT};
use crate::value::Value;
use crate::DetectorConfig;

/// Path conditions recorded for one frame. Latching: once `Invalid`, any
/// further path information for the frame is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Paths {
    Valid(Vec<ExprId>),
    Invalid,
}

impl Paths {
    pub fn is_empty(&self) -> bool {
        matches!(self, Paths::Valid(ids) if ids.is_empty())
    }
}

/// One recorded variable update. The concrete value is snapshotted as its
/// canonical rendering at record time so later in-place mutation of a
/// shared array cannot rewrite history.
#[derive(Debug, Clone)]
pub struct Transition {
    pub name: String,
    pub rendered: String,
    /// Numeric payload, for constant/sign fact inference.
    pub num: Option<f64>,
    /// Function values make the frame unusable for cycle comparison.
    pub is_fn: bool,
    pub sym: ExprId,
}

/// One frame of the mixed stack: a function call or a loop iteration.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub loc: Span,
    pub paths: Paths,
    pub transitions: Vec<Transition>,
}

impl StackFrame {
    fn new(loc: Span) -> Self {
        Self {
            loc,
            paths: Paths::Valid(Vec::new()),
            transitions: Vec::new(),
        }
    }
}

/// Iteration positions for one function call site (keyed by oracle name).
#[derive(Debug)]
pub struct FnTracker {
    pub positions: Vec<usize>,
    /// Next iteration count at which the oracle runs; doubles after each
    /// check so analysis cost amortizes against ever-longer recursions.
    pub next_check: usize,
}

/// An active function call: what to restore on return.
#[derive(Debug)]
pub struct CallRecord {
    pub oracle_name: String,
    pub entry_sp: usize,
}

/// An active loop and its iteration positions.
#[derive(Debug)]
pub struct LoopRecord {
    pub entry_sp: usize,
    pub positions: Vec<usize>,
    pub next_check: usize,
}

/// The mutable state of one analysis run.
pub struct State {
    pub cache: ExprCache,
    stack: Vec<StackFrame>,
    pub fn_trackers: HashMap<String, FnTracker>,
    pub call_stack: Vec<CallRecord>,
    pub loop_stack: Vec<LoopRecord>,
    /// Variables written since the last cleanup, newest write wins.
    vars_modified: HashMap<String, Shadow>,
    /// Variables whose symbolic shadow must be rebuilt on next access.
    to_reset: HashSet<String>,
    /// One-shot flag: a function value was passed as an argument, so the
    /// current invocation must not be generalized over.
    pub fn_was_passed: bool,
    pub stream_counter: usize,
    pub stream_mode: bool,
    pub last_loc: Span,
    start: Instant,
    pub config: DetectorConfig,
}

impl State {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            cache: ExprCache::new(),
            stack: Vec::new(),
            fn_trackers: HashMap::new(),
            call_stack: Vec::new(),
            loop_stack: Vec::new(),
            vars_modified: HashMap::new(),
            to_reset: HashSet::new(),
            fn_was_passed: false,
            stream_counter: 0,
            stream_mode: false,
            last_loc: Span::default(),
            start: Instant::now(),
            config,
        }
    }

    /// Wall-clock budget check; polled at every function/loop boundary,
    /// the only places execution can be aborted.
    pub fn has_timed_out(&self) -> bool {
        self.start.elapsed() >= self.config.timeout
    }

    // === Mixed stack ===

    /// Push an empty frame and return its position.
    pub fn new_stack_frame(&mut self, loc: Span) -> usize {
        if loc.is_known() {
            self.last_loc = loc;
        }
        self.stack.push(StackFrame::new(loc));
        self.stack.len() - 1
    }

    /// Current stack pointer (one past the active frame).
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    /// Free frames by truncation: function return and loop exit both come
    /// back through here.
    pub fn truncate(&mut self, sp: usize) {
        self.stack.truncate(sp);
    }

    pub fn frame(&self, pos: usize) -> Option<&StackFrame> {
        self.stack.get(pos)
    }

    pub fn frames(&self, range: std::ops::Range<usize>) -> &[StackFrame] {
        &self.stack[range.start.min(self.stack.len())..range.end.min(self.stack.len())]
    }

    fn active_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.stack.last_mut()
    }

    // === Paths ===

    /// Append a path condition to the active frame, unless it is already
    /// invalid.
    pub fn save_path(&mut self, expr: &ExprRef) {
        let id = self.cache.intern(expr);
        if let Some(frame) = self.active_frame_mut() {
            if let Paths::Valid(ids) = &mut frame.paths {
                ids.push(id);
            }
        }
    }

    /// Mark the active frame's paths invalid for the rest of its lifetime.
    pub fn set_invalid_path(&mut self) {
        if let Some(frame) = self.active_frame_mut() {
            frame.paths = Paths::Invalid;
        }
    }

    // === Transitions ===

    /// Record a variable update in the active frame. Upsert by name: a
    /// later write to the same variable replaces the earlier entry.
    pub fn save_transition(&mut self, name: &str, shadow: &Shadow) {
        let sym = match shadow {
            Shadow::Hybrid(h) => match h.validity {
                Validity::Valid => self.cache.intern(&h.symbolic),
                Validity::NoSmt => NO_SMT,
                Validity::NoCycle => NO_CYCLE,
            },
            Shadow::Array(a) => {
                if a.validity == Validity::NoCycle {
                    NO_CYCLE
                } else {
                    NO_SMT
                }
            }
            Shadow::Plain(_) => NO_SMT,
        };
        let transition = Transition {
            name: name.to_string(),
            rendered: render_shadow(shadow),
            num: shadow.scalar().and_then(Value::as_number),
            is_fn: contains_function(shadow),
            sym,
        };
        if let Some(frame) = self.active_frame_mut() {
            match frame.transitions.iter_mut().find(|t| t.name == name) {
                Some(existing) => *existing = transition,
                None => frame.transitions.push(transition),
            }
        }
    }

    /// Note that `name` was written; the shadow is committed as a
    /// transition at the next iteration boundary.
    pub fn record_write(&mut self, name: &str, shadow: &Shadow) {
        self.vars_modified.insert(name.to_string(), shadow.clone());
    }

    /// Commit every variable modified since the last cleanup into the
    /// active frame and flag it for a fresh symbolic shadow on next access.
    pub fn clean_up_variables(&mut self) {
        let modified: Vec<(String, Shadow)> = self.vars_modified.drain().collect();
        for (name, shadow) in modified {
            self.save_transition(&name, &shadow);
            self.to_reset.insert(name);
        }
    }

    /// Consume the reset flag for `name`.
    pub fn take_reset(&mut self, name: &str) -> bool {
        self.to_reset.remove(name)
    }

    // === Function trackers ===

    /// Enter a call site, pushing its frame and tracker position. Returns
    /// whether this is the first recorded iteration of the site.
    pub fn enter_function(&mut self, oracle_name: &str, loc: Span) -> bool {
        let entry_sp = self.sp();
        let pos = self.new_stack_frame(loc);
        let threshold = self.config.threshold;
        let tracker = self
            .fn_trackers
            .entry(oracle_name.to_string())
            .or_insert_with(|| FnTracker {
                positions: Vec::new(),
                next_check: threshold,
            });
        let first = tracker.positions.is_empty();
        tracker.positions.push(pos);
        self.call_stack.push(CallRecord {
            oracle_name: oracle_name.to_string(),
            entry_sp,
        });
        first
    }

    /// Leave the innermost call: truncate the stack back to the entry
    /// pointer and prune the tracker positions that point past it. A site
    /// that fully unwinds starts its next run from the base threshold.
    pub fn return_last_function(&mut self) {
        if let Some(record) = self.call_stack.pop() {
            self.truncate(record.entry_sp);
            let threshold = self.config.threshold;
            if let Some(tracker) = self.fn_trackers.get_mut(&record.oracle_name) {
                tracker.positions.retain(|&p| p < record.entry_sp);
                if tracker.positions.is_empty() {
                    tracker.next_check = threshold;
                }
            }
        }
    }

    // === Loop trackers ===

    /// Enter a loop: push a record and the frame for its first iteration.
    pub fn enter_loop(&mut self, loc: Span) {
        let entry_sp = self.sp();
        let threshold = self.config.threshold;
        let pos = self.new_stack_frame(loc);
        self.loop_stack.push(LoopRecord {
            entry_sp,
            positions: vec![pos],
            next_check: threshold,
        });
    }

    /// Push the frame for the next iteration of the innermost loop.
    pub fn next_loop_iteration(&mut self, loc: Span) {
        let pos = self.new_stack_frame(loc);
        if let Some(record) = self.loop_stack.last_mut() {
            record.positions.push(pos);
        }
    }

    /// Leave the innermost loop, discarding its frames by truncation.
    pub fn exit_loop(&mut self) {
        if let Some(record) = self.loop_stack.pop() {
            self.truncate(record.entry_sp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::{HybridArray, HybridValue, Shadow};
    use crate::symbolic;

    fn test_state() -> State {
        State::new(DetectorConfig::default())
    }

    fn hybrid(name: &str, n: f64) -> Shadow {
        Shadow::Hybrid(HybridValue::valid(
            Value::Number(n),
            symbolic::ident(name),
        ))
    }

    #[test]
    fn invalid_path_latches() {
        let mut state = test_state();
        state.new_stack_frame(Span::default());
        state.set_invalid_path();
        state.save_path(&symbolic::ident("x"));
        assert_eq!(state.frame(0).unwrap().paths, Paths::Invalid);
    }

    #[test]
    fn transitions_dedup_by_name() {
        let mut state = test_state();
        state.new_stack_frame(Span::default());
        state.save_transition("x", &hybrid("a", 1.0));
        state.save_transition("x", &hybrid("b", 2.0));
        let frame = state.frame(0).unwrap();
        assert_eq!(frame.transitions.len(), 1);
        assert_eq!(frame.transitions[0].rendered, "2");
    }

    #[test]
    fn array_transition_keeps_element_taint() {
        let mut state = test_state();
        state.new_stack_frame(Span::default());
        let tainted = Shadow::Hybrid(HybridValue::invalid(
            Value::Number(0.5),
            Validity::NoCycle,
        ));
        let arr = Shadow::Array(HybridArray::new(vec![tainted, Shadow::Plain(Value::Null)]));
        state.save_transition("x", &arr);
        let t = &state.frame(0).unwrap().transitions[0];
        assert_eq!(t.sym, NO_CYCLE);
        assert!(!t.is_fn);
    }

    #[test]
    fn array_transition_flags_function_elements() {
        let mut state = test_state();
        state.new_stack_frame(Span::default());
        let thunk = Shadow::Plain(Value::Builtin("math_random".into()));
        let arr = Shadow::Array(HybridArray::new(vec![
            Shadow::Plain(Value::Number(0.0)),
            thunk,
        ]));
        state.save_transition("xs", &arr);
        let t = &state.frame(0).unwrap().transitions[0];
        assert!(t.is_fn);
        assert_eq!(t.sym, NO_SMT);
    }

    #[test]
    fn full_unwind_resets_the_check_schedule() {
        let mut state = test_state();
        state.enter_function("f", Span::default());
        state.fn_trackers.get_mut("f").unwrap().next_check = 80;
        state.return_last_function();
        assert!(state.fn_trackers["f"].positions.is_empty());
        assert_eq!(
            state.fn_trackers["f"].next_check,
            state.config.threshold
        );
    }

    #[test]
    fn return_truncates_and_prunes_tracker() {
        let mut state = test_state();
        state.enter_function("f", Span::default());
        state.enter_function("f", Span::default());
        assert_eq!(state.fn_trackers["f"].positions.len(), 2);
        state.return_last_function();
        assert_eq!(state.fn_trackers["f"].positions.len(), 1);
        assert_eq!(state.sp(), 1);
    }

    #[test]
    fn cleanup_commits_and_flags_reset() {
        let mut state = test_state();
        state.new_stack_frame(Span::default());
        state.record_write("x", &hybrid("x", 3.0));
        state.clean_up_variables();
        assert_eq!(state.frame(0).unwrap().transitions.len(), 1);
        assert!(state.take_reset("x"));
        assert!(!state.take_reset("x"));
    }
}
