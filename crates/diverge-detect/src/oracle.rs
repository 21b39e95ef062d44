//! The termination oracle: three escalating checks over the recorded
//! iteration history of one call site or loop.
//!
//! Each check can only produce a positive verdict or pass; an inconclusive
//! analysis always falls through to the next check and, ultimately, to no
//! verdict at all. The checks escalate in cost: absence of branching is a
//! linear scan, cycle detection compares canonical state strings, and the
//! solver check discharges an inductive goal per closed iteration shape.

use std::collections::HashSet;

use tracing::debug;

use crate::solver::{self, Fact, SolverVerdict};
use crate::state::{Paths, State, Transition};
use crate::symbolic::ExprId;
use crate::{LoopKind, Verdict, VerdictDetail};

/// Run the checks over the frames recorded at `positions` (one entry per
/// iteration of the same site, oldest first).
pub fn run_checks(state: &State, positions: &[usize]) -> Option<Verdict> {
    if positions.len() < 2 {
        return None;
    }
    if let Some(verdict) = check_no_base_case(state, positions) {
        debug!(kind = ?verdict.kind, "oracle verdict");
        return Some(verdict);
    }
    if let Some(verdict) = check_cycle(state, positions) {
        debug!(kind = ?verdict.kind, "oracle verdict");
        return Some(verdict);
    }
    if let Some(verdict) = check_from_smt(state, positions) {
        debug!(kind = ?verdict.kind, "oracle verdict");
        return Some(verdict);
    }
    None
}

/// An entire first iteration ran without recording a single path
/// condition: no branch ever looked at the inputs, so nothing can stop
/// subsequent iterations either.
fn check_no_base_case(state: &State, positions: &[usize]) -> Option<Verdict> {
    let frames = state.frames(positions[0]..positions[1]);
    if frames.is_empty() || !frames.iter().all(|f| f.paths.is_empty()) {
        return None;
    }
    Some(Verdict::new(
        LoopKind::NoBaseCase,
        state.stream_mode,
        state.last_loc,
        VerdictDetail::NoBaseCase,
    ))
}

/// Canonical per-iteration state string: the recorded updates sorted by
/// variable name. `None` when the iteration is unusable for comparison
/// (function-valued or non-deterministic updates).
fn state_string(transitions: &[Transition]) -> Option<String> {
    let mut entries: Vec<&Transition> = transitions.iter().collect();
    for t in &entries {
        if t.is_fn || t.sym == crate::symbolic::NO_CYCLE {
            return None;
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Some(
        entries
            .iter()
            .map(|t| format!("({}: {})", t.name, t.rendered))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Minimal period `p` such that the last `p` entries repeat the `p`
/// entries before them. `None` when no suffix repeats.
fn find_cycle(states: &[String]) -> Option<usize> {
    let len = states.len();
    (1..=len / 2).find(|&p| states[len - 2 * p..len - p] == states[len - p..])
}

/// The per-iteration state is periodic over the recent window: the same
/// states will recur forever, so the condition can never change.
fn check_cycle(state: &State, positions: &[usize]) -> Option<Verdict> {
    let window = state.config.threshold.max(2).min(positions.len());
    let recent = &positions[positions.len() - window..];

    let mut states = Vec::with_capacity(recent.len());
    for &pos in recent {
        states.push(state_string(&state.frame(pos)?.transitions)?);
    }
    let period = find_cycle(&states)?;
    let sequence = states[states.len() - period..].to_vec();
    Some(Verdict::new(
        LoopKind::Cycle,
        state.stream_mode,
        state.last_loc,
        VerdictDetail::Cycle { sequence },
    ))
}

/// One iteration's symbolic shape: the path under which it ran, the
/// updates it performed, and the path the following iteration ran under.
#[derive(Debug, PartialEq, Eq)]
struct IterFrame {
    prev: Vec<ExprId>,
    trans: Vec<(String, ExprId)>,
    next: Vec<ExprId>,
}

impl IterFrame {
    /// The iteration re-establishes its own path condition; proving the
    /// implication for this frame alone proves it for the whole run.
    fn is_closed(&self) -> bool {
        self.prev == self.next
    }
}

/// Collect encodable iteration frames from consecutive position pairs,
/// deduplicated by shape.
fn iteration_frames(state: &State, positions: &[usize]) -> Vec<IterFrame> {
    let mut frames: Vec<IterFrame> = Vec::new();
    for pair in positions.windows(2) {
        let Some(prev_frame) = state.frame(pair[0]) else {
            continue;
        };
        let Some(next_frame) = state.frame(pair[1]) else {
            continue;
        };
        let (Paths::Valid(prev), Paths::Valid(next)) = (&prev_frame.paths, &next_frame.paths)
        else {
            continue;
        };
        if prev.is_empty() || next.is_empty() {
            continue;
        }
        if prev_frame.transitions.iter().any(|t| t.sym.is_sentinel()) {
            continue;
        }
        let frame = IterFrame {
            prev: prev.clone(),
            trans: prev_frame
                .transitions
                .iter()
                .map(|t| (t.name.clone(), t.sym))
                .collect(),
            next: next.clone(),
        };
        if !frames.contains(&frame) {
            frames.push(frame);
        }
    }
    frames
}

/// Infer constant and sign facts from the numeric history of every
/// recorded variable over the examined iterations.
fn infer_facts(state: &State, positions: &[usize]) -> Vec<Fact> {
    let mut names: Vec<String> = Vec::new();
    for &pos in positions {
        if let Some(frame) = state.frame(pos) {
            for t in &frame.transitions {
                if !names.contains(&t.name) {
                    names.push(t.name.clone());
                }
            }
        }
    }

    let mut facts = Vec::new();
    for name in names {
        let mut nums = Vec::new();
        let mut complete = true;
        for &pos in positions {
            let Some(frame) = state.frame(pos) else {
                continue;
            };
            for t in &frame.transitions {
                if t.name == name {
                    match t.num {
                        Some(n) => nums.push(n),
                        None => complete = false,
                    }
                }
            }
        }
        if !complete || nums.is_empty() {
            continue;
        }
        if nums.windows(2).all(|w| w[0] == w[1]) {
            facts.push(Fact::Constant(name, nums[0]));
        } else if nums.iter().all(|&n| n > 0.0) {
            facts.push(Fact::Positive(name));
        } else if nums.iter().all(|&n| n < 0.0) {
            facts.push(Fact::Negative(name));
        }
    }
    facts
}

fn facts_for(facts: &[Fact], vars: &[String]) -> Vec<Fact> {
    facts
        .iter()
        .filter(|f| {
            let name = match f {
                Fact::Constant(n, _) | Fact::Positive(n) | Fact::Negative(n) => n,
            };
            vars.iter().any(|v| v == name)
        })
        .cloned()
        .collect()
}

/// Solver escalation: for every closed iteration shape, try to prove that
/// its path condition re-establishes itself under its updates, first
/// as-is and then strengthened with inferred facts.
fn check_from_smt(state: &State, positions: &[usize]) -> Option<Verdict> {
    let frames = iteration_frames(state, positions);
    let closed: Vec<&IterFrame> = frames.iter().filter(|f| f.is_closed()).collect();
    if closed.is_empty() {
        return None;
    }
    let facts = infer_facts(state, positions);

    let mut seen: HashSet<Vec<ExprId>> = HashSet::new();
    for frame in closed {
        if !seen.insert(frame.prev.clone()) {
            continue;
        }
        let path: Vec<_> = frame
            .prev
            .iter()
            .filter_map(|&id| state.cache.expr(id).cloned())
            .collect();
        if path.len() != frame.prev.len() {
            continue;
        }
        let mut updates = Vec::with_capacity(frame.trans.len());
        let mut encodable = true;
        for (name, sym) in &frame.trans {
            match state.cache.expr(*sym) {
                Some(expr) => updates.push((name.clone(), expr.clone())),
                None => encodable = false,
            }
        }
        if !encodable {
            continue;
        }

        let plain = solver::build_goal(path.clone(), updates.clone(), vec![]);
        let proven = match solver::prove(&plain) {
            SolverVerdict::Valid => true,
            SolverVerdict::NotProven => {
                let relevant = facts_for(&facts, &plain.vars);
                !relevant.is_empty()
                    && solver::prove(&solver::build_goal(path, updates, relevant))
                        == SolverVerdict::Valid
            }
        };
        if proven {
            let path_text = frame
                .prev
                .iter()
                .map(|&id| state.cache.text(id).to_string())
                .collect::<Vec<_>>()
                .join(" and ");
            let updates_text = frame
                .trans
                .iter()
                .map(|(name, sym)| format!("{}' = {}", name, state.cache.text(*sym)))
                .collect::<Vec<_>>()
                .join(", ");
            return Some(Verdict::new(
                LoopKind::FromSmt,
                state.stream_mode,
                state.last_loc,
                VerdictDetail::FromSmt {
                    path: path_text,
                    updates: updates_text,
                },
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::{HybridArray, HybridValue, Shadow};
    use crate::symbolic;
    use crate::value::Value;
    use crate::DetectorConfig;
    use diverge_syntax::{BinOp, Span};
    use proptest::prelude::*;

    fn test_state() -> State {
        State::new(DetectorConfig::default())
    }

    fn hybrid(expr: symbolic::ExprRef, n: f64) -> Shadow {
        Shadow::Hybrid(HybridValue::valid(Value::Number(n), expr))
    }

    #[test]
    fn two_branchless_iterations_have_no_base_case() {
        let mut state = test_state();
        let p0 = state.new_stack_frame(Span::default());
        let p1 = state.new_stack_frame(Span::default());
        let verdict = run_checks(&state, &[p0, p1]).expect("verdict");
        assert_eq!(verdict.kind, LoopKind::NoBaseCase);
    }

    #[test]
    fn a_recorded_path_blocks_no_base_case() {
        let mut state = test_state();
        let p0 = state.new_stack_frame(Span::default());
        state.save_path(&symbolic::ident("x"));
        let p1 = state.new_stack_frame(Span::default());
        assert!(check_no_base_case(&state, &[p0, p1]).is_none());
    }

    #[test]
    fn repeating_states_are_a_cycle() {
        let mut state = test_state();
        let mut positions = Vec::new();
        for _ in 0..4 {
            let pos = state.new_stack_frame(Span::default());
            state.save_path(&symbolic::ident("x"));
            state.save_transition("x", &hybrid(symbolic::ident("x"), 7.0));
            positions.push(pos);
        }
        let verdict = run_checks(&state, &positions).expect("verdict");
        assert_eq!(verdict.kind, LoopKind::Cycle);
        assert!(verdict.explanation().contains("(x: 7)"));
    }

    #[test]
    fn nondeterministic_updates_block_the_cycle_check() {
        let mut state = test_state();
        let mut positions = Vec::new();
        for _ in 0..4 {
            let pos = state.new_stack_frame(Span::default());
            state.save_path(&symbolic::ident("x"));
            state.save_transition(
                "x",
                &Shadow::Hybrid(HybridValue::invalid(
                    Value::Number(7.0),
                    crate::hybrid::Validity::NoCycle,
                )),
            );
            positions.push(pos);
        }
        assert!(check_cycle(&state, &positions).is_none());
    }

    #[test]
    fn array_wrapped_nondeterminism_blocks_every_check() {
        // f keeps rebuilding a pair around a random number: the repeated
        // rendering is identical, but the run must not be called cyclic.
        let mut state = test_state();
        let mut positions = Vec::new();
        for _ in 0..4 {
            let pos = state.new_stack_frame(Span::default());
            state.save_path(&symbolic::ident("x"));
            let tainted = Shadow::Hybrid(HybridValue::invalid(
                Value::Number(0.0),
                crate::hybrid::Validity::NoCycle,
            ));
            state.save_transition(
                "x",
                &Shadow::Array(HybridArray::new(vec![
                    tainted,
                    Shadow::Plain(Value::Null),
                ])),
            );
            positions.push(pos);
        }
        assert!(run_checks(&state, &positions).is_none());
    }

    #[test]
    fn monotone_counter_is_proven_by_the_solver() {
        // while (x > 0) { x = x + 1; } recorded over three iterations.
        let mut state = test_state();
        let mut positions = Vec::new();
        let gt = symbolic::binary(BinOp::Gt, symbolic::ident("x"), symbolic::number(0.0));
        let inc = symbolic::binary(BinOp::Add, symbolic::ident("x"), symbolic::number(1.0));
        for i in 0..3 {
            let pos = state.new_stack_frame(Span::default());
            state.save_path(&gt);
            state.save_transition("x", &hybrid(inc.clone(), 1.0 + i as f64));
            positions.push(pos);
        }
        let verdict = run_checks(&state, &positions).expect("verdict");
        assert_eq!(verdict.kind, LoopKind::FromSmt);
        let text = verdict.explanation();
        assert!(text.contains("(x > 0)"), "{}", text);
        assert!(text.contains("x' = (x + 1)"), "{}", text);
    }

    #[test]
    fn bounded_counter_yields_no_verdict() {
        // while (i < n) { i = i + 1; } with distinct i values each round.
        let mut state = test_state();
        let mut positions = Vec::new();
        let lt = symbolic::binary(BinOp::Lt, symbolic::ident("i"), symbolic::ident("n"));
        let inc = symbolic::binary(BinOp::Add, symbolic::ident("i"), symbolic::number(1.0));
        for i in 0..3 {
            let pos = state.new_stack_frame(Span::default());
            state.save_path(&lt);
            state.save_transition("i", &hybrid(inc.clone(), 1.0 + i as f64));
            positions.push(pos);
        }
        assert!(run_checks(&state, &positions).is_none());
    }

    #[test]
    fn find_cycle_picks_the_minimal_period() {
        let states: Vec<String> = ["a", "b", "a", "b", "a", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(find_cycle(&states), Some(2));
        let constant: Vec<String> = vec!["a".into(), "a".into(), "a".into()];
        assert_eq!(find_cycle(&constant), Some(1));
        let acyclic: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(find_cycle(&acyclic), None);
    }

    proptest! {
        #[test]
        fn found_period_actually_repeats(
            base in proptest::collection::vec("[a-c]{1,2}", 1..4),
            reps in 2usize..4,
        ) {
            let mut states = Vec::new();
            for _ in 0..reps {
                states.extend(base.iter().cloned());
            }
            let p = find_cycle(&states).expect("a repeated sequence has a period");
            prop_assert!(p <= base.len());
            let len = states.len();
            prop_assert_eq!(&states[len - 2 * p..len - p], &states[len - p..]);
        }

        #[test]
        fn no_false_period_on_distinct_states(n in 2usize..8) {
            let states: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            prop_assert_eq!(find_cycle(&states), None);
        }
    }
}
