//! Non-termination detection for the restricted teaching language.
//!
//! Runs a program as a hybrid symbolic/concrete shadow execution and
//! decides, within a bounded time budget, whether it is almost certainly
//! stuck in infinite recursion or an infinite loop. Purely diagnostic: the
//! shadow run never alters the observable result of a terminating program,
//! and whenever the analysis is inconclusive it reports nothing.

pub mod builtins;
pub mod hooks;
pub mod hybrid;
pub mod oracle;
pub mod prelude;
pub mod shadow;
pub mod solver;
pub mod state;
pub mod symbolic;
pub mod value;

use std::time::Duration;

use diverge_syntax::{Program, Span};
use thiserror::Error;
use tracing::{debug, info};

use crate::shadow::ShadowRun;

/// Runtime error of the shadow program itself (the real run would have
/// failed the same way).
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("unbound variable '{0}'")]
    UnboundVariable(String),

    #[error("cannot apply '{op}' to a {found}")]
    TypeMismatch {
        op: &'static str,
        found: &'static str,
    },

    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("value is not callable")]
    NotAFunction,

    #[error("indexing requires an array and an integer index")]
    BadIndex,

    #[error("{0}")]
    Program(String),
}

/// Early-exit signal threaded up through every hook call and caught once
/// at the top-level entry point. Never leaks into the real execution.
#[derive(Debug, Error)]
pub enum Interrupt {
    /// A non-termination verdict: the positive outcome.
    #[error("non-termination detected")]
    Found(Box<Verdict>),

    /// The wall-clock budget ran out: we could not decide in time. Not a
    /// positive detection.
    #[error("analysis timed out")]
    Timeout,

    /// The shadow call depth ceiling was reached. Deep real recursion may
    /// still terminate, so this outcome is benign.
    #[error("shadow call depth ceiling reached")]
    DepthExceeded,

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// What kind of non-termination was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// No conditional branch was taken on any symbolic value during an
    /// entire iteration: the code cannot diverge based on its inputs.
    NoBaseCase,
    /// Per-iteration state is periodic.
    Cycle,
    /// The external solver proved the loop condition re-establishes
    /// itself after every iteration.
    FromSmt,
}

#[derive(Debug, Clone)]
pub(crate) enum VerdictDetail {
    NoBaseCase,
    Cycle { sequence: Vec<String> },
    FromSmt { path: String, updates: String },
}

/// A positive non-termination verdict.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub kind: LoopKind,
    /// The program appears to be forcing an unbounded lazily-produced
    /// sequence rather than looping over an eager structure.
    pub stream_mode: bool,
    /// Best-effort source location: the last hook-recorded position.
    pub location: Span,
    detail: VerdictDetail,
}

impl Verdict {
    pub(crate) fn new(
        kind: LoopKind,
        stream_mode: bool,
        location: Span,
        detail: VerdictDetail,
    ) -> Self {
        Self {
            kind,
            stream_mode,
            location,
            detail,
        }
    }

    /// Human-readable explanation, rendered on demand.
    pub fn explanation(&self) -> String {
        match &self.detail {
            VerdictDetail::NoBaseCase if self.stream_mode => {
                "the program keeps forcing an unbounded stream: \
                 every element that is produced demands the next one, \
                 and no base case can stop it"
                    .to_string()
            }
            VerdictDetail::NoBaseCase => {
                "no base case detected: an entire iteration ran without \
                 branching on its inputs, so the recursion or loop can \
                 never stop"
                    .to_string()
            }
            VerdictDetail::Cycle { sequence } => {
                if sequence.iter().all(|s| s.is_empty()) {
                    "detected a cycle: no variables are being updated, \
                     so the loop condition can never change"
                        .to_string()
                } else {
                    format!(
                        "detected a cycle of repeating states: {} -> ...",
                        sequence.join(" -> ")
                    )
                }
            }
            VerdictDetail::FromSmt { path, updates } => {
                format!(
                    "proved the iteration never stops: whenever {} holds, \
                     the update {} makes it hold again",
                    path, updates
                )
            }
        }
    }
}

/// Per-run knobs. Constructed per analysis; never a process-wide global.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Wall-clock budget, polled at every function/loop boundary.
    pub timeout: Duration,
    /// First oracle checkpoint, and the cycle-history window size.
    pub threshold: usize,
    /// Lazy-pair predicate checks before the run flips to stream mode.
    pub stream_threshold: usize,
    /// Shadow call depth ceiling. A heuristic, not a proof: exceeding it
    /// means "we ran out of analysis budget", never "it loops forever".
    pub max_depth: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let threshold = 20;
        Self {
            timeout: Duration::from_millis(4000),
            threshold,
            stream_threshold: 2 * threshold,
            max_depth: 300,
        }
    }
}

/// Decide whether `program` is almost certainly non-terminating.
///
/// `previous` holds the programs already evaluated in this session, in
/// order; later snippets may call functions they defined. Returns `None`
/// when the program terminates, when the analysis is inconclusive, or
/// when the budget runs out; a verdict is only ever a positive finding.
pub fn test_for_infinite_loop(program: &Program, previous: &[Program]) -> Option<Verdict> {
    test_for_infinite_loop_with(DetectorConfig::default(), program, previous)
}

/// Like [`test_for_infinite_loop`], with explicit knobs.
pub fn test_for_infinite_loop_with(
    config: DetectorConfig,
    program: &Program,
    previous: &[Program],
) -> Option<Verdict> {
    let mut run = ShadowRun::new(config);
    let env = run.globals();

    let stream_prelude = prelude::stream_prelude();
    for p in std::iter::once(&stream_prelude)
        .chain(previous.iter())
        .chain(std::iter::once(program))
    {
        match run.run_program(&env, p) {
            Ok(()) => {}
            Err(Interrupt::Found(verdict)) => {
                info!(kind = ?verdict.kind, stream = verdict.stream_mode, "non-termination detected");
                return Some(*verdict);
            }
            Err(reason) => {
                // Timeout, depth ceiling, or a runtime error of the shadow
                // program: all inconclusive.
                debug!(%reason, "shadow run ended without a verdict");
                return None;
            }
        }
    }
    None
}
