//! Per-pair state machine: explicit states and legal transition guards.
//!
//! Every (item, model) pair walks `Pending → Generating → Executing →
//! Comparing → Done`. `Generating` and `Executing` may short-circuit to
//! `Done` on error, and `Pending` may go straight to `Done` when the run is
//! cancelled before the pair starts. `Done` is terminal and the orchestrator
//! attaches exactly one verdict to it.
//!
//! Each transition is validated and recorded so a pair's history can be
//! logged when it ends in an internal error.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    /// Scheduled, not yet started.
    Pending,
    /// Waiting on the model adapter.
    Generating,
    /// Gold and candidate statements running.
    Executing,
    /// Result sets being compared.
    Comparing,
    /// Verdict recorded; terminal.
    Done,
}

impl PairState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Generating => write!(f, "Generating"),
            Self::Executing => write!(f, "Executing"),
            Self::Comparing => write!(f, "Comparing"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// Legal transitions between pair states.
///
/// ```text
/// Pending → Generating | Done
/// Generating → Executing | Done
/// Executing → Comparing | Done
/// Comparing → Done
/// ```
fn is_legal_transition(from: PairState, to: PairState) -> bool {
    use PairState::*;

    matches!(
        (from, to),
        (Pending, Generating)
            | (Pending, Done)
            | (Generating, Executing)
            | (Generating, Done)
            | (Executing, Comparing)
            | (Executing, Done)
            | (Comparing, Done)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PairState,
    pub to: PairState,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: PairState,
    pub to: PairState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// State machine for one (item, model) pair.
pub struct PairStateMachine {
    item_id: String,
    model: String,
    current: PairState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl PairStateMachine {
    pub fn new(item_id: &str, model: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            model: model.to_string(),
            current: PairState::Pending,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> PairState {
        self.current
    }

    /// Attempt to advance to the next state.
    pub fn advance(&mut self, to: PairState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            item = %self.item_id,
            model = %self.model,
            from = %self.current,
            to = %to,
            "State transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Short-circuit to `Done`; legal from every non-terminal state.
    pub fn finish(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(PairState::Done, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line history, e.g. `Pending → Generating → Done (12ms)`.
    pub fn summary(&self) -> String {
        let mut states = vec![PairState::Pending.to_string()];
        states.extend(self.transitions.iter().map(|t| t.to.to_string()));
        format!(
            "{} ({}ms)",
            states.join(" → "),
            self.created_at.elapsed().as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = PairStateMachine::new("q1", "m");
        assert_eq!(sm.current(), PairState::Pending);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut sm = PairStateMachine::new("q1", "m");
        sm.advance(PairState::Generating, None).unwrap();
        sm.advance(PairState::Executing, None).unwrap();
        sm.advance(PairState::Comparing, None).unwrap();
        sm.finish("match").unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 4);
        assert!(sm
            .summary()
            .starts_with("Pending → Generating → Executing → Comparing → Done"));
    }

    #[test]
    fn test_short_circuit_from_generating() {
        let mut sm = PairStateMachine::new("q1", "m");
        sm.advance(PairState::Generating, None).unwrap();
        sm.finish("generation failed").unwrap();
        assert_eq!(sm.current(), PairState::Done);
        assert_eq!(
            sm.transitions()[1].reason.as_deref(),
            Some("generation failed")
        );
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut sm = PairStateMachine::new("q1", "m");
        sm.finish("cancelled").unwrap();
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut sm = PairStateMachine::new("q1", "m");
        let err = sm.advance(PairState::Comparing, None).unwrap_err();
        assert_eq!(err.from, PairState::Pending);
        assert_eq!(err.to, PairState::Comparing);

        sm.finish("done").unwrap();
        assert!(sm.advance(PairState::Generating, None).is_err());
        assert!(sm.finish("again").is_err());
    }

    #[test]
    fn test_no_backward_edges() {
        let mut sm = PairStateMachine::new("q1", "m");
        sm.advance(PairState::Generating, None).unwrap();
        sm.advance(PairState::Executing, None).unwrap();
        assert!(sm.advance(PairState::Generating, None).is_err());
        assert_eq!(sm.current(), PairState::Executing);
    }
}
