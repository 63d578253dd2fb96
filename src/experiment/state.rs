//! Acquisition state machine
//!
//! ```text
//! Start ──▶ InputParameters ──▶ Initialize ──▶ Measure ◀──┐
//!   │              │                 │            │        │ generator saved
//!   ▼ quit         ▼ quit            │            ▼        │
//! Done           Done                │          Save ──────┘
//!   ▲                                │            │ capacitor saved
//!   │ quit                           │            ▼
//! Finalize ◀──────── failure ────────┴──────── Analyze
//!   │ again
//!   ▼
//! Start
//! ```

use crate::error::{AppResult, DaqError};
use crate::measurement::ExperimentPhase;
use std::fmt;

/// Acquisition state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentState {
    /// Main menu
    Start,
    /// Collecting the experiment parameters
    InputParameters,
    /// Opening, resetting and configuring both instruments
    Initialize,
    /// Acquiring the batch of the current phase
    Measure,
    /// Persisting the batch of the current phase
    Save,
    /// Computing C ± u(C)
    Analyze,
    /// Releasing the instruments
    Finalize,
    /// Terminal
    Done,
}

/// Result of running a state's entry action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The action completed
    Completed,
    /// A phase batch was persisted
    PhaseSaved(ExperimentPhase),
    /// The action failed
    Failed,
    /// Operator asked for another run
    Continue,
    /// Operator asked to exit
    Quit,
}

impl ExperimentState {
    /// The transition function. Unlisted pairs are rejected.
    pub fn next(self, outcome: StepOutcome) -> AppResult<ExperimentState> {
        use ExperimentPhase::*;
        use ExperimentState::*;
        use StepOutcome::*;

        let next = match (self, outcome) {
            (Start, Completed) => InputParameters,
            (Start, Quit) => Done,
            (InputParameters, Completed) => Initialize,
            (InputParameters, Quit) => Done,
            (Initialize, Completed) => Measure,
            (Measure, Completed) => Save,
            (Save, PhaseSaved(GeneratorPhase)) => Measure,
            (Save, PhaseSaved(CapacitorPhase)) => Analyze,
            (Analyze, Completed) => Finalize,
            (Initialize | Measure | Save | Analyze, Failed) => Finalize,
            (Finalize, Continue) => Start,
            (Finalize, Quit) => Done,
            (from, outcome) => {
                return Err(DaqError::InvalidTransition {
                    from: from.to_string(),
                    outcome: outcome.to_string(),
                })
            }
        };
        Ok(next)
    }

    /// True once the machine has stopped.
    pub fn is_terminal(self) -> bool {
        self == ExperimentState::Done
    }

    /// States that hold open instrument handles.
    pub fn holds_instruments(self) -> bool {
        matches!(
            self,
            ExperimentState::Initialize
                | ExperimentState::Measure
                | ExperimentState::Save
                | ExperimentState::Analyze
        )
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::InputParameters => write!(f, "INPUT_PARAMETERS"),
            Self::Initialize => write!(f, "INITIALIZE"),
            Self::Measure => write!(f, "MEASURE"),
            Self::Save => write!(f, "SAVE"),
            Self::Analyze => write!(f, "ANALYZE"),
            Self::Finalize => write!(f, "FINALIZE"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::PhaseSaved(phase) => write!(f, "{} phase saved", phase),
            Self::Failed => write!(f, "failed"),
            Self::Continue => write!(f, "continue"),
            Self::Quit => write!(f, "quit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExperimentState::*;

    #[test]
    fn test_happy_path() {
        let mut state = Start;
        let outcomes = [
            StepOutcome::Completed,
            StepOutcome::Completed,
            StepOutcome::Completed,
            StepOutcome::Completed,
            StepOutcome::PhaseSaved(ExperimentPhase::GeneratorPhase),
            StepOutcome::Completed,
            StepOutcome::PhaseSaved(ExperimentPhase::CapacitorPhase),
            StepOutcome::Completed,
            StepOutcome::Quit,
        ];
        let mut visited = vec![state];
        for outcome in outcomes {
            state = state.next(outcome).unwrap();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                Start,
                InputParameters,
                Initialize,
                Measure,
                Save,
                Measure,
                Save,
                Analyze,
                Finalize,
                Done
            ]
        );
    }

    #[test]
    fn test_failures_route_to_finalize() {
        for state in [Initialize, Measure, Save, Analyze] {
            assert_eq!(state.next(StepOutcome::Failed).unwrap(), Finalize);
        }
    }

    #[test]
    fn test_analyze_only_after_capacitor_saved() {
        assert_eq!(
            Save.next(StepOutcome::PhaseSaved(ExperimentPhase::GeneratorPhase))
                .unwrap(),
            Measure
        );
        assert!(Measure.next(StepOutcome::PhaseSaved(ExperimentPhase::CapacitorPhase)).is_err());
    }

    #[test]
    fn test_unlisted_transition_rejected() {
        let err = Done.next(StepOutcome::Completed).unwrap_err();
        match err {
            DaqError::InvalidTransition { from, outcome } => {
                assert_eq!(from, "DONE");
                assert_eq!(outcome, "completed");
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
        assert!(Start.next(StepOutcome::Failed).is_err());
        assert!(Finalize.next(StepOutcome::Completed).is_err());
    }

    #[test]
    fn test_finalize_loops_or_exits() {
        assert_eq!(Finalize.next(StepOutcome::Continue).unwrap(), Start);
        assert_eq!(Finalize.next(StepOutcome::Quit).unwrap(), Done);
        assert!(Done.is_terminal());
    }
}
