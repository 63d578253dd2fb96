//! Two-phase RC transient experiment
//!
//! - [`state`]: the `Start → … → Done` state machine
//! - [`orchestrator`]: runs the machine against a bench
//! - [`operator`]: prompts and reports
//! - [`connector`]: opens instrument channels by role

pub mod config;
pub mod connector;
pub mod operator;
pub mod orchestrator;
pub mod state;

pub use config::ExperimentConfig;
pub use connector::{InstrumentConnector, VisaConnector};
pub use operator::{ConsoleOperator, MenuChoice, Operator, ScriptedOperator};
pub use orchestrator::{CompletedRun, Orchestrator, RunResult};
pub use state::{ExperimentState, StepOutcome};
