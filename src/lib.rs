//! Synchronized function-generator / multimeter acquisition for the FRH
//! RC-transient bench.
//!
//! A Tektronix AFG1022 drives a square wave into a series RC and emits a TTL
//! pulse that triggers a Keithley 2110. The DMM samples first the loaded
//! generator output, then the capacitor voltage; the two batches yield the
//! capacitance and its uncertainty.
//!
//! - [`channel`]: SCPI send/query transport (VISA)
//! - [`instrument`]: generator and multimeter drivers
//! - [`experiment`]: state machine, orchestrator and operator interaction
//! - [`analysis`]: peak voltage, transient fit, uncertainty
//! - [`storage`]: batch files and the JSON report
//! - [`sim`]: in-process simulated bench

pub mod analysis;
pub mod channel;
pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod sim;
pub mod storage;

pub use error::{AppResult, DaqError};
