//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! command channel, both instrument drivers and the experiment orchestrator.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`** / **`Timeout`**: the link to an instrument is down, or a
//!   write/read did not complete in time. Both count as transport failures
//!   (see [`DaqError::is_transport`]) and are never retried automatically.
//! - **`Protocol`**: the instrument answered, but the reply could not be
//!   decoded. Replies are never coerced to a default value.
//! - **`InvalidArgument`**: the caller asked for something the hardware cannot
//!   do (channel 3, a 7 V range). Raised before anything is written.
//! - **`TriggerTimeout`**: the multimeter was armed but no external edge
//!   arrived. Usually a wiring fault; the current run is abandoned.
//! - **`Configuration`** / **`Config`**: semantic and loading errors of the
//!   configuration layer.
//! - **`Analysis`**: the analysis collaborator could not produce a result.
//!
//! Every instrument-facing variant carries the resource string so that the
//! operator can tell which instrument failed.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A loaded configuration value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure while saving or reading results.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link to an instrument failed.
    #[error("Transport error on '{resource}' during '{command}': {reason}")]
    Transport {
        /// Instrument resource string
        resource: String,
        /// Command in flight
        command: String,
        /// Underlying cause
        reason: String,
    },

    /// A write or read did not complete within the channel timeout.
    #[error("Transport timeout on '{resource}' during '{command}' after {timeout:?}")]
    Timeout {
        /// Instrument resource string
        resource: String,
        /// Command in flight
        command: String,
        /// Timeout that expired
        timeout: Duration,
    },

    /// The instrument answered with something that could not be decoded.
    #[error("Protocol error on '{resource}' for '{command}': {reason}")]
    Protocol {
        /// Instrument resource string
        resource: String,
        /// Command whose reply was bad
        command: String,
        /// What was wrong with the reply
        reason: String,
    },

    /// The request is outside what the hardware supports.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The multimeter was armed but no external edge arrived.
    #[error("No external trigger on '{resource}' within {timeout:?}")]
    TriggerTimeout {
        /// Multimeter resource string
        resource: String,
        /// How long the trigger was awaited
        timeout: Duration,
    },

    /// The analysis step could not produce a result.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// The operation has no implementation for this instrument.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// A cargo feature needed at runtime was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The state machine has no edge for this outcome.
    #[error("No transition from state {from} on {outcome}")]
    InvalidTransition {
        /// State the run was in
        from: String,
        /// Outcome that had no edge
        outcome: String,
    },
}

impl DaqError {
    /// True for link-level failures, including timeouts.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Transport { .. } | DaqError::Timeout { .. })
    }

    /// Resource string of the instrument involved, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            DaqError::Transport { resource, .. }
            | DaqError::Timeout { resource, .. }
            | DaqError::Protocol { resource, .. }
            | DaqError::TriggerTimeout { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::InvalidArgument("channel must be 1 or 2, got 3".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid argument: channel must be 1 or 2, got 3"
        );
    }

    #[test]
    fn test_timeout_is_transport() {
        let err = DaqError::Timeout {
            resource: "USB0::0x0699::0x0353::2234106::INSTR".into(),
            command: "*IDN?".into(),
            timeout: Duration::from_millis(5000),
        };
        assert!(err.is_transport());
        assert_eq!(err.resource(), Some("USB0::0x0699::0x0353::2234106::INSTR"));
    }

    #[test]
    fn test_trigger_timeout_is_not_transport() {
        let err = DaqError::TriggerTimeout {
            resource: "USB0::0x05E6::0x2110::8018964::INSTR".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(!err.is_transport());
        assert!(err.to_string().contains("No external trigger"));
    }
}
