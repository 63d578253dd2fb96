//! Instrument drivers for the FRH bench.
//!
//! - [`FunctionGenerator`]: two-channel arbitrary function generator
//!   (Tektronix AFG1022 command set).
//! - [`Multimeter`]: 6½-digit DMM with external trigger input
//!   (Keithley 2110 command set).
//!
//! Both drivers exclusively own a [`BoxedChannel`](crate::channel::BoxedChannel)
//! and validate arguments before anything is written to the instrument.

pub mod generator;
pub mod multimeter;

pub use generator::{ChannelConfig, FunctionGenerator, GeneratorCapabilities, OutputLoad, Waveform};
pub use multimeter::{DcRange, Multimeter, SpeedMode, TriggerConfig, TriggerEdge, TriggerSource};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which bench instrument a channel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentRole {
    /// Function generator (excitation + trigger pulse)
    Generator,
    /// Multimeter (triggered sampling)
    Multimeter,
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentRole::Generator => f.write_str("generator"),
            InstrumentRole::Multimeter => f.write_str("multimeter"),
        }
    }
}

/// Parse a boolean SCPI reply (`1`/`0`, `ON`/`OFF`).
pub(crate) fn parse_bool(resource: &str, command: &str, reply: &str) -> AppResult<bool> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        other => Err(DaqError::Protocol {
            resource: resource.to_string(),
            command: command.to_string(),
            reason: format!("expected ON/OFF, got '{}'", other),
        }),
    }
}

/// Reject NaN and infinities before they reach a command string.
pub(crate) fn require_finite(name: &str, value: f64) -> AppResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DaqError::InvalidArgument(format!(
            "{} must be a finite number, got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool("AFG", "OUTP1?", "1").unwrap());
        assert!(parse_bool("AFG", "OUTP1?", "on\n").unwrap());
        assert!(!parse_bool("AFG", "OUTP1?", "0").unwrap());
        assert!(!parse_bool("AFG", "OUTP1?", "OFF").unwrap());
        assert!(parse_bool("AFG", "OUTP1?", "2").is_err());
    }

    #[test]
    fn test_require_finite() {
        assert_eq!(require_finite("frequency", 1.0).unwrap(), 1.0);
        assert!(require_finite("frequency", f64::NAN).is_err());
        assert!(require_finite("offset", f64::INFINITY).is_err());
    }
}
