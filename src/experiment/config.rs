//! Per-run experiment parameters.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Parameters collected in `InputParameters`, fixed for the rest of the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Nominal capacitance under test (F)
    pub nominal_capacitance_f: f64,
    /// Series resistance (Ω)
    pub resistance_ohm: f64,
    /// Expected time constant (s)
    pub time_constant_s: f64,
    /// Excitation and trigger frequency (Hz)
    pub frequency_hz: f64,
    /// Time between DMM readings (s)
    pub sample_spacing_s: f64,
    /// Excitation cycles covered by one batch
    pub cycle_count: u32,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            nominal_capacitance_f: 1e-6,
            resistance_ohm: 100e3,
            time_constant_s: 0.1,
            frequency_hz: 1.0,
            sample_spacing_s: 0.02,
            cycle_count: 5,
        }
    }
}

impl ExperimentConfig {
    /// Every numeric field must be finite and > 0, and at least one cycle.
    pub fn validate(&self) -> AppResult<()> {
        let fields = [
            ("nominal capacitance", self.nominal_capacitance_f),
            ("resistance", self.resistance_ohm),
            ("time constant", self.time_constant_s),
            ("frequency", self.frequency_hz),
            ("sample spacing", self.sample_spacing_s),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::InvalidArgument(format!(
                    "{} must be > 0, got {}",
                    name, value
                )));
            }
        }
        if self.cycle_count < 1 {
            return Err(DaqError::InvalidArgument(
                "cycle count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Readings per trigger: `round(cycles / frequency / spacing)`, unless
    /// `override_samples` is given.
    pub fn samples_per_trigger(&self, override_samples: Option<u32>) -> AppResult<u32> {
        if let Some(n) = override_samples {
            return if n >= 1 {
                Ok(n)
            } else {
                Err(DaqError::InvalidArgument(
                    "samples per trigger must be >= 1".to_string(),
                ))
            };
        }
        self.validate()?;
        let samples =
            (f64::from(self.cycle_count) / self.frequency_hz / self.sample_spacing_s).round();
        if samples < 1.0 || samples > f64::from(u32::MAX) {
            return Err(DaqError::InvalidArgument(format!(
                "{} cycles at {} Hz sampled every {} s gives {} readings",
                self.cycle_count, self.frequency_hz, self.sample_spacing_s, samples
            )));
        }
        Ok(samples as u32)
    }

    /// Worst-case time from arming to the last reading: up to one period
    /// waiting for the trigger edge, then `samples` readings.
    pub fn fetch_duration(&self, samples: u32) -> AppResult<Duration> {
        self.validate()?;
        let secs = f64::from(samples) * self.sample_spacing_s + 1.0 / self.frequency_hz;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            DaqError::InvalidArgument(format!("acquisition time of {} s: {}", secs, e))
        })
    }

    /// Product R·C of the nominal values (s).
    pub fn nominal_time_constant(&self) -> f64 {
        self.resistance_ohm * self.nominal_capacitance_f
    }
}

impl fmt::Display for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "C = {:e} F, R = {:e} Ω, τ = {} s, f = {} Hz, Δt = {} s, {} cycles",
            self.nominal_capacitance_f,
            self.resistance_ohm,
            self.time_constant_s,
            self.frequency_hz,
            self.sample_spacing_s,
            self.cycle_count
        )
    }
}
