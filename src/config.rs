//! Bench configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/frh.toml` (or the file passed with `--config`)
//! 3. Environment variables prefixed with `FRH_`, `__` separating sections
//!
//! ```text
//! FRH_APPLICATION__LOG_LEVEL=debug
//! FRH_GENERATOR__RESOURCE="USB0::0x0699::0x0353::2234106::INSTR"
//! FRH_ACQUISITION__DC_RANGE=1
//! ```

use crate::error::{AppResult, DaqError};
use crate::experiment::ExperimentConfig;
use crate::instrument::{DcRange, SpeedMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/frh.toml";

/// Allowance over the nominal acquisition time when checking the fetch timeout.
pub const FETCH_MARGIN: Duration = Duration::from_secs(1);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrhConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Function generator connection
    pub generator: InstrumentConfig,
    /// Multimeter connection
    pub multimeter: InstrumentConfig,
    /// Excitation levels on generator channel 1
    pub signal: SignalConfig,
    /// DMM acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Output files
    pub storage: StorageConfig,
    /// Defaults offered when the operator is asked for parameters
    pub experiment: ExperimentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Connection settings for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA resource string; `None` runs discovery and stops
    #[serde(default)]
    pub resource: Option<String>,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// Appended to every command
    pub write_terminator: String,
    /// Marks the end of a reply
    pub read_terminator: String,
    /// Quiescence period after `*RST` in milliseconds
    pub reset_settle_ms: u64,
}

impl InstrumentConfig {
    fn new(timeout_ms: u64, reset_settle_ms: u64) -> Self {
        Self {
            resource: None,
            timeout_ms,
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            reset_settle_ms,
        }
    }

    /// Response timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Post-reset settle period.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    fn validate(&self, name: &str) -> AppResult<()> {
        if self.timeout_ms == 0 {
            return Err(DaqError::Configuration(format!(
                "{}.timeout_ms must be > 0",
                name
            )));
        }
        if self.write_terminator.is_empty() || self.read_terminator.is_empty() {
            return Err(DaqError::Configuration(format!(
                "{}: terminators cannot be empty",
                name
            )));
        }
        if let Some(resource) = &self.resource {
            if resource.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "{}.resource cannot be empty; omit it to run discovery",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Measurement signal levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Square-wave amplitude (Vpp)
    pub amplitude_vpp: f64,
    /// Square-wave offset (V)
    pub offset_v: f64,
}

/// DMM acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Fixed DC range in volts (0.1, 1, 10, 100 or 1000)
    pub dc_range: f64,
    /// Integration-time preset
    pub speed: SpeedMode,
    /// Overrides the value derived from the experiment timing
    #[serde(default)]
    pub samples_per_trigger: Option<u32>,
}

/// Where results are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for batches and the report
    pub output_dir: PathBuf,
    /// Batch file for the generator phase
    pub generator_file: String,
    /// Batch file for the capacitor phase
    pub capacitor_file: String,
    /// Analysis report file
    pub report_file: String,
}

impl Default for FrhConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "FRH RC transient".to_string(),
                log_level: "info".to_string(),
            },
            generator: InstrumentConfig::new(5000, 1000),
            // FETCh? blocks for the whole triggered acquisition
            multimeter: InstrumentConfig::new(10_000, 500),
            signal: SignalConfig {
                amplitude_vpp: 1.0,
                offset_v: 0.5,
            },
            acquisition: AcquisitionConfig {
                dc_range: 10.0,
                speed: SpeedMode::Fast,
                samples_per_trigger: None,
            },
            storage: StorageConfig {
                output_dir: PathBuf::from("."),
                generator_file: "mediciones_generador.txt".to_string(),
                capacitor_file: "mediciones_capacitor.txt".to_string(),
                report_file: "resultado.json".to_string(),
            },
            experiment: ExperimentConfig::default(),
        }
    }
}

impl FrhConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(FrhConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FRH_").split("__"))
    }

    /// Check cross-field constraints after loading.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        self.generator.validate("generator")?;
        self.multimeter.validate("multimeter")?;

        self.dc_range()?;
        if !self.signal.amplitude_vpp.is_finite() || self.signal.amplitude_vpp <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "signal.amplitude_vpp must be > 0, got {}",
                self.signal.amplitude_vpp
            )));
        }
        if !self.signal.offset_v.is_finite() {
            return Err(DaqError::Configuration(
                "signal.offset_v must be finite".to_string(),
            ));
        }
        if self.acquisition.samples_per_trigger == Some(0) {
            return Err(DaqError::Configuration(
                "acquisition.samples_per_trigger must be >= 1".to_string(),
            ));
        }

        if self.storage.generator_file == self.storage.capacitor_file {
            return Err(DaqError::Configuration(format!(
                "generator and capacitor batches cannot share '{}'",
                self.storage.generator_file
            )));
        }

        self.experiment
            .validate()
            .map_err(|e| DaqError::Configuration(format!("experiment defaults: {}", e)))?;
        let samples = self
            .experiment
            .samples_per_trigger(self.acquisition.samples_per_trigger)
            .map_err(|e| DaqError::Configuration(format!("experiment defaults: {}", e)))?;
        self.check_fetch_timeout(&self.experiment, samples)
    }

    /// Fail unless `multimeter.timeout_ms` covers one triggered acquisition of
    /// `samples` readings, plus [`FETCH_MARGIN`].
    pub fn check_fetch_timeout(
        &self,
        experiment: &ExperimentConfig,
        samples: u32,
    ) -> AppResult<()> {
        let needed = experiment.fetch_duration(samples)? + FETCH_MARGIN;
        if self.multimeter.timeout() < needed {
            return Err(DaqError::Configuration(format!(
                "multimeter.timeout_ms = {} is too short: {} readings every {} s after up to \
                 one {} Hz period need at least {} ms",
                self.multimeter.timeout_ms,
                samples,
                experiment.sample_spacing_s,
                experiment.frequency_hz,
                needed.as_millis()
            )));
        }
        Ok(())
    }

    /// Configured DC range as a checked value.
    pub fn dc_range(&self) -> AppResult<DcRange> {
        DcRange::try_from(self.acquisition.dc_range).map_err(|e| {
            DaqError::Configuration(format!("acquisition.dc_range: {}", e))
        })
    }

    /// Path of the generator-phase batch file.
    pub fn generator_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.generator_file)
    }

    /// Path of the capacitor-phase batch file.
    pub fn capacitor_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.capacitor_file)
    }

    /// Path of the analysis report.
    pub fn report_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.report_file)
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FrhConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dc_range().unwrap(), DcRange::R10V);
        assert!(config.generator_path().ends_with("mediciones_generador.txt"));
        assert!(config.capacitor_path().ends_with("mediciones_capacitor.txt"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FrhConfig::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_dc_range() {
        let mut config = FrhConfig::default();
        config.acquisition.dc_range = 7.0;
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_zero_timeout_and_empty_terminator() {
        let mut config = FrhConfig::default();
        config.multimeter.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = FrhConfig::default();
        config.generator.read_terminator.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fetch_timeout_must_cover_acquisition() {
        // 250 readings × 20 ms plus one 1 Hz period plus the margin: 7 s
        let mut config = FrhConfig::default();
        config.multimeter.timeout_ms = 5000;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("multimeter.timeout_ms = 5000"));

        config.multimeter.timeout_ms = 7000;
        assert!(config.validate().is_ok());

        let mut config = FrhConfig::default();
        config.acquisition.samples_per_trigger = Some(2000);
        assert!(config.validate().is_err());
        config.multimeter.timeout_ms = 42_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shared_batch_file_rejected() {
        let mut config = FrhConfig::default();
        config.storage.capacitor_file = config.storage.generator_file.clone();
        assert!(config.validate().is_err());
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frh.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_file_overrides_defaults() {
        let (_dir, path) = write_config(
            r#"
            [application]
            log_level = "debug"

            [generator]
            resource = "USB0::0x0699::0x0353::2234106::INSTR"

            [acquisition]
            dc_range = 1.0
            speed = "precise"
            "#,
        );

        let config = FrhConfig::load_from(&path).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(
            config.generator.resource.as_deref(),
            Some("USB0::0x0699::0x0353::2234106::INSTR")
        );
        assert_eq!(config.multimeter.resource, None);
        assert_eq!(config.acquisition.speed, SpeedMode::Precise);
        assert_eq!(config.dc_range().unwrap(), DcRange::R1V);
        // untouched sections keep their defaults
        assert_eq!(config.storage.report_file, "resultado.json");
        assert_eq!(config.generator.reset_settle_ms, 1000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FrhConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.acquisition, FrhConfig::default().acquisition);
        assert_eq!(config.storage, FrhConfig::default().storage);
    }

    #[test]
    fn test_invalid_file_value_fails_validation() {
        let (_dir, path) = write_config("[acquisition]\ndc_range = 20.0\n");
        assert!(matches!(
            FrhConfig::load_from(&path),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let (_dir, path) = write_config("[acquisition\ndc_range = ");
        assert!(matches!(FrhConfig::load_from(&path), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_toml_rendering() {
        let rendered = FrhConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[acquisition]"));
        assert!(rendered.contains("speed = \"fast\""));
    }
}
