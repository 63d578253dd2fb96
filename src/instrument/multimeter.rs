//! Digital multimeter driver (Keithley 2110 command set)
//!
//! Configures fixed-range DC voltage measurements paced by an external
//! trigger, and owns the trigger-wait-and-fetch acquisition primitive.
//!
//! Autoranging is always disabled before a range is fixed: with autorange on
//! the instrument may insert range-settling delays between readings and drift
//! out of step with the trigger train.

use super::require_finite;
use crate::channel::{parse_f64, parse_f64_list, BoxedChannel};
use crate::error::{AppResult, DaqError};
use crate::measurement::SampleBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default quiescence period after `*RST`.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_millis(500);

/// Fixed DC voltage ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DcRange {
    /// 100 mV
    R100mV,
    /// 1 V
    R1V,
    /// 10 V
    R10V,
    /// 100 V
    R100V,
    /// 1000 V
    R1000V,
}

impl DcRange {
    /// All permitted ranges, ascending.
    pub const ALL: [DcRange; 5] = [
        DcRange::R100mV,
        DcRange::R1V,
        DcRange::R10V,
        DcRange::R100V,
        DcRange::R1000V,
    ];

    /// Full-scale value in volts.
    pub fn volts(&self) -> f64 {
        match self {
            DcRange::R100mV => 0.1,
            DcRange::R1V => 1.0,
            DcRange::R10V => 10.0,
            DcRange::R100V => 100.0,
            DcRange::R1000V => 1000.0,
        }
    }
}

impl TryFrom<f64> for DcRange {
    type Error = DaqError;

    fn try_from(volts: f64) -> Result<Self, Self::Error> {
        DcRange::ALL
            .into_iter()
            .find(|r| (r.volts() - volts).abs() <= r.volts() * 1e-9)
            .ok_or_else(|| {
                DaqError::InvalidArgument(format!(
                    "DC range {} V not permitted; valid ranges: 0.1, 1, 10, 100, 1000",
                    volts
                ))
            })
    }
}

impl fmt::Display for DcRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.volts())
    }
}

/// Integration-time presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedMode {
    /// ~50 readings/s, more noise
    Fast,
    /// One mains cycle
    Normal,
    /// Ten mains cycles, slowest and quietest
    Precise,
}

impl SpeedMode {
    /// Integration time in power-line cycles.
    pub fn nplc(&self) -> f64 {
        match self {
            SpeedMode::Fast => 0.02,
            SpeedMode::Normal => 1.0,
            SpeedMode::Precise => 10.0,
        }
    }
}

/// Trigger source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Free-running, `TRIG:SOUR IMM`
    Internal,
    /// Rear-panel trigger input, `TRIG:SOUR EXT`
    External,
}

/// Active trigger edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    /// `TRIG:SLOP POS`
    Rising,
    /// `TRIG:SLOP NEG`
    Falling,
}

/// Trigger model as last programmed into the instrument
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    /// Where triggers come from
    pub source: TriggerSource,
    /// Which edge fires
    pub edge: TriggerEdge,
    /// Delay after the edge (s)
    pub delay_s: f64,
    /// Readings taken per trigger
    pub samples_per_trigger: u32,
    /// Triggers accepted per `INIT`
    pub triggers_per_arm: u32,
}

impl TriggerConfig {
    /// Readings expected from one armed acquisition.
    pub fn expected_samples(&self) -> usize {
        self.samples_per_trigger as usize * self.triggers_per_arm as usize
    }
}

/// Multimeter driver
pub struct Multimeter {
    channel: BoxedChannel,
    settle: Duration,
    trigger: Option<TriggerConfig>,
}

impl Multimeter {
    /// Wrap an open channel.
    pub fn new(channel: BoxedChannel) -> Self {
        Self {
            channel,
            settle: DEFAULT_RESET_SETTLE,
            trigger: None,
        }
    }

    /// Override the post-reset settle period.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Resource string of the underlying channel.
    pub fn resource(&self) -> &str {
        self.channel.resource()
    }

    /// Trigger model programmed by [`configure_external_trigger`](Self::configure_external_trigger).
    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        self.trigger.as_ref()
    }

    /// Query instrument identity (`*IDN?`).
    pub async fn identify(&mut self) -> AppResult<String> {
        self.channel.query("*IDN?").await
    }

    /// Reset to factory defaults and wait for the instrument to settle.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.channel.send("*RST").await?;
        self.channel.send("*CLS").await?;
        self.trigger = None;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Fix the DC voltage range. Only 0.1, 1, 10, 100 and 1000 V are accepted.
    pub async fn configure_dc_range(&mut self, range: f64) -> AppResult<DcRange> {
        let range = DcRange::try_from(range)?;
        self.channel.send("VOLT:DC:RANG:AUTO OFF").await?;
        self.channel
            .send(&format!("VOLT:DC:RANG {}", range))
            .await?;
        debug!("DMM '{}' fixed to {} V range", self.resource(), range);
        Ok(range)
    }

    /// Read back the active DC range (V).
    pub async fn dc_range(&mut self) -> AppResult<f64> {
        let reply = self.channel.query("VOLT:DC:RANG?").await?;
        parse_f64(self.channel.resource(), "VOLT:DC:RANG?", &reply)
    }

    /// Read back the integration time (NPLC).
    pub async fn nplc(&mut self) -> AppResult<f64> {
        let reply = self.channel.query("VOLT:DC:NPLC?").await?;
        parse_f64(self.channel.resource(), "VOLT:DC:NPLC?", &reply)
    }

    /// Apply an integration-time preset.
    pub async fn set_speed(&mut self, mode: SpeedMode) -> AppResult<()> {
        self.channel
            .send(&format!("VOLT:DC:NPLC {}", mode.nplc()))
            .await
    }

    /// Fastest integration (~50 readings/s).
    pub async fn fast(&mut self) -> AppResult<()> {
        self.set_speed(SpeedMode::Fast).await
    }

    /// One mains cycle of integration.
    pub async fn normal(&mut self) -> AppResult<()> {
        self.set_speed(SpeedMode::Normal).await
    }

    /// Ten mains cycles of integration.
    pub async fn precise(&mut self) -> AppResult<()> {
        self.set_speed(SpeedMode::Precise).await
    }

    /// External trigger, rising edge, no delay, `samples_per_trigger` readings
    /// per edge, one edge per arm.
    pub async fn configure_external_trigger(&mut self, samples_per_trigger: u32) -> AppResult<()> {
        if samples_per_trigger == 0 {
            return Err(DaqError::InvalidArgument(
                "samples per trigger must be >= 1".to_string(),
            ));
        }
        let config = TriggerConfig {
            source: TriggerSource::External,
            edge: TriggerEdge::Rising,
            delay_s: 0.0,
            samples_per_trigger,
            triggers_per_arm: 1,
        };
        require_finite("trigger delay", config.delay_s)?;

        self.channel.send("ABOR").await?;
        self.channel.send("TRIG:SOUR EXT").await?;
        self.channel.send("TRIG:SLOP POS").await?;
        self.channel
            .send(&format!("TRIG:DEL {}", config.delay_s))
            .await?;
        self.channel
            .send(&format!("SAMP:COUN {}", config.samples_per_trigger))
            .await?;
        self.channel
            .send(&format!("TRIG:COUN {}", config.triggers_per_arm))
            .await?;
        self.channel.send("ABOR").await?;

        info!(
            "DMM '{}' armed for external trigger, {} samples per edge",
            self.resource(),
            samples_per_trigger
        );
        self.trigger = Some(config);
        Ok(())
    }

    /// Arm, block until the external trigger fires and the readings are taken,
    /// then fetch them in acquisition order.
    ///
    /// There is no timeout beyond the channel's read timeout. If no edge
    /// arrives within it the call fails with [`DaqError::TriggerTimeout`].
    pub async fn measure_on_trigger(&mut self) -> AppResult<SampleBatch> {
        let expected = self
            .trigger
            .as_ref()
            .map(TriggerConfig::expected_samples)
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "external trigger not configured on '{}'",
                    self.resource()
                ))
            })?;

        self.channel.send("ABOR").await?;
        self.channel.send("INIT").await?;
        debug!("DMM '{}' waiting for trigger", self.resource());

        let reply = match self.channel.query("FETCh?").await {
            Ok(reply) => reply,
            Err(DaqError::Timeout {
                resource, timeout, ..
            }) => {
                warn!("No trigger on '{}' within {:?}", resource, timeout);
                return Err(DaqError::TriggerTimeout { resource, timeout });
            }
            Err(e) => return Err(e),
        };

        let readings = parse_f64_list(self.channel.resource(), "FETCh?", &reply)?;
        if readings.len() != expected {
            return Err(DaqError::Protocol {
                resource: self.resource().to_string(),
                command: "FETCh?".to_string(),
                reason: format!("expected {} readings, got {}", expected, readings.len()),
            });
        }
        debug!("DMM '{}' fetched {} readings", self.resource(), readings.len());
        Ok(SampleBatch::new(readings))
    }

    /// Run `n` triggered acquisitions back to back. Stops at the first failure.
    pub async fn measure_n_triggers(&mut self, n: usize) -> AppResult<Vec<SampleBatch>> {
        let mut batches = Vec::with_capacity(n);
        for i in 0..n {
            debug!("Waiting for trigger {}/{}", i + 1, n);
            batches.push(self.measure_on_trigger().await?);
        }
        Ok(batches)
    }

    /// Close the instrument handle. The driver cannot be used afterwards.
    pub async fn close(mut self) -> AppResult<()> {
        info!("Closing multimeter '{}'", self.resource());
        self.channel.close().await
    }
}
