//! Two-channel function generator driver (Tektronix AFG1022 command set)
//!
//! ## Configuration order
//!
//! `configure_channel` declares the output load first, then writes waveform,
//! frequency, amplitude and offset in that order. Changing the waveform can
//! reset the amplitude/offset fields, and the amplitude is interpreted
//! relative to the declared load, so both have to be settled before the
//! levels are programmed.
//!
//! ## Reset
//!
//! `*RST` is asynchronous on this hardware: commands issued right after it may
//! be silently dropped. `reset()` therefore sleeps for a fixed settle period
//! (1 s by default) before returning.

use super::{parse_bool, require_finite};
use crate::channel::{parse_f64, BoxedChannel};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Default quiescence period after `*RST`.
pub const DEFAULT_RESET_SETTLE: Duration = Duration::from_millis(1000);

/// Width of the trigger pulse on channel 2 (s).
pub const TRIGGER_PULSE_WIDTH_S: f64 = 1e-3;
/// Rise/fall time of the trigger pulse (s).
pub const TRIGGER_PULSE_TRANSITION_S: f64 = 1e-6;
/// Trigger pulse swing: 5 Vpp around 2.5 V gives 0-5 V TTL.
pub const TRIGGER_PULSE_AMPLITUDE_VPP: f64 = 5.0;
/// Trigger pulse offset (V).
pub const TRIGGER_PULSE_OFFSET_V: f64 = 2.5;

/// Output waveform shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    /// `SIN`
    Sine,
    /// `SQU`, the excitation used for RC charging
    Square,
    /// `RAMP`
    Ramp,
    /// `PULS`
    Pulse,
    /// `NOIS`
    Noise,
    /// `DC`
    Dc,
    /// Arbitrary waveform from user memory
    User,
}

impl Waveform {
    /// SCPI mnemonic for `SOURn:FUNC`
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Waveform::Sine => "SIN",
            Waveform::Square => "SQU",
            Waveform::Ramp => "RAMP",
            Waveform::Pulse => "PULS",
            Waveform::Noise => "NOIS",
            Waveform::Dc => "DC",
            Waveform::User => "USER",
        }
    }

    /// Parse a `SOURn:FUNC?` reply. Accepts short and long forms
    /// (`SQU`, `SQUare`).
    pub fn from_reply(reply: &str) -> Option<Self> {
        let upper = reply.trim().to_ascii_uppercase();
        [
            Waveform::Sine,
            Waveform::Square,
            Waveform::Ramp,
            Waveform::Pulse,
            Waveform::Noise,
            Waveform::Dc,
            Waveform::User,
        ]
        .into_iter()
        .find(|w| upper.starts_with(w.mnemonic()))
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Declared output load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLoad {
    /// 50 Ω termination assumed
    Matched,
    /// No termination; programmed amplitude appears at the terminals
    HighImpedance,
}

impl OutputLoad {
    fn argument(&self) -> &'static str {
        match self {
            OutputLoad::Matched => "50",
            OutputLoad::HighImpedance => "INF",
        }
    }

    /// Parse an `OUTPn:LOAD?` reply (`INF`, `50`, `9.9E+37`).
    pub fn from_reply(reply: &str) -> Option<Self> {
        let trimmed = reply.trim();
        if trimmed.to_ascii_uppercase().starts_with("INF") {
            return Some(OutputLoad::HighImpedance);
        }
        match trimmed.parse::<f64>() {
            Ok(ohms) if ohms >= 1e6 => Some(OutputLoad::HighImpedance),
            Ok(ohms) if (ohms - 50.0).abs() < 1e-6 => Some(OutputLoad::Matched),
            _ => None,
        }
    }
}

/// Per-channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Output channel (1 or 2)
    pub channel: u8,
    /// Waveform shape
    pub waveform: Waveform,
    /// Frequency in Hz (> 0)
    pub frequency_hz: f64,
    /// Amplitude in Vpp (>= 0)
    pub amplitude_vpp: f64,
    /// DC offset in V
    pub offset_v: f64,
    /// Declared output load
    pub load: OutputLoad,
    /// Output state
    pub output_enabled: bool,
}

impl ChannelConfig {
    /// Check every field before anything is written.
    pub fn validate(&self) -> AppResult<()> {
        validate_channel(self.channel)?;
        require_finite("frequency", self.frequency_hz)?;
        require_finite("amplitude", self.amplitude_vpp)?;
        require_finite("offset", self.offset_v)?;
        if self.frequency_hz <= 0.0 {
            return Err(DaqError::InvalidArgument(format!(
                "frequency must be > 0 Hz, got {}",
                self.frequency_hz
            )));
        }
        if self.amplitude_vpp < 0.0 {
            return Err(DaqError::InvalidArgument(format!(
                "amplitude must be >= 0 Vpp, got {}",
                self.amplitude_vpp
            )));
        }
        Ok(())
    }
}

fn validate_channel(channel: u8) -> AppResult<()> {
    if channel == 1 || channel == 2 {
        Ok(())
    } else {
        Err(DaqError::InvalidArgument(format!(
            "channel must be 1 or 2, got {}",
            channel
        )))
    }
}

/// Capability flags distinguishing generator firmware/driver revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorCapabilities {
    /// Supports the measurement-signal / trigger-pulse presets.
    pub measurement_presets: bool,
}

impl GeneratorCapabilities {
    /// Basic channel control only.
    pub const BASIC: Self = Self {
        measurement_presets: false,
    };

    /// Full AFG1022 feature set used by the FRH bench.
    pub const AFG1022: Self = Self {
        measurement_presets: true,
    };
}

impl Default for GeneratorCapabilities {
    fn default() -> Self {
        Self::AFG1022
    }
}

/// Function generator driver
pub struct FunctionGenerator {
    channel: BoxedChannel,
    capabilities: GeneratorCapabilities,
    settle: Duration,
    configs: [Option<ChannelConfig>; 2],
}

impl FunctionGenerator {
    /// Wrap an open channel with the default AFG1022 capabilities.
    pub fn new(channel: BoxedChannel) -> Self {
        Self {
            channel,
            capabilities: GeneratorCapabilities::default(),
            settle: DEFAULT_RESET_SETTLE,
            configs: [None, None],
        }
    }

    /// Override the capability flags.
    pub fn with_capabilities(mut self, capabilities: GeneratorCapabilities) -> Self {
        self.capabilities = capabilities;
        self
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

    /// Capability flags of this driver.
    pub fn capabilities(&self) -> GeneratorCapabilities {
        self.capabilities
    }

    /// Last configuration applied to `channel`, if any.
    pub fn channel_config(&self, channel: u8) -> Option<&ChannelConfig> {
        match channel {
            1 | 2 => self.configs[usize::from(channel - 1)].as_ref(),
            _ => None,
        }
    }

    /// Query instrument identity (`*IDN?`).
    pub async fn identify(&mut self) -> AppResult<String> {
        self.channel.query("*IDN?").await
    }

    /// Reset to factory defaults and wait for the instrument to settle.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.channel.send("*RST").await?;
        self.channel.send("*CLS").await?;
        self.configs = [None, None];
        debug!(
            "Generator '{}' reset, settling for {:?}",
            self.resource(),
            self.settle
        );
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Unlock frequency/amplitude/phase coupling between channels.
    pub async fn decouple_channels(&mut self) -> AppResult<()> {
        self.channel.send("SOUR:COUP:FREQ OFF").await?;
        self.channel.send("SOUR:COUP:AMPL OFF").await?;
        self.channel.send("SOUR:COUP:PHAS 0").await
    }

    /// Apply a full channel configuration.
    pub async fn configure_channel(&mut self, config: &ChannelConfig) -> AppResult<()> {
        config.validate()?;
        let n = config.channel;

        self.channel
            .send(&format!("OUTP{}:LOAD {}", n, config.load.argument()))
            .await?;
        self.channel
            .send(&format!("SOUR{}:FUNC {}", n, config.waveform.mnemonic()))
            .await?;
        self.channel
            .send(&format!("SOUR{}:FREQ {}", n, config.frequency_hz))
            .await?;
        self.channel
            .send(&format!("SOUR{}:VOLT {}", n, config.amplitude_vpp))
            .await?;
        self.channel
            .send(&format!("SOUR{}:VOLT:OFFS {}", n, config.offset_v))
            .await?;
        self.write_output_state(n, config.output_enabled).await?;

        self.configs[usize::from(n - 1)] = Some(config.clone());
        Ok(())
    }

    /// Enable or disable one output. Idempotent.
    pub async fn set_output_enabled(&mut self, channel: u8, enabled: bool) -> AppResult<()> {
        validate_channel(channel)?;
        self.write_output_state(channel, enabled).await?;
        if let Some(config) = self.configs[usize::from(channel - 1)].as_mut() {
            config.output_enabled = enabled;
        }
        Ok(())
    }

    async fn write_output_state(&mut self, channel: u8, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.channel
            .send(&format!("OUTP{} {}", channel, state))
            .await
    }

    /// Enable both outputs.
    pub async fn start_outputs(&mut self) -> AppResult<()> {
        self.set_output_enabled(1, true).await?;
        self.set_output_enabled(2, true).await
    }

    /// Reset both channels' phase accumulators to a common epoch.
    ///
    /// Frequency and amplitude are left untouched.
    pub async fn align_phases(&mut self) -> AppResult<()> {
        self.channel.send("SOUR:PHAS:ALIGN").await
    }

    /// Channel 1: square excitation into a high-impedance load.
    pub async fn configure_measurement_signal(
        &mut self,
        frequency_hz: f64,
        amplitude_vpp: f64,
        offset_v: f64,
    ) -> AppResult<()> {
        self.require_presets("configure_measurement_signal")?;
        let config = ChannelConfig {
            channel: 1,
            waveform: Waveform::Square,
            frequency_hz,
            amplitude_vpp,
            offset_v,
            load: OutputLoad::HighImpedance,
            output_enabled: false,
        };
        self.configure_channel(&config).await?;
        info!(
            "Measurement signal: {} Hz, {} Vpp, {} V offset on '{}'",
            frequency_hz,
            amplitude_vpp,
            offset_v,
            self.resource()
        );
        Ok(())
    }

    /// Channel 2: narrow 0-5 V pulse with fast edges for the DMM trigger input.
    pub async fn configure_trigger_pulse(&mut self, frequency_hz: f64) -> AppResult<()> {
        self.require_presets("configure_trigger_pulse")?;
        require_finite("frequency", frequency_hz)?;
        if frequency_hz <= 0.0 || 1.0 / frequency_hz <= TRIGGER_PULSE_WIDTH_S {
            return Err(DaqError::InvalidArgument(format!(
                "trigger pulse frequency must be in (0, {}) Hz, got {}",
                1.0 / TRIGGER_PULSE_WIDTH_S,
                frequency_hz
            )));
        }

        self.channel.send("OUTP2:LOAD INF").await?;
        self.channel.send("SOUR2:FUNC PULS").await?;
        self.channel
            .send(&format!("SOUR2:FREQ {}", frequency_hz))
            .await?;
        self.channel
            .send(&format!("SOUR2:PULS:WIDT {}", TRIGGER_PULSE_WIDTH_S))
            .await?;
        self.channel
            .send(&format!("SOUR2:PULS:TRAN {}", TRIGGER_PULSE_TRANSITION_S))
            .await?;
        self.channel
            .send(&format!("SOUR2:VOLT {}", TRIGGER_PULSE_AMPLITUDE_VPP))
            .await?;
        self.channel
            .send(&format!("SOUR2:VOLT:OFFS {}", TRIGGER_PULSE_OFFSET_V))
            .await?;

        self.configs[1] = Some(ChannelConfig {
            channel: 2,
            waveform: Waveform::Pulse,
            frequency_hz,
            amplitude_vpp: TRIGGER_PULSE_AMPLITUDE_VPP,
            offset_v: TRIGGER_PULSE_OFFSET_V,
            load: OutputLoad::HighImpedance,
            output_enabled: false,
        });
        info!("Trigger pulse: {} Hz on '{}'", frequency_hz, self.resource());
        Ok(())
    }

    fn require_presets(&self, operation: &str) -> AppResult<()> {
        if self.capabilities.measurement_presets {
            Ok(())
        } else {
            Err(DaqError::Unsupported(format!(
                "{} requires measurement presets on '{}'",
                operation,
                self.resource()
            )))
        }
    }

    async fn query_f64(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.channel.query(command).await?;
        parse_f64(self.channel.resource(), command, &reply)
    }

    /// Read back the programmed frequency (Hz).
    pub async fn frequency(&mut self, channel: u8) -> AppResult<f64> {
        validate_channel(channel)?;
        self.query_f64(&format!("SOUR{}:FREQ?", channel)).await
    }

    /// Read back the programmed amplitude (Vpp).
    pub async fn amplitude(&mut self, channel: u8) -> AppResult<f64> {
        validate_channel(channel)?;
        self.query_f64(&format!("SOUR{}:VOLT?", channel)).await
    }

    /// Read back the programmed offset (V).
    pub async fn offset(&mut self, channel: u8) -> AppResult<f64> {
        validate_channel(channel)?;
        self.query_f64(&format!("SOUR{}:VOLT:OFFS?", channel)).await
    }

    /// Read back the waveform shape.
    pub async fn waveform(&mut self, channel: u8) -> AppResult<Waveform> {
        validate_channel(channel)?;
        let command = format!("SOUR{}:FUNC?", channel);
        let reply = self.channel.query(&command).await?;
        Waveform::from_reply(&reply).ok_or_else(|| DaqError::Protocol {
            resource: self.channel.resource().to_string(),
            command,
            reason: format!("unknown waveform '{}'", reply.trim()),
        })
    }

    /// Read back the output state.
    pub async fn output_enabled(&mut self, channel: u8) -> AppResult<bool> {
        validate_channel(channel)?;
        let command = format!("OUTP{}?", channel);
        let reply = self.channel.query(&command).await?;
        parse_bool(self.channel.resource(), &command, &reply)
    }

    /// Read back the declared output load.
    pub async fn load(&mut self, channel: u8) -> AppResult<OutputLoad> {
        validate_channel(channel)?;
        let command = format!("OUTP{}:LOAD?", channel);
        let reply = self.channel.query(&command).await?;
        OutputLoad::from_reply(&reply).ok_or_else(|| DaqError::Protocol {
            resource: self.channel.resource().to_string(),
            command,
            reason: format!("unknown load '{}'", reply.trim()),
        })
    }

    /// Close the instrument handle. The driver cannot be used afterwards.
    pub async fn close(mut self) -> AppResult<()> {
        info!("Closing generator '{}'", self.resource());
        self.channel.close().await
    }
}
