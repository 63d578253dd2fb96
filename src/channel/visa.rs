//! VISA command channel for GPIB/USB instruments
//!
//! Builder-based channel wrapping the visa-rs crate. VISA calls are blocking,
//! so every transaction runs on Tokio's blocking executor.
//!
//! Supports resource strings like:
//! - "USB0::0x0699::0x0353::2234106::INSTR" (Tektronix AFG1022)
//! - "USB0::0x05E6::0x2110::8018964::INSTR" (Keithley 2110)
//! - "GPIB0::5::INSTR"

use super::{CommandChannel, DEFAULT_TIMEOUT};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{BufRead, BufReader, Write};
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Builder for [`VisaChannel`]
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use frh_daq::channel::VisaChannelBuilder;
///
/// # async fn example() -> frh_daq::error::AppResult<()> {
/// let channel = VisaChannelBuilder::new("USB0::0x05E6::0x2110::8018964::INSTR")
///     .with_timeout(Duration::from_millis(5000))
///     .with_read_terminator("\n")
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VisaChannelBuilder {
    resource: String,
    timeout: Duration,
    // Only consumed by a real session.
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    read_terminator: String,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    write_terminator: String,
}

impl VisaChannelBuilder {
    /// Create a new builder for a VISA resource string
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: DEFAULT_TIMEOUT,
            read_terminator: "\n".to_string(),
            write_terminator: "\n".to_string(),
        }
    }

    /// Set response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set read terminator character(s)
    pub fn with_read_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.read_terminator = terminator.into();
        self
    }

    /// Set write terminator character(s)
    pub fn with_write_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.write_terminator = terminator.into();
        self
    }

    /// Open the VISA session
    #[cfg(feature = "instrument_visa")]
    pub async fn open(self) -> AppResult<VisaChannel> {
        let resource = self.resource.clone();
        let timeout = self.timeout;

        let session = tokio::task::spawn_blocking(move || open_session(&resource, timeout))
            .await
            .map_err(|e| DaqError::Transport {
                resource: self.resource.clone(),
                command: "open".to_string(),
                reason: format!("VISA open task panicked: {}", e),
            })??;

        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource,
            self.timeout.as_millis()
        );

        Ok(VisaChannel {
            inner: Some(Arc::new(Mutex::new(session))),
            resource: self.resource,
            timeout: self.timeout,
            read_terminator: self.read_terminator,
            write_terminator: self.write_terminator,
        })
    }

    /// Open the VISA session (unavailable without the VISA feature)
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(self) -> AppResult<VisaChannel> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

/// An open instrument together with the resource manager it was opened from.
///
/// Closing a VISA resource manager closes every session it opened, so the
/// manager lives as long as the instrument. Fields drop in order: the
/// instrument first, then its manager.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    instrument: Instrument,
    _rm: DefaultRM,
}

#[cfg(feature = "instrument_visa")]
fn open_session(resource: &str, timeout: Duration) -> AppResult<VisaSession> {
    let link_err = |reason: String| DaqError::Transport {
        resource: resource.to_string(),
        command: "open".to_string(),
        reason,
    };

    let rm = DefaultRM::new()
        .map_err(|e| link_err(format!("failed to create VISA resource manager: {}", e)))?;
    let name = CString::new(resource)
        .map_err(|e| DaqError::Configuration(format!("invalid resource string: {}", e)))?;
    let instrument = rm
        .open(&name.into(), AccessMode::NO_LOCK, timeout)
        .map_err(|e| link_err(format!("failed to open VISA resource: {}", e)))?;

    let timeout_ms = timeout.as_millis() as u32;
    let attr = visa_rs::attribute::AttrTmoValue::new_checked(timeout_ms)
        .ok_or_else(|| DaqError::Configuration(format!("invalid VISA timeout {}ms", timeout_ms)))?;
    instrument
        .set_attr(attr)
        .map_err(|e| link_err(format!("failed to set VISA timeout: {}", e)))?;

    Ok(VisaSession {
        instrument,
        _rm: rm,
    })
}

/// VISA-backed [`CommandChannel`]
#[cfg(feature = "instrument_visa")]
pub struct VisaChannel {
    inner: Option<Arc<Mutex<VisaSession>>>,
    resource: String,
    timeout: Duration,
    read_terminator: String,
    write_terminator: String,
}

/// Placeholder channel when the `instrument_visa` feature is disabled.
///
/// [`VisaChannelBuilder::open`] never returns one in this build.
#[cfg(not(feature = "instrument_visa"))]
pub struct VisaChannel {
    builder: VisaChannelBuilder,
}

#[cfg(feature = "instrument_visa")]
impl VisaChannel {
    fn session(&self, command: &str) -> AppResult<Arc<Mutex<VisaSession>>> {
        self.inner.clone().ok_or_else(|| DaqError::Transport {
            resource: self.resource.clone(),
            command: command.to_string(),
            reason: "VISA session closed".to_string(),
        })
    }

    fn classify(&self, command: &str, err: std::io::Error) -> DaqError {
        let text = err.to_string();
        if err.kind() == std::io::ErrorKind::TimedOut || text.contains("TMO") {
            DaqError::Timeout {
                resource: self.resource.clone(),
                command: command.to_string(),
                timeout: self.timeout,
            }
        } else {
            DaqError::Transport {
                resource: self.resource.clone(),
                command: command.to_string(),
                reason: text,
            }
        }
    }

    /// Run one blocking VISA transaction, bounded by the channel timeout.
    async fn transact(&self, command: &str, read_reply: bool) -> AppResult<Option<Vec<u8>>> {
        let session = self.session(command)?;
        let payload = format!("{}{}", command, self.write_terminator);
        let delimiter = self.read_terminator.bytes().last().unwrap_or(b'\n');

        let task = tokio::task::spawn_blocking(move || -> std::io::Result<Option<Vec<u8>>> {
            let session = session.blocking_lock();
            let instr = &session.instrument;
            (&*instr).write_all(payload.as_bytes())?;
            if !read_reply {
                return Ok(None);
            }
            let mut reply = Vec::new();
            BufReader::new(instr).read_until(delimiter, &mut reply)?;
            Ok(Some(reply))
        });

        // The VISA timeout attribute bounds the read; this is a backstop in case
        // the driver ignores it.
        let backstop = self.timeout + Duration::from_millis(500);
        match tokio::time::timeout(backstop, task).await {
            Err(_) => Err(DaqError::Timeout {
                resource: self.resource.clone(),
                command: command.to_string(),
                timeout: self.timeout,
            }),
            Ok(Err(join)) => Err(DaqError::Transport {
                resource: self.resource.clone(),
                command: command.to_string(),
                reason: format!("VISA I/O task panicked: {}", join),
            }),
            Ok(Ok(result)) => result.map_err(|e| self.classify(command, e)),
        }
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl CommandChannel for VisaChannel {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        self.transact(command, false).await?;
        debug!("VISA write sent: {}", command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let raw = self.transact(command, true).await?.unwrap_or_default();
        let text = String::from_utf8(raw).map_err(|e| DaqError::Protocol {
            resource: self.resource.clone(),
            command: command.to_string(),
            reason: format!("reply is not valid UTF-8: {}", e),
        })?;
        let reply = text
            .trim_end_matches('\0')
            .trim_end_matches(self.read_terminator.as_str())
            .trim()
            .to_string();
        debug!("VISA query '{}' -> '{}'", command, reply);
        Ok(reply)
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.inner.take().is_some() {
            debug!("VISA resource '{}' closed", self.resource);
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl CommandChannel for VisaChannel {
    fn resource(&self) -> &str {
        &self.builder.resource
    }

    fn timeout(&self) -> Duration {
        self.builder.timeout
    }

    async fn send(&mut self, _command: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn query(&mut self, _command: &str) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// List the VISA resources currently visible (`?*INSTR`).
#[cfg(feature = "instrument_visa")]
pub async fn discover_resources() -> AppResult<Vec<String>> {
    tokio::task::spawn_blocking(|| {
        let link_err = |reason: String| DaqError::Transport {
            resource: "VISA".to_string(),
            command: "find_res_list".to_string(),
            reason,
        };
        let rm = DefaultRM::new()
            .map_err(|e| link_err(format!("failed to create VISA resource manager: {}", e)))?;
        let expr = CString::new("?*INSTR")
            .map_err(|e| DaqError::Configuration(e.to_string()))?
            .into();
        let mut list = rm
            .find_res_list(&expr)
            .map_err(|e| link_err(e.to_string()))?;

        let mut found = Vec::new();
        while let Some(resource) = list.find_next().map_err(|e| link_err(e.to_string()))? {
            found.push(resource.to_string());
        }
        Ok(found)
    })
    .await
    .map_err(|e| DaqError::Transport {
        resource: "VISA".to_string(),
        command: "find_res_list".to_string(),
        reason: format!("discovery task panicked: {}", e),
    })?
}

/// List the VISA resources currently visible (unavailable without the VISA feature)
#[cfg(not(feature = "instrument_visa"))]
pub async fn discover_resources() -> AppResult<Vec<String>> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = VisaChannelBuilder::new("USB0::0x0699::0x0353::2234106::INSTR");
        assert_eq!(builder.resource, "USB0::0x0699::0x0353::2234106::INSTR");
        assert_eq!(builder.timeout, Duration::from_millis(5000));
        assert_eq!(builder.read_terminator, "\n");
        assert_eq!(builder.write_terminator, "\n");
    }

    #[test]
    fn test_builder_overrides() {
        let builder = VisaChannelBuilder::new("GPIB0::5::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_read_terminator("\r\n")
            .with_write_terminator("\r\n");

        assert_eq!(builder.timeout, Duration::from_millis(2000));
        assert_eq!(builder.read_terminator, "\r\n");
        assert_eq!(builder.write_terminator, "\r\n");
    }

    /// Needs a real instrument: `FRH_TEST_VISA_RESOURCE=USB0::... cargo test
    /// --features instrument_visa -- --ignored`
    #[cfg(feature = "instrument_visa")]
    #[tokio::test]
    #[ignore = "requires a VISA instrument"]
    async fn test_session_outlives_open() {
        let Ok(resource) = std::env::var("FRH_TEST_VISA_RESOURCE") else {
            return;
        };
        let mut channel = VisaChannelBuilder::new(resource).open().await.unwrap();

        // Both queries run after `open` returned and its locals were dropped.
        assert!(!channel.query("*IDN?").await.unwrap().is_empty());
        assert!(!channel.query("*IDN?").await.unwrap().is_empty());
        channel.close().await.unwrap();
        assert!(channel.query("*IDN?").await.unwrap_err().is_transport());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature() {
        let result = VisaChannelBuilder::new("GPIB0::5::INSTR").open().await;
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(_))));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_placeholder_reports_builder_settings() {
        let mut channel = VisaChannel {
            builder: VisaChannelBuilder::new("GPIB0::5::INSTR")
                .with_timeout(Duration::from_millis(1500)),
        };
        assert_eq!(channel.resource(), "GPIB0::5::INSTR");
        assert_eq!(channel.timeout(), Duration::from_millis(1500));
        assert!(matches!(
            channel.query("*IDN?").await,
            Err(DaqError::FeatureNotEnabled(_))
        ));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_discover_without_feature() {
        let result = discover_resources().await;
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(_))));
    }
}
