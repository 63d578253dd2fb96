//! Instrument command channel
//!
//! Hardware-agnostic "send command / send query" interface over a named
//! resource. Implementations handle the protocol details (VISA over USB/GPIB,
//! the in-process simulated bench).
//!
//! ## Contract
//! - `send` is a write only; it fails with a transport error if the link is
//!   down or the write times out.
//! - `query` writes, then blocks until the read terminator or the timeout.
//!   A timeout surfaces as [`DaqError::Timeout`], an undecodable reply as
//!   [`DaqError::Protocol`].
//! - No retries at this layer. Calls are executed in the order they are made;
//!   `&mut self` keeps one caller per handle.

pub mod visa;

pub use visa::{discover_resources, VisaChannel, VisaChannelBuilder};

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

/// Default response timeout for both bench instruments.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Send/query transport over one named instrument resource.
#[async_trait]
pub trait CommandChannel: Send {
    /// Resource string this channel is bound to.
    fn resource(&self) -> &str;

    /// Response timeout applied to every read.
    fn timeout(&self) -> Duration;

    /// Write a command; no response is read.
    async fn send(&mut self, command: &str) -> AppResult<()>;

    /// Write a command and read one terminated response (terminator stripped).
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Release the underlying resource.
    async fn close(&mut self) -> AppResult<()>;
}

/// Owned, type-erased channel as held by the instrument drivers.
pub type BoxedChannel = Box<dyn CommandChannel>;

/// Parse a numeric SCPI reply (`"1.000000E+03"`, `" 0.5 "`).
pub fn parse_f64(resource: &str, command: &str, reply: &str) -> AppResult<f64> {
    let trimmed = reply.trim();
    trimmed
        .parse::<f64>()
        .map_err(|e| DaqError::Protocol {
            resource: resource.to_string(),
            command: command.to_string(),
            reason: format!("expected a number, got '{}' ({})", trimmed, e),
        })
}

/// Parse a comma-separated list of readings, preserving order.
///
/// Empty fields (a trailing comma) are skipped; anything else that is not a
/// number fails the whole reply.
pub fn parse_f64_list(resource: &str, command: &str, reply: &str) -> AppResult<Vec<f64>> {
    reply
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| parse_f64(resource, command, field))
        .collect()
}
