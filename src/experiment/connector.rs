//! Opening instrument channels by role.

use crate::channel::{discover_resources, BoxedChannel, VisaChannelBuilder};
use crate::config::{FrhConfig, InstrumentConfig};
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentRole;
use async_trait::async_trait;
use tracing::{info, warn};

/// Source of open channels for the orchestrator.
#[async_trait]
pub trait InstrumentConnector: Send + Sync {
    /// Open a channel to the instrument playing `role`.
    async fn open(&self, role: InstrumentRole) -> AppResult<BoxedChannel>;
}

/// Opens VISA sessions from the `[generator]` / `[multimeter]` sections.
#[derive(Debug, Clone)]
pub struct VisaConnector {
    generator: InstrumentConfig,
    multimeter: InstrumentConfig,
}

impl VisaConnector {
    /// Connector for the instruments in `config`.
    pub fn from_config(config: &FrhConfig) -> Self {
        Self {
            generator: config.generator.clone(),
            multimeter: config.multimeter.clone(),
        }
    }

    fn settings(&self, role: InstrumentRole) -> &InstrumentConfig {
        match role {
            InstrumentRole::Generator => &self.generator,
            InstrumentRole::Multimeter => &self.multimeter,
        }
    }
}

#[async_trait]
impl InstrumentConnector for VisaConnector {
    async fn open(&self, role: InstrumentRole) -> AppResult<BoxedChannel> {
        let settings = self.settings(role);
        let Some(resource) = settings.resource.as_deref() else {
            log_discovered(role).await;
            return Err(DaqError::Configuration(format!(
                "no {role} resource configured; set [{role}].resource or FRH_{}__RESOURCE",
                role.to_string().to_uppercase()
            )));
        };

        info!("Opening {} at '{}'", role, resource);
        let channel = VisaChannelBuilder::new(resource)
            .with_timeout(settings.timeout())
            .with_write_terminator(settings.write_terminator.clone())
            .with_read_terminator(settings.read_terminator.clone())
            .open()
            .await?;
        Ok(Box::new(channel))
    }
}

async fn log_discovered(role: InstrumentRole) {
    match discover_resources().await {
        Ok(resources) if resources.is_empty() => {
            warn!("No {} resource configured and no VISA resources found", role)
        }
        Ok(resources) => {
            warn!("No {} resource configured. Detected resources:", role);
            for resource in resources {
                warn!("  {}", resource);
            }
        }
        Err(e) => warn!("No {} resource configured; discovery failed: {}", role, e),
    }
}
