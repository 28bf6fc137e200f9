//! Relay context builder
//!
//! Builder-style setup for hosts and tests: pick the provider, override
//! configuration and time source, optionally install console logging.

use std::sync::Arc;

use relaynet_core::{RelayNetConfig, Result, SystemTimeSource, TimeSource, TransportProvider};
use tracing::{info, Level};

use crate::context::RelayContext;
use crate::logging::init_console_logging;

// ----------------------------------------------------------------------------
// Context Builder
// ----------------------------------------------------------------------------

/// Builder for a [`RelayContext`]
pub struct RelayContextBuilder<P: TransportProvider> {
    provider: P,
    config: RelayNetConfig,
    time_source: Arc<dyn TimeSource>,
    log_level: Option<Level>,
}

impl<P: TransportProvider> RelayContextBuilder<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: RelayNetConfig::default(),
            time_source: Arc::new(SystemTimeSource),
            log_level: None,
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: RelayNetConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the wall clock, e.g. with a manual clock in tests
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Configure console logging
    pub fn with_console_logging(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Disable logging
    pub fn with_no_logging(mut self) -> Self {
        self.log_level = None;
        self
    }

    /// Start relay bootstrap as soon as the context is built
    pub fn init_relay_on_start(mut self, enabled: bool) -> Self {
        self.config.relay.init_on_start = enabled;
        self
    }

    /// Validate the configuration and build the context
    pub fn build(self) -> Result<RelayContext<P>> {
        if let Some(level) = self.log_level {
            if !init_console_logging(level) {
                info!("Global subscriber already installed; keeping it");
            }
        }
        RelayContext::new(self.provider, self.config, self.time_source)
    }
}
