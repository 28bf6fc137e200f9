//! Centralized Configuration Management
//!
//! Configuration for every component of the connection layer, aggregated in
//! [`RelayNetConfig`]. Each section has sensible defaults plus presets, and
//! the whole tree can be loaded from TOML.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{RelayNetError, Result};

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for connection handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Refuse `connect` while the relay network is not `Current`
    pub require_relay_for_connect: bool,
    /// Linger mode used by shutdown when closing live connections
    pub linger_on_shutdown: bool,
    /// Reason code sent to peers when shutdown closes their connection
    pub shutdown_reason_code: i32,
    /// Number of state transitions kept in the audit trail
    pub audit_trail_capacity: usize,
    /// Number of closed handles remembered for precise error reports
    pub retired_handle_memory: usize,
    /// Upper bound on messages returned by a single receive call
    pub max_receive_batch: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            require_relay_for_connect: true,
            linger_on_shutdown: false,
            shutdown_reason_code: 1000, // generic "application closed"
            audit_trail_capacity: 1000,
            retired_handle_memory: 4096,
            max_receive_batch: 256,
        }
    }
}

impl ConnectionConfig {
    /// Allow direct connections without waiting for the relay network
    pub fn direct() -> Self {
        Self {
            require_relay_for_connect: false,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// Configuration for relay bootstrap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Start bootstrap as soon as the context is built
    pub init_on_start: bool,
    /// Give up on a bootstrap stuck in `Attempting` after this long
    pub bootstrap_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            init_on_start: false,
            bootstrap_timeout_ms: 30_000,
        }
    }
}

impl RelayConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Bridge Configuration
// ----------------------------------------------------------------------------

/// Configuration for the callback bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Log a warning when a single pump drains more native events than this
    pub backlog_warning_threshold: usize,
    /// Keep dispatching after a handler panics; when off, the pump stops
    /// at the panic and returns `HandlerFailed`. Panics never unwind out of
    /// `pump()` either way.
    pub isolate_handler_panics: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backlog_warning_threshold: 512,
            isolate_handler_panics: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Ticket Configuration
// ----------------------------------------------------------------------------

/// Configuration for credential tickets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// Maximum tickets that are pending or valid at the same time
    pub max_outstanding: usize,
    /// Canceled tickets remembered so late queries report `TicketCanceled`
    pub canceled_memory: usize,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 16,
            canceled_memory: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Main Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of a relay context
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayNetConfig {
    pub connections: ConnectionConfig,
    pub relay: RelayConfig,
    pub bridge: BridgeConfig,
    pub tickets: TicketConfig,
}

impl RelayNetConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for tests: no relay gate, short bootstrap timeout
    pub fn testing() -> Self {
        Self {
            connections: ConnectionConfig {
                audit_trail_capacity: 64,
                retired_handle_memory: 64,
                ..ConnectionConfig::direct()
            },
            relay: RelayConfig {
                init_on_start: false,
                bootstrap_timeout_ms: 1_000,
            },
            bridge: BridgeConfig::default(),
            tickets: TicketConfig {
                max_outstanding: 4,
                canceled_memory: 8,
            },
        }
    }

    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|err| RelayNetError::config_error(format!("invalid TOML: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| RelayNetError::config_error(err.to_string()))
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.connections.audit_trail_capacity == 0 {
            return Err(RelayNetError::config_error(
                "Audit trail capacity cannot be zero",
            ));
        }
        if self.connections.max_receive_batch == 0 {
            return Err(RelayNetError::config_error(
                "Receive batch size cannot be zero",
            ));
        }
        if self.relay.bootstrap_timeout_ms == 0 {
            return Err(RelayNetError::config_error(
                "Bootstrap timeout cannot be zero",
            ));
        }
        if self.bridge.backlog_warning_threshold == 0 {
            return Err(RelayNetError::config_error(
                "Backlog warning threshold cannot be zero",
            ));
        }
        if self.tickets.max_outstanding == 0 {
            return Err(RelayNetError::config_error(
                "Max outstanding tickets cannot be zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RelayNetConfig::default().validate().is_ok());
        assert!(RelayNetConfig::testing().validate().is_ok());
        assert!(RelayNetConfig::default().connections.require_relay_for_connect);
        assert!(!RelayNetConfig::testing().connections.require_relay_for_connect);
    }

    #[test]
    fn test_rejects_zero_capacities() {
        let mut config = RelayNetConfig::default();
        config.tickets.max_outstanding = 0;
        assert!(config.validate().is_err());

        let mut config = RelayNetConfig::default();
        config.connections.audit_trail_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RelayNetConfig::from_toml_str(
            r#"
            [relay]
            bootstrap_timeout_ms = 5000

            [connections]
            require_relay_for_connect = false
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.bootstrap_timeout(), Duration::from_secs(5));
        assert!(!config.connections.require_relay_for_connect);
        assert_eq!(config.tickets, TicketConfig::default());
    }

    #[test]
    fn test_toml_round_trip_and_invalid_input() {
        let rendered = RelayNetConfig::testing().to_toml_string().unwrap();
        let parsed = RelayNetConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, RelayNetConfig::testing());

        assert!(RelayNetConfig::from_toml_str("[tickets]\nmax_outstanding = 0").is_err());
        assert!(RelayNetConfig::from_toml_str("not toml =").is_err());
    }
}
