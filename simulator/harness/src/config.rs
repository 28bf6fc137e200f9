//! Simulated endpoint configuration

use relaynet_core::{Identity, PingLocation, PopId};

/// How relay bootstrap progresses on a simulated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayScript {
    /// Become `Current` on the n-th status poll after bootstrap started
    SucceedAfter(u32),
    /// Become `Failed(reason)` on the n-th status poll
    FailAfter(u32, String),
    /// Stay `Attempting` forever
    Stall,
}

/// Configuration for one simulated endpoint
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub identity: Identity,
    pub relay_script: RelayScript,
    /// Locality token reported once the relay network is current
    pub ping_location: PingLocation,
    /// Relay points of presence with the ping to each
    pub pops: Vec<(PopId, u32)>,
    /// Bytes that may queue on a connection that is not connected yet
    pub send_buffer_limit: usize,
    /// Probability an unreliable message is lost (0.0 = never)
    pub unreliable_loss_rate: f64,
    /// Deliver unreliable messages at a random position in the receive queue
    pub reorder_unreliable: bool,
    /// Report connection status through the broker instead of `poll_events`
    pub status_via_broker: bool,
}

impl EndpointConfig {
    pub fn new(identity: impl Into<Identity>) -> Self {
        let pops = [("fra", 12), ("iad", 85), ("sgp", 170)]
            .iter()
            .filter_map(|(code, ping)| PopId::from_code(code).map(|pop| (pop, *ping)))
            .collect();
        Self {
            identity: identity.into(),
            relay_script: RelayScript::SucceedAfter(1),
            ping_location: PingLocation::new("fra=12,iad=85,sgp=170"),
            pops,
            send_buffer_limit: 64 * 1024,
            unreliable_loss_rate: 0.0,
            reorder_unreliable: false,
            status_via_broker: false,
        }
    }

    /// Lossy, reordering network for unreliable traffic
    pub fn lossy(identity: impl Into<Identity>) -> Self {
        Self {
            unreliable_loss_rate: 0.2,
            reorder_unreliable: true,
            ..Self::new(identity)
        }
    }

    pub fn with_relay_script(mut self, script: RelayScript) -> Self {
        self.relay_script = script;
        self
    }

    pub fn with_ping_location(mut self, location: PingLocation) -> Self {
        self.ping_location = location;
        self
    }

    pub fn with_send_buffer_limit(mut self, limit: usize) -> Self {
        self.send_buffer_limit = limit;
        self
    }

    pub fn with_reordering(mut self, loss_rate: f64) -> Self {
        self.unreliable_loss_rate = loss_rate;
        self.reorder_unreliable = true;
        self
    }

    pub fn with_status_via_broker(mut self) -> Self {
        self.status_via_broker = true;
        self
    }
}
