//! Relay network bootstrap
//!
//! Tracks relay availability as a monotonic progression: `Unknown`, then
//! `Attempting`, then exactly one of `Current` or `Failed`. Settled states are
//! never left, so a late provider report cannot regress the status the host
//! already saw. Bootstrap that stays in `Attempting` past the configured
//! timeout is failed locally.

use std::sync::Arc;

use relaynet_core::{
    Identity, PingLocation, PopId, PopPing, RelayAvailability, RelayConfig, TimeSource,
    Timestamp, TransportProvider,
};
use tracing::{debug, info, warn};

/// Failure reason used when bootstrap exceeds its timeout
pub const BOOTSTRAP_TIMEOUT_REASON: &str = "relay bootstrap timed out";

pub struct RelayBootstrap {
    config: RelayConfig,
    status: RelayAvailability,
    started_at: Option<Timestamp>,
    time_source: Arc<dyn TimeSource>,
}

impl RelayBootstrap {
    pub fn new(config: RelayConfig, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            config,
            status: RelayAvailability::Unknown,
            started_at: None,
            time_source,
        }
    }

    /// Start bootstrap; repeated calls are no-ops
    pub fn init(&mut self, provider: &mut dyn TransportProvider) {
        if self.started_at.is_some() {
            debug!(status = %self.status, "Relay bootstrap already requested");
            return;
        }
        provider.bootstrap_relay();
        self.started_at = Some(self.time_source.now());
        info!(timeout_ms = self.config.bootstrap_timeout_ms, "Started relay bootstrap");
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Last status the host observed, without asking the provider
    pub fn current(&self) -> &RelayAvailability {
        &self.status
    }

    /// Poll the provider and apply the bootstrap timeout
    pub fn status(&mut self, provider: &mut dyn TransportProvider) -> RelayAvailability {
        if self.status.is_settled() {
            return self.status.clone();
        }
        let Some(started_at) = self.started_at else {
            return self.status.clone();
        };

        let reported = provider.relay_status();
        self.observe(reported);

        let elapsed = self.time_source.now().duration_since(started_at);
        if !self.status.is_settled() && elapsed >= self.config.bootstrap_timeout() {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "Relay bootstrap timed out");
            self.observe(RelayAvailability::Failed(BOOTSTRAP_TIMEOUT_REASON.to_string()));
        }
        self.status.clone()
    }

    /// Record a status; returns whether it advanced the progression
    pub fn observe(&mut self, next: RelayAvailability) -> bool {
        if self.status.can_progress_to(&next) {
            info!(from = %self.status, to = %next, "Relay availability changed");
            self.status = next;
            true
        } else {
            if next != self.status {
                debug!(current = %self.status, ignored = %next, "Ignoring relay status regression");
            }
            false
        }
    }

    /// Local identity; `None` until bootstrap settled
    pub fn local_identity(&self, provider: &dyn TransportProvider) -> Option<Identity> {
        if !self.status.is_settled() {
            return None;
        }
        provider.local_identity()
    }

    /// Estimated round trip to a remote ping location, from cached topology
    pub fn estimate_latency(
        &self,
        provider: &dyn TransportProvider,
        remote: &PingLocation,
    ) -> Option<u32> {
        let local = provider.local_ping_location()?;
        provider.estimate_ping(&local, remote)
    }

    pub fn estimate_latency_between(
        &self,
        provider: &dyn TransportProvider,
        from: &PingLocation,
        to: &PingLocation,
    ) -> Option<u32> {
        provider.estimate_ping(from, to)
    }

    pub fn local_ping_location(&self, provider: &dyn TransportProvider) -> Option<PingLocation> {
        provider.local_ping_location()
    }

    pub fn pop_list(&self, provider: &dyn TransportProvider) -> Vec<PopId> {
        provider.pop_list()
    }

    pub fn ping_to_pop(&self, provider: &dyn TransportProvider, pop: PopId) -> Option<PopPing> {
        provider.ping_to_pop(pop)
    }
}
