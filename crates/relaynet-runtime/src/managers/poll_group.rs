//! Poll group management
//!
//! A poll group lets the host receive from many connections with one call.
//! A connection belongs to at most one group; assigning it to another group
//! moves it.

use std::sync::Arc;

use relaynet_core::{
    ConnectionHandle, Message, PollGroupHandle, RelayNetError, Result, ResultCode, TimeSource,
    TransportProvider,
};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::registry::HandleRegistry;

/// Members of a poll group, in handle order
pub type GroupMembers = SmallVec<[ConnectionHandle; 8]>;

// ----------------------------------------------------------------------------
// Poll Group Manager
// ----------------------------------------------------------------------------

pub struct PollGroupManager {
    max_receive_batch: usize,
    time_source: Arc<dyn TimeSource>,
    stats: PollGroupStats,
}

impl PollGroupManager {
    pub fn new(max_receive_batch: usize, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            max_receive_batch,
            time_source,
            stats: PollGroupStats::default(),
        }
    }

    pub fn create(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
    ) -> Result<PollGroupHandle> {
        let group = provider
            .create_poll_group()
            .ok_or_else(|| RelayNetError::provider("create_poll_group", ResultCode::Fail))?;
        registry.insert_poll_group(group, self.time_source.now());
        self.stats.groups_created += 1;
        debug!(%group, "Created poll group");
        Ok(group)
    }

    /// Assign a live connection to `group`, leaving any previous group
    pub fn assign(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<()> {
        let current = registry.live_connection(connection)?.poll_group;
        registry.poll_group(group)?;
        if current == Some(group) {
            return Ok(());
        }

        if !provider.set_connection_poll_group(connection, Some(group)) {
            return Err(RelayNetError::provider(
                "set_connection_poll_group",
                ResultCode::InvalidParam,
            ));
        }
        let previous = registry.assign(connection, group)?;
        self.stats.assignments += 1;
        debug!(%connection, %group, previous = ?previous, "Assigned connection to poll group");
        Ok(())
    }

    /// Remove `connection` from its group; `false` if it had none
    pub fn unassign(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
    ) -> Result<bool> {
        if registry.live_connection(connection)?.poll_group.is_none() {
            return Ok(false);
        }
        if !provider.set_connection_poll_group(connection, None) {
            debug!(%connection, "Provider had no poll group for connection");
        }
        Ok(registry.unassign(connection)?.is_some())
    }

    /// Drain up to `max` messages from all members of `group`
    pub fn receive(
        &mut self,
        registry: &HandleRegistry,
        provider: &mut dyn TransportProvider,
        group: PollGroupHandle,
        max: usize,
    ) -> Result<Vec<Message>> {
        registry.poll_group(group)?;
        let max = max.min(self.max_receive_batch);
        if max == 0 {
            return Ok(Vec::new());
        }
        let messages = provider.receive_on_poll_group(group, max);
        self.stats.messages_received += messages.len() as u64;
        Ok(messages)
    }

    /// Destroy `group`, first unassigning every member; returns the member count
    pub fn destroy(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        group: PollGroupHandle,
    ) -> Result<usize> {
        let members = self.members(registry, group)?;
        for member in &members {
            provider.set_connection_poll_group(*member, None);
            registry.unassign(*member)?;
        }

        if !provider.destroy_poll_group(group) {
            debug!(%group, "Provider had already destroyed the poll group");
        }
        registry.remove_poll_group(group);
        self.stats.groups_destroyed += 1;
        info!(%group, members = members.len(), "Destroyed poll group");
        Ok(members.len())
    }

    pub fn members(&self, registry: &HandleRegistry, group: PollGroupHandle) -> Result<GroupMembers> {
        Ok(registry.poll_group(group)?.members.iter().copied().collect())
    }

    pub fn statistics(&self) -> &PollGroupStats {
        &self.stats
    }
}

/// Statistics for poll group management
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollGroupStats {
    pub groups_created: u64,
    pub groups_destroyed: u64,
    pub assignments: u64,
    pub messages_received: u64,
}
