//! Connection lifecycle management
//!
//! The ConnectionManager owns every operation on a connection handle: opening,
//! accepting, closing, sending and status queries. It also applies provider
//! state reports to the registry and turns them into bridge events.

use std::collections::VecDeque;
use std::sync::Arc;

use relaynet_core::{
    BridgeEvent, ConnectionConfig, ConnectionHandle, ConnectionInfo, ConnectionState,
    DeliveryClass, Identity, IncomingConnectionRequest, ListenSocketHandle, Message,
    RealTimeStatus, RelayAvailability, RelayNetError, Result, ResultCode, SendFailure,
    SendReceipt, StateChangeEvent, StateTransitionError, TimeSource, Timestamp,
    TransportProvider, VirtualPort,
};
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, trace, warn};

use crate::registry::{ConnectionEntry, HandleRegistry, ListenSocketEntry};

/// Events produced by a single provider status report
pub type StatusEvents = SmallVec<[BridgeEvent; 2]>;

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Manages connection handles and their state transitions
pub struct ConnectionManager {
    config: ConnectionConfig,
    /// Connection audit trail, oldest first
    audit_trail: VecDeque<AuditEntry>,
    /// Time source for audit timestamps
    time_source: Arc<dyn TimeSource>,
    stats: ConnectionStats,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            config,
            audit_trail: VecDeque::new(),
            time_source,
            stats: ConnectionStats::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    // --- opening and accepting ---

    /// Open an outbound connection; the handle starts in `Connecting`
    pub fn connect(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        relay: &RelayAvailability,
        remote: &Identity,
        port: VirtualPort,
    ) -> Result<ConnectionHandle> {
        if self.config.require_relay_for_connect && !relay.is_current() {
            self.stats.connects_refused += 1;
            debug!(%remote, %relay, "Refusing connect until relay network is current");
            return Err(RelayNetError::TransportUnavailable {
                status: relay.clone(),
            });
        }

        let handle = provider
            .connect(remote, port)
            .ok_or_else(|| RelayNetError::provider("connect", ResultCode::Fail))?;
        if registry.connection_entry(handle).is_some() {
            warn!(%handle, "Provider reissued a registered connection handle");
        }

        registry.insert_connection(ConnectionEntry::outbound(
            handle,
            remote.clone(),
            self.time_source.now(),
        ));
        self.record(
            handle,
            ConnectionState::None,
            ConnectionState::Connecting,
            TransitionCause::Connect,
        );
        self.stats.connections_opened += 1;
        info!(%handle, %remote, %port, "Opened connection");
        Ok(handle)
    }

    /// Accept a pending inbound request
    pub fn accept(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
    ) -> Result<()> {
        let entry = registry.live_connection_mut(connection)?;
        if !entry.pending_request {
            return Err(RelayNetError::NotPendingRequest {
                handle: connection.raw(),
                state: entry.state,
            });
        }

        let code = provider.accept(connection);
        if !code.is_ok() {
            return Err(RelayNetError::provider("accept", code));
        }
        entry.pending_request = false;
        self.stats.requests_accepted += 1;
        debug!(%connection, remote = %entry.remote, "Accepted incoming connection");
        Ok(())
    }

    // --- closing ---

    /// Close and release a connection; `false` if the handle is not registered
    ///
    /// Dead connections must still be closed to release the provider
    /// resource. Closing never produces a state change event.
    pub fn close(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
        reason: i32,
        debug_message: &str,
        linger: bool,
    ) -> bool {
        let Some(entry) = registry.connection_entry(connection) else {
            trace!(%connection, "Close on unregistered handle ignored");
            return false;
        };
        let from = entry.state;

        if !provider.close_connection(connection, reason, debug_message, linger) {
            debug!(%connection, "Provider had already released the connection");
        }
        registry.remove_connection(connection);
        self.record(
            connection,
            from,
            ConnectionState::Dead,
            TransitionCause::LocalClose,
        );
        self.stats.connections_closed += 1;
        info!(%connection, reason, linger, "Closed connection");
        true
    }

    // --- data path ---

    pub fn send(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
        payload: &[u8],
        delivery: DeliveryClass,
    ) -> Result<SendReceipt> {
        let entry = registry.live_connection_mut(connection)?;
        if entry.pending_request {
            return Err(RelayNetError::provider("send", ResultCode::InvalidState));
        }

        match provider.send(connection, payload, delivery) {
            Ok(sequence) => {
                if let Some(last) = entry.last_sequence {
                    if sequence <= last {
                        warn!(%connection, sequence, last, "Provider sequence went backwards");
                    }
                }
                entry.last_sequence = Some(sequence);
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += payload.len() as u64;
                Ok(SendReceipt {
                    connection,
                    sequence,
                })
            }
            Err(SendFailure::LimitExceeded {
                pending_bytes,
                limit,
            }) => {
                self.stats.sends_backpressured += 1;
                Err(RelayNetError::BackpressureExceeded {
                    pending_bytes,
                    limit,
                })
            }
            Err(SendFailure::Rejected(code)) => Err(RelayNetError::provider("send", code)),
        }
    }

    pub fn flush(
        &mut self,
        registry: &HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
    ) -> Result<()> {
        registry.live_connection(connection)?;
        match provider.flush(connection) {
            ResultCode::Ok => Ok(()),
            code => Err(RelayNetError::provider("flush", code)),
        }
    }

    /// Drain up to `max` messages from one connection
    pub fn receive(
        &mut self,
        registry: &HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
        max: usize,
    ) -> Result<Vec<Message>> {
        registry.live_connection(connection)?;
        let max = max.min(self.config.max_receive_batch);
        if max == 0 {
            return Ok(Vec::new());
        }
        let messages = provider.receive_on_connection(connection, max);
        self.stats.messages_received += messages.len() as u64;
        Ok(messages)
    }

    // --- queries ---

    pub fn info(
        &self,
        registry: &HandleRegistry,
        provider: &dyn TransportProvider,
        connection: ConnectionHandle,
    ) -> Result<ConnectionInfo> {
        registry.live_connection(connection)?;
        provider
            .query_info(connection)
            .ok_or_else(|| RelayNetError::provider("query_info", ResultCode::NoConnection))
    }

    pub fn real_time_status(
        &self,
        registry: &HandleRegistry,
        provider: &dyn TransportProvider,
        connection: ConnectionHandle,
    ) -> Result<RealTimeStatus> {
        registry.live_connection(connection)?;
        provider.query_real_time_status(connection).ok_or_else(|| {
            RelayNetError::provider("query_real_time_status", ResultCode::NoConnection)
        })
    }

    pub fn set_name(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        connection: ConnectionHandle,
        name: &str,
    ) -> Result<()> {
        let entry = registry.live_connection_mut(connection)?;
        if !provider.set_connection_name(connection, name) {
            return Err(RelayNetError::provider(
                "set_connection_name",
                ResultCode::NoConnection,
            ));
        }
        entry.name = name.to_string();
        Ok(())
    }

    pub fn set_user_tag(
        &mut self,
        registry: &mut HandleRegistry,
        connection: ConnectionHandle,
        tag: i64,
    ) -> Result<()> {
        registry.live_connection_mut(connection)?.user_tag = tag;
        Ok(())
    }

    pub fn user_tag(&self, registry: &HandleRegistry, connection: ConnectionHandle) -> Result<i64> {
        Ok(registry.live_connection(connection)?.user_tag)
    }

    // --- listen sockets ---

    pub fn create_listen_socket(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        port: VirtualPort,
    ) -> Result<ListenSocketHandle> {
        let handle = provider
            .create_listen_socket(port)
            .ok_or_else(|| RelayNetError::provider("create_listen_socket", ResultCode::InvalidParam))?;
        registry.insert_listen_socket(ListenSocketEntry {
            handle,
            port,
            opened_at: self.time_source.now(),
        });
        info!(socket = %handle, %port, "Listening");
        Ok(handle)
    }

    /// Close a listen socket and every connection it produced
    pub fn close_listen_socket(
        &mut self,
        registry: &mut HandleRegistry,
        provider: &mut dyn TransportProvider,
        socket: ListenSocketHandle,
    ) -> bool {
        if !registry.has_listen_socket(socket) {
            return false;
        }
        if !provider.close_listen_socket(socket) {
            debug!(%socket, "Provider had already released the listen socket");
        }

        for connection in registry.connections_from(socket) {
            if let Some(entry) = registry.remove_connection(connection) {
                self.record(
                    connection,
                    entry.state,
                    ConnectionState::Dead,
                    TransitionCause::LocalClose,
                );
                self.stats.connections_closed += 1;
            }
        }
        registry.remove_listen_socket(socket);
        info!(%socket, "Closed listen socket");
        true
    }

    // --- provider reports ---

    /// Apply a provider status report and produce the events to dispatch
    pub fn apply_status_change(
        &mut self,
        registry: &mut HandleRegistry,
        connection: ConnectionHandle,
        reported_old: ConnectionState,
        info: ConnectionInfo,
    ) -> StatusEvents {
        let now = self.time_source.now();
        let next = info.state;

        let Some(entry) = registry.connection_entry_mut(connection) else {
            return self.apply_unregistered(registry, connection, reported_old, info, now);
        };

        let previous = entry.state;
        if previous != reported_old {
            debug!(
                %connection,
                observed = %previous,
                reported = %reported_old,
                "Provider reported a different previous state"
            );
        }

        match previous.transition(connection, next) {
            Ok(transition) => {
                entry.state = next;
                if next == ConnectionState::Connected || next.is_terminal() {
                    entry.pending_request = false;
                }
                if transition.ends_connection() {
                    self.stats.terminal_observed += 1;
                    info!(%connection, state = %next, reason = ?info.end_reason, "Connection ended");
                }
            }
            Err(StateTransitionError::Duplicate { .. }) => {
                self.stats.duplicates_suppressed += 1;
                trace!(%connection, state = %next, "Suppressed duplicate status report");
                return StatusEvents::new();
            }
            Err(err) => {
                self.stats.rejected_transitions += 1;
                // Only a live connection may be forced to an end; ended ones stay put
                if !next.is_terminal() || previous.is_terminal() {
                    warn!(%connection, error = %err, "Dropped illegal status report");
                    return StatusEvents::new();
                }
                warn!(%connection, error = %err, "Forcing terminal state after illegal report");
                entry.state = next;
                entry.pending_request = false;
                self.stats.terminal_observed += 1;
            }
        }

        self.record(connection, previous, next, TransitionCause::Provider);
        smallvec![BridgeEvent::StateChanged(StateChangeEvent {
            connection,
            old_state: previous,
            new_state: next,
            info,
        })]
    }

    fn apply_unregistered(
        &mut self,
        registry: &mut HandleRegistry,
        connection: ConnectionHandle,
        reported_old: ConnectionState,
        info: ConnectionInfo,
        now: Timestamp,
    ) -> StatusEvents {
        let listen_socket = match info.listen_socket {
            Some(socket)
                if reported_old == ConnectionState::None
                    && info.state == ConnectionState::Connecting =>
            {
                socket
            }
            _ => {
                self.stats.stale_reports += 1;
                trace!(%connection, state = %info.state, "Status report for unregistered handle");
                return StatusEvents::new();
            }
        };
        if !registry.has_listen_socket(listen_socket) {
            self.stats.stale_reports += 1;
            debug!(%connection, socket = %listen_socket, "Incoming request on a closed listen socket");
            return StatusEvents::new();
        }

        registry.insert_connection(ConnectionEntry::inbound(
            connection,
            info.remote.clone(),
            listen_socket,
            now,
        ));
        self.record(
            connection,
            ConnectionState::None,
            ConnectionState::Connecting,
            TransitionCause::Provider,
        );
        self.stats.incoming_requests += 1;
        info!(%connection, remote = %info.remote, socket = %listen_socket, "Incoming connection request");

        let request = IncomingConnectionRequest {
            listen_socket,
            remote: info.remote.clone(),
            connection,
        };
        smallvec![
            BridgeEvent::StateChanged(StateChangeEvent {
                connection,
                old_state: ConnectionState::None,
                new_state: ConnectionState::Connecting,
                info,
            }),
            BridgeEvent::IncomingRequest(request),
        ]
    }

    // --- audit and statistics ---

    fn record(
        &mut self,
        connection: ConnectionHandle,
        from_state: ConnectionState,
        to_state: ConnectionState,
        cause: TransitionCause,
    ) {
        self.audit_trail.push_back(AuditEntry {
            timestamp: self.time_source.now(),
            connection,
            from_state,
            to_state,
            cause,
        });
        self.stats.state_transitions += 1;

        // Keep the last `audit_trail_capacity` entries
        while self.audit_trail.len() > self.config.audit_trail_capacity {
            self.audit_trail.pop_front();
        }
    }

    /// Most recent audit entries, oldest first
    pub fn recent_transitions(&self, limit: usize) -> Vec<AuditEntry> {
        let start = self.audit_trail.len().saturating_sub(limit);
        self.audit_trail.iter().skip(start).cloned().collect()
    }

    /// Count of registered connections in each state
    pub fn state_distribution(&self, registry: &HandleRegistry) -> StateDistribution {
        let mut distribution = StateDistribution::default();
        for entry in registry.connections() {
            match entry.state {
                ConnectionState::Connecting => distribution.connecting += 1,
                ConnectionState::FindingRoute => distribution.finding_route += 1,
                ConnectionState::Connected => distribution.connected += 1,
                ConnectionState::None => {}
                _ => distribution.ended += 1,
            }
        }
        distribution
    }

    pub fn statistics(&self) -> &ConnectionStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// What caused a recorded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransitionCause {
    /// Host called `connect`
    Connect,
    /// Reported by the provider
    Provider,
    /// Host closed the handle
    LocalClose,
}

/// One entry of the connection audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub connection: ConnectionHandle,
    pub from_state: ConnectionState,
    pub to_state: ConnectionState,
    pub cause: TransitionCause,
}

/// Statistics for connection management
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub connections_opened: u64,
    pub connects_refused: u64,
    pub incoming_requests: u64,
    pub requests_accepted: u64,
    pub connections_closed: u64,
    pub state_transitions: u64,
    /// Terminal states reported by the provider
    pub terminal_observed: u64,
    pub duplicates_suppressed: u64,
    /// Illegal provider reports
    pub rejected_transitions: u64,
    /// Reports for handles the runtime does not know
    pub stale_reports: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub sends_backpressured: u64,
    pub messages_received: u64,
}

/// Distribution of registered connections across states
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateDistribution {
    pub connecting: usize,
    pub finding_route: usize,
    pub connected: usize,
    /// Terminal but not yet closed by the host
    pub ended: usize,
}

impl StateDistribution {
    pub fn total(&self) -> usize {
        self.connecting + self.finding_route + self.connected + self.ended
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use relaynet_core::{ListenSocketHandle, SystemTimeSource};

    fn manager() -> (ConnectionManager, HandleRegistry) {
        let manager = ConnectionManager::new(
            ConnectionConfig {
                audit_trail_capacity: 4,
                ..ConnectionConfig::direct()
            },
            Arc::new(SystemTimeSource),
        );
        (manager, HandleRegistry::new(16))
    }

    fn register(registry: &mut HandleRegistry, raw: u64) -> ConnectionHandle {
        let handle = ConnectionHandle::new(raw);
        registry.insert_connection(ConnectionEntry::outbound(
            handle,
            Identity::new("peerY"),
            Timestamp::new(0),
        ));
        handle
    }

    fn report(state: ConnectionState) -> ConnectionInfo {
        ConnectionInfo::new(Identity::new("peerY"), state)
    }

    #[test]
    fn test_status_change_produces_single_event() {
        let (mut manager, mut registry) = manager();
        let handle = register(&mut registry, 42);

        let events = manager.apply_status_change(
            &mut registry,
            handle,
            ConnectionState::Connecting,
            report(ConnectionState::Connected),
        );
        assert_eq!(events.len(), 1);
        let event = events[0].as_state_change().unwrap();
        assert_eq!(event.old_state, ConnectionState::Connecting);
        assert_eq!(event.new_state, ConnectionState::Connected);

        let duplicate = manager.apply_status_change(
            &mut registry,
            handle,
            ConnectionState::Connecting,
            report(ConnectionState::Connected),
        );
        assert!(duplicate.is_empty());
        assert_eq!(manager.statistics().duplicates_suppressed, 1);
    }

    #[test]
    fn test_illegal_report_dropped_unless_terminal() {
        let (mut manager, mut registry) = manager();
        let ended = register(&mut registry, 1);
        registry.connection_entry_mut(ended).unwrap().state = ConnectionState::ClosedByPeer;

        let dropped = manager.apply_status_change(
            &mut registry,
            ended,
            ConnectionState::ClosedByPeer,
            report(ConnectionState::Connected),
        );
        assert!(dropped.is_empty());

        // An ended connection is never re-ended under a different reason
        let reended = manager.apply_status_change(
            &mut registry,
            ended,
            ConnectionState::ClosedByPeer,
            report(ConnectionState::ProblemDetectedLocally),
        );
        assert!(reended.is_empty());
        assert_eq!(
            registry.connection_entry(ended).unwrap().state,
            ConnectionState::ClosedByPeer
        );
        assert_eq!(manager.statistics().rejected_transitions, 2);
        assert_eq!(manager.statistics().terminal_observed, 0);

        let live = register(&mut registry, 2);
        let forced = manager.apply_status_change(
            &mut registry,
            live,
            ConnectionState::Connecting,
            report(ConnectionState::FinWaitLinger),
        );
        assert_eq!(forced.len(), 1);
        assert_eq!(
            registry.connection_entry(live).unwrap().state,
            ConnectionState::FinWaitLinger
        );
        assert_eq!(manager.statistics().terminal_observed, 1);
    }

    #[test]
    fn test_incoming_request_registers_pending_connection() {
        let (mut manager, mut registry) = manager();
        let socket = ListenSocketHandle::new(5);
        registry.insert_listen_socket(ListenSocketEntry {
            handle: socket,
            port: VirtualPort::new(0),
            opened_at: Timestamp::new(0),
        });

        let events = manager.apply_status_change(
            &mut registry,
            ConnectionHandle::new(9),
            ConnectionState::None,
            report(ConnectionState::Connecting).with_listen_socket(socket),
        );
        assert_eq!(events.len(), 2);
        assert!(events[0].as_state_change().is_some());
        let request = events[1].as_incoming_request().unwrap();
        assert_eq!(request.listen_socket, socket);
        assert!(registry
            .connection_entry(ConnectionHandle::new(9))
            .unwrap()
            .pending_request);
    }

    #[test]
    fn test_report_for_unknown_handle_is_stale() {
        let (mut manager, mut registry) = manager();
        let events = manager.apply_status_change(
            &mut registry,
            ConnectionHandle::new(77),
            ConnectionState::Connecting,
            report(ConnectionState::Connected),
        );
        assert!(events.is_empty());
        assert_eq!(manager.statistics().stale_reports, 1);
    }

    #[test]
    fn test_audit_trail_is_bounded() {
        let (mut manager, mut registry) = manager();
        for raw in 0..6 {
            register(&mut registry, raw);
            manager.record(
                ConnectionHandle::new(raw),
                ConnectionState::None,
                ConnectionState::Connecting,
                TransitionCause::Connect,
            );
        }
        let recent = manager.recent_transitions(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].connection, ConnectionHandle::new(2));
        assert_eq!(manager.recent_transitions(1)[0].connection, ConnectionHandle::new(5));
        assert_eq!(manager.state_distribution(&registry).total(), 6);
    }
}
