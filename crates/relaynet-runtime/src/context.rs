//! Relay context
//!
//! The context owns the provider and every runtime component. All host calls
//! go through it, on a single thread. Nothing happens in the background:
//! provider progress is observed only when the host calls [`RelayContext::pump`]
//! or one of the polling queries.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use relaynet_core::{
    BridgeEvent, BridgeReleased, ConnectionHandle, ConnectionInfo, CredentialTicket,
    DeliveryClass, Identity, IncomingConnectionRequest, ListenSocketHandle, Message,
    PingLocation, PollGroupHandle, PopId, PopPing, ProviderEvent, RealTimeStatus,
    RelayAvailability, RelayNetConfig, RelayNetError, Result, SendReceipt, StateChangeEvent,
    TicketHandle, TicketKind, TimeSource, TransportProvider, VirtualPort,
};
use serde::Serialize;
use smallvec::smallvec;
use tracing::{debug, error, info, warn};

use crate::bootstrap::RelayBootstrap;
use crate::bridge::{
    dispatch_to_sinks, BridgeStats, CallbackBridge, EventSink, HandlerScope,
    IncomingRequestHandler, StateChangeHandler, SubscriptionId,
};
use crate::managers::{
    AuditEntry, ConnectionManager, ConnectionStats, CredentialTickets, GroupMembers,
    PollGroupManager, PollGroupStats, StateDistribution, StatusEvents, TicketFuture, TicketStats,
};
use crate::registry::HandleRegistry;
use crate::shutdown::ShutdownCoordinator;

// ----------------------------------------------------------------------------
// Relay Context
// ----------------------------------------------------------------------------

/// Connection layer instance bound to one transport provider
pub struct RelayContext<P: TransportProvider> {
    pub(crate) provider: P,
    pub(crate) config: RelayNetConfig,
    pub(crate) bridge: CallbackBridge,
    pub(crate) registry: HandleRegistry,
    pub(crate) connections: ConnectionManager,
    pub(crate) poll_groups: PollGroupManager,
    pub(crate) bootstrap: RelayBootstrap,
    pub(crate) tickets: CredentialTickets,
    pub(crate) coordinator: ShutdownCoordinator,
    /// Held between bridge release and provider teardown
    pub(crate) released: Option<BridgeReleased>,
}

impl<P: TransportProvider> RelayContext<P> {
    pub(crate) fn new(
        mut provider: P,
        config: RelayNetConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;

        let (bridge, broker) = CallbackBridge::new(config.bridge.clone());
        provider.attach_broker(broker.clone());

        let mut context = Self {
            registry: HandleRegistry::new(config.connections.retired_handle_memory),
            connections: ConnectionManager::new(config.connections.clone(), time_source.clone()),
            poll_groups: PollGroupManager::new(
                config.connections.max_receive_batch,
                time_source.clone(),
            ),
            bootstrap: RelayBootstrap::new(config.relay.clone(), time_source),
            tickets: CredentialTickets::new(config.tickets.clone(), broker),
            coordinator: ShutdownCoordinator::new(),
            released: None,
            bridge,
            provider,
            config,
        };

        if context.config.relay.init_on_start {
            context.bootstrap.init(&mut context.provider);
        }
        info!("Relay context ready");
        Ok(context)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.coordinator.has_started() {
            return Err(RelayNetError::BridgeClosed);
        }
        Ok(())
    }

    pub fn config(&self) -> &RelayNetConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Drain native events and dispatch them to the registered sinks
    ///
    /// Returns the dispatched events in order. Calling this from inside a
    /// handler fails with `ReentrantPump`. With handler panic isolation off, a
    /// panicking handler ends the dispatch and the pump returns
    /// `HandlerFailed`; the following pump starts clean.
    pub fn pump(&mut self) -> Result<Vec<BridgeEvent>> {
        self.ensure_open()?;
        self.bridge.begin_dispatch()?;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.pump_events()));
        self.bridge.end_dispatch();
        match outcome {
            Ok(outcome) => outcome,
            Err(payload) => resume_unwind(payload),
        }
    }

    fn pump_events(&mut self) -> Result<Vec<BridgeEvent>> {
        let native = self.bridge.collect(&mut self.provider)?;
        if native.is_empty() {
            return Ok(Vec::new());
        }

        let isolate_panics = self.bridge.isolates_panics();
        let mut sinks = self.bridge.take_sinks();
        let mut dispatched = Vec::with_capacity(native.len());

        let mut abandoned = None;

        // Records after an abandoned dispatch still update runtime state
        for record in native {
            for event in self.translate(record) {
                if abandoned.is_some() {
                    continue;
                }
                let outcome = {
                    let mut scope = HandlerScope {
                        bridge: &mut self.bridge,
                        registry: &mut self.registry,
                        connections: &mut self.connections,
                        poll_groups: &mut self.poll_groups,
                        provider: &mut self.provider,
                    };
                    dispatch_to_sinks(&mut sinks, &mut scope, &event, isolate_panics)
                };
                match outcome {
                    Ok(failures) => {
                        self.bridge.record_dispatch(failures);
                        dispatched.push(event);
                    }
                    Err(err) => {
                        self.bridge.record_dispatch(1);
                        abandoned = Some(err);
                    }
                }
            }
        }

        self.bridge.restore_sinks(sinks);
        if let Some(err) = abandoned {
            warn!(dispatched = dispatched.len(), "Pump abandoned after a handler panic");
            return Err(err);
        }
        debug!(events = dispatched.len(), "Pump dispatched events");
        Ok(dispatched)
    }

    /// Update runtime state from one native record
    fn translate(&mut self, record: ProviderEvent) -> StatusEvents {
        match record {
            ProviderEvent::ConnectionStatusChanged {
                connection,
                old_state,
                info,
            } => self
                .connections
                .apply_status_change(&mut self.registry, connection, old_state, info),
            ProviderEvent::RelayStatusChanged(status) => {
                if self.bootstrap.observe(status.clone()) {
                    smallvec![BridgeEvent::RelayStatusChanged(status)]
                } else {
                    StatusEvents::new()
                }
            }
            ProviderEvent::TicketReady {
                correlation,
                ticket,
                outcome,
            } => self
                .tickets
                .resolve(correlation, ticket, outcome)
                .into_iter()
                .collect(),
        }
    }

    pub fn register<S>(&mut self, sink: S) -> Result<SubscriptionId>
    where
        S: EventSink + 'static,
    {
        self.ensure_open()?;
        Ok(self.bridge.register(Box::new(sink)))
    }

    pub fn on_state_change<F>(&mut self, handler: F) -> Result<SubscriptionId>
    where
        F: FnMut(&mut HandlerScope<'_>, &StateChangeEvent) -> Result<()> + 'static,
    {
        self.register(StateChangeHandler(handler))
    }

    pub fn on_incoming_request<F>(&mut self, handler: F) -> Result<SubscriptionId>
    where
        F: FnMut(&mut HandlerScope<'_>, &IncomingConnectionRequest) -> Result<()> + 'static,
    {
        self.register(IncomingRequestHandler(handler))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bridge.unsubscribe(id)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub fn connect(&mut self, remote: &Identity, port: VirtualPort) -> Result<ConnectionHandle> {
        self.ensure_open()?;
        let relay = self.bootstrap.status(&mut self.provider);
        self.connections
            .connect(&mut self.registry, &mut self.provider, &relay, remote, port)
    }

    pub fn accept(&mut self, connection: ConnectionHandle) -> Result<()> {
        self.ensure_open()?;
        self.connections
            .accept(&mut self.registry, &mut self.provider, connection)
    }

    /// Close and release a connection; `false` for unknown or already closed handles
    pub fn close(
        &mut self,
        connection: ConnectionHandle,
        reason: i32,
        debug: &str,
        linger: bool,
    ) -> bool {
        if self.coordinator.has_started() {
            return false;
        }
        self.connections.close(
            &mut self.registry,
            &mut self.provider,
            connection,
            reason,
            debug,
            linger,
        )
    }

    pub fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        delivery: DeliveryClass,
    ) -> Result<SendReceipt> {
        self.ensure_open()?;
        self.connections.send(
            &mut self.registry,
            &mut self.provider,
            connection,
            payload,
            delivery,
        )
    }

    pub fn flush(&mut self, connection: ConnectionHandle) -> Result<()> {
        self.ensure_open()?;
        self.connections
            .flush(&self.registry, &mut self.provider, connection)
    }

    pub fn receive_on_connection(
        &mut self,
        connection: ConnectionHandle,
        max: usize,
    ) -> Result<Vec<Message>> {
        self.ensure_open()?;
        self.connections
            .receive(&self.registry, &mut self.provider, connection, max)
    }

    pub fn connection_info(&self, connection: ConnectionHandle) -> Result<ConnectionInfo> {
        self.ensure_open()?;
        self.connections
            .info(&self.registry, &self.provider, connection)
    }

    pub fn real_time_status(&self, connection: ConnectionHandle) -> Result<RealTimeStatus> {
        self.ensure_open()?;
        self.connections
            .real_time_status(&self.registry, &self.provider, connection)
    }

    pub fn set_connection_name(&mut self, connection: ConnectionHandle, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.connections
            .set_name(&mut self.registry, &mut self.provider, connection, name)
    }

    pub fn set_user_tag(&mut self, connection: ConnectionHandle, tag: i64) -> Result<()> {
        self.ensure_open()?;
        self.connections
            .set_user_tag(&mut self.registry, connection, tag)
    }

    pub fn user_tag(&self, connection: ConnectionHandle) -> Result<i64> {
        self.ensure_open()?;
        self.connections.user_tag(&self.registry, connection)
    }

    /// Whether the handle may be used for anything other than `close`
    pub fn is_live(&self, connection: ConnectionHandle) -> bool {
        !self.coordinator.has_started() && self.registry.is_live(connection)
    }

    // ------------------------------------------------------------------------
    // Listen Sockets
    // ------------------------------------------------------------------------

    pub fn create_listen_socket(&mut self, port: VirtualPort) -> Result<ListenSocketHandle> {
        self.ensure_open()?;
        self.connections
            .create_listen_socket(&mut self.registry, &mut self.provider, port)
    }

    /// Close a listen socket and the connections it produced
    pub fn close_listen_socket(&mut self, socket: ListenSocketHandle) -> bool {
        if self.coordinator.has_started() {
            return false;
        }
        self.connections
            .close_listen_socket(&mut self.registry, &mut self.provider, socket)
    }

    // ------------------------------------------------------------------------
    // Poll Groups
    // ------------------------------------------------------------------------

    pub fn create_poll_group(&mut self) -> Result<PollGroupHandle> {
        self.ensure_open()?;
        self.poll_groups
            .create(&mut self.registry, &mut self.provider)
    }

    /// Destroy a poll group; members are unassigned first
    pub fn destroy_poll_group(&mut self, group: PollGroupHandle) -> Result<usize> {
        self.ensure_open()?;
        self.poll_groups
            .destroy(&mut self.registry, &mut self.provider, group)
    }

    pub fn assign_to_poll_group(
        &mut self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<()> {
        self.ensure_open()?;
        self.poll_groups
            .assign(&mut self.registry, &mut self.provider, connection, group)
    }

    pub fn unassign_from_poll_group(&mut self, connection: ConnectionHandle) -> Result<bool> {
        self.ensure_open()?;
        self.poll_groups
            .unassign(&mut self.registry, &mut self.provider, connection)
    }

    /// Drain up to `max` messages from every member of `group`
    pub fn receive(&mut self, group: PollGroupHandle, max: usize) -> Result<Vec<Message>> {
        self.ensure_open()?;
        self.poll_groups
            .receive(&self.registry, &mut self.provider, group, max)
    }

    pub fn poll_group_members(&self, group: PollGroupHandle) -> Result<GroupMembers> {
        self.ensure_open()?;
        self.poll_groups.members(&self.registry, group)
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    /// Start relay bootstrap; idempotent
    pub fn init_relay(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.bootstrap.init(&mut self.provider);
        Ok(())
    }

    /// Poll relay availability; never blocks
    pub fn relay_status(&mut self) -> RelayAvailability {
        if self.coordinator.has_started() {
            return self.bootstrap.current().clone();
        }
        self.bootstrap.status(&mut self.provider)
    }

    /// Local identity, available once relay bootstrap settled
    pub fn local_identity(&self) -> Option<Identity> {
        self.bootstrap.local_identity(&self.provider)
    }

    /// Estimated round trip to `remote`; `None` until topology data arrived
    pub fn estimate_latency(&self, remote: &PingLocation) -> Option<u32> {
        self.bootstrap.estimate_latency(&self.provider, remote)
    }

    pub fn estimate_latency_between(&self, from: &PingLocation, to: &PingLocation) -> Option<u32> {
        self.bootstrap
            .estimate_latency_between(&self.provider, from, to)
    }

    pub fn local_ping_location(&self) -> Option<PingLocation> {
        self.bootstrap.local_ping_location(&self.provider)
    }

    pub fn pop_list(&self) -> Vec<PopId> {
        self.bootstrap.pop_list(&self.provider)
    }

    pub fn ping_to_pop(&self, pop: PopId) -> Option<PopPing> {
        self.bootstrap.ping_to_pop(&self.provider, pop)
    }

    // ------------------------------------------------------------------------
    // Credential Tickets
    // ------------------------------------------------------------------------

    /// Request a ticket; the future resolves during a later `pump()`
    pub fn request_ticket(&mut self, kind: TicketKind) -> Result<TicketFuture> {
        self.ensure_open()?;
        self.tickets.request(&mut self.provider, kind)
    }

    pub fn cancel_ticket(&mut self, ticket: TicketHandle) -> Result<()> {
        self.ensure_open()?;
        self.tickets.cancel(&mut self.provider, ticket)
    }

    pub fn ticket(&self, ticket: TicketHandle) -> Result<CredentialTicket> {
        self.tickets.ticket(ticket)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn recent_transitions(&self, limit: usize) -> Vec<AuditEntry> {
        self.connections.recent_transitions(limit)
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            connections: self.connections.statistics().clone(),
            distribution: self.connections.state_distribution(&self.registry),
            poll_groups: self.poll_groups.statistics().clone(),
            tickets: self.tickets.statistics().clone(),
            bridge: self.bridge.statistics().clone(),
            relay: self.bootstrap.current().clone(),
            live_connections: self.registry.live_connection_count(),
            listen_sockets: self.registry.listen_socket_handles().len(),
            open_poll_groups: self.registry.poll_group_handles().len(),
            outstanding_tickets: self.tickets.outstanding(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.coordinator.is_complete()
    }
}

impl<P: TransportProvider> Drop for RelayContext<P> {
    fn drop(&mut self) {
        if self.coordinator.is_complete() {
            return;
        }
        warn!("Relay context dropped without shutdown_all; shutting down now");
        if let Err(err) = self.shutdown_all() {
            error!(error = %err, "Shutdown during drop failed");
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Snapshot of every component's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextStats {
    pub connections: ConnectionStats,
    pub distribution: StateDistribution,
    pub poll_groups: PollGroupStats,
    pub tickets: TicketStats,
    pub bridge: BridgeStats,
    pub relay: RelayAvailability,
    pub live_connections: usize,
    pub listen_sockets: usize,
    pub open_poll_groups: usize,
    pub outstanding_tickets: usize,
}
