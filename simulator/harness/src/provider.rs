//! Simulated transport provider
//!
//! Implements [`TransportProvider`] on top of a [`SimulatedNetwork`]. Cloning
//! a provider yields another handle on the same endpoint, which tests keep to
//! script transitions, inject requests and complete tickets while the
//! runtime owns the original.

use std::sync::Arc;
use std::thread;

use relaynet_core::{
    BridgeReleased, BrokerSender, ConnectionHandle, ConnectionInfo, ConnectionState,
    CorrelationId, CredentialCallbackSink, DeliveryClass, Identity, ListenSocketHandle, Message,
    PingLocation, PollGroupHandle, PopId, PopPing, ProviderEvent, RealTimeStatus,
    RelayAvailability, RelayNetError, Result, ResultCode, SendFailure, ShutdownStep,
    TicketHandle, TicketKind, TransportProvider, VirtualPort,
};
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, RelayScript};
use crate::network::{NetworkState, ProviderCall, SimConnection, SimulatedNetwork};

/// Reason code reported when a connect reaches an identity with no listener
pub const NO_LISTENER_REASON: i32 = 4001;

// ----------------------------------------------------------------------------
// Simulated Provider
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct SimulatedProvider {
    network: SimulatedNetwork,
    identity: Identity,
}

impl SimulatedProvider {
    pub(crate) fn new(network: SimulatedNetwork, identity: Identity) -> Self {
        Self { network, identity }
    }

    /// Single endpoint on its own network
    pub fn standalone(config: EndpointConfig) -> Self {
        SimulatedNetwork::new().endpoint(config)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Connection owned by this endpoint
    fn owns(state: &NetworkState, identity: &Identity, handle: ConnectionHandle) -> bool {
        state
            .connections
            .get(&handle)
            .map(|connection| &connection.owner == identity)
            .unwrap_or(false)
    }

    fn relay_current(state: &NetworkState, identity: &Identity) -> bool {
        state
            .endpoints
            .get(identity)
            .map(|endpoint| endpoint.relay.is_current())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Test Controls
    // ------------------------------------------------------------------------

    /// Force a connection into `state`, reporting it like the provider would
    pub fn script_transition(&self, connection: ConnectionHandle, state: ConnectionState) -> bool {
        self.network.lock().set_state(connection, state)
    }

    /// End a connection with a reason code and debug text
    pub fn script_end(
        &self,
        connection: ConnectionHandle,
        state: ConnectionState,
        reason: i32,
        debug: &str,
    ) -> bool {
        self.network
            .lock()
            .end_connection(connection, state, reason, debug)
    }

    /// Announce an inbound connection from `remote` on `socket`
    pub fn inject_incoming(&self, socket: ListenSocketHandle, remote: Identity) -> Option<ConnectionHandle> {
        let mut state = self.network.lock();
        match state.listen_sockets.get(&socket) {
            Some((owner, _)) if owner == &self.identity => {}
            _ => return None,
        }

        let handle = ConnectionHandle::new(state.allocate());
        let mut connection = SimConnection::new(self.identity.clone(), remote);
        connection.listen_socket = Some(socket);
        let info = connection.info();
        state.connections.insert(handle, connection);
        state.emit(
            &self.identity,
            ProviderEvent::ConnectionStatusChanged {
                connection: handle,
                old_state: ConnectionState::None,
                info,
            },
        );
        Some(handle)
    }

    /// Queue an inbound message on a connection
    pub fn deliver_to(&self, connection: ConnectionHandle, delivery: DeliveryClass, payload: &[u8]) -> bool {
        let mut state = self.network.lock();
        match state.connections.get_mut(&connection) {
            Some(target) => {
                let number = target.inbox.len() as u64 + 1;
                target
                    .inbox
                    .push_back(Message::new(connection, delivery, number, payload.to_vec()));
                true
            }
            None => false,
        }
    }

    /// Post an event through the broker from a foreign thread
    pub fn post_via_broker(&self, event: ProviderEvent) -> bool {
        let broker: Option<BrokerSender> = self
            .network
            .lock()
            .endpoints
            .get(&self.identity)
            .and_then(|endpoint| endpoint.broker.clone());
        match broker {
            Some(broker) => thread::spawn(move || broker.post(event))
                .join()
                .unwrap_or(false),
            None => false,
        }
    }

    /// Deliver ticket bytes through the registered sink from a foreign thread
    pub fn complete_ticket(&self, ticket: TicketHandle, bytes: Vec<u8>) -> bool {
        self.finish_ticket(ticket, Ok(bytes))
    }

    pub fn fail_ticket(&self, ticket: TicketHandle, code: ResultCode) -> bool {
        self.finish_ticket(ticket, Err(code))
    }

    fn finish_ticket(&self, ticket: TicketHandle, outcome: relaynet_core::TicketOutcome) -> bool {
        let callback = {
            let mut state = self.network.lock();
            let Some(endpoint) = state.endpoints.get_mut(&self.identity) else {
                return false;
            };
            let Some((_, correlation)) = endpoint.tickets.remove(&ticket) else {
                return false;
            };
            endpoint
                .sinks
                .get(&correlation)
                .cloned()
                .map(|sink| (sink, correlation))
        };

        // Lock released: the sink may run arbitrary code
        match callback {
            Some((sink, correlation)) => {
                thread::spawn(move || sink.on_ticket_ready(correlation, ticket, outcome))
                    .join()
                    .is_ok()
            }
            None => false,
        }
    }

    pub fn call_log(&self) -> Vec<ProviderCall> {
        self.network
            .lock()
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.calls.clone())
            .unwrap_or_default()
    }

    pub fn connection_state(&self, connection: ConnectionHandle) -> Option<ConnectionState> {
        self.network
            .lock()
            .connections
            .get(&connection)
            .map(|connection| connection.state)
    }

    pub fn poll_group_of(&self, connection: ConnectionHandle) -> Option<PollGroupHandle> {
        self.network
            .lock()
            .connections
            .get(&connection)
            .and_then(|connection| connection.poll_group)
    }

    pub fn sent_messages(&self, connection: ConnectionHandle) -> Vec<Message> {
        self.network
            .lock()
            .connections
            .get(&connection)
            .map(|connection| connection.sent.clone())
            .unwrap_or_default()
    }

    pub fn pending_tickets(&self) -> Vec<TicketHandle> {
        let state = self.network.lock();
        let mut tickets: Vec<TicketHandle> = state
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.tickets.keys().copied().collect())
            .unwrap_or_default();
        tickets.sort();
        tickets
    }

    pub fn registered_sinks(&self) -> usize {
        self.network
            .lock()
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.sinks.len())
            .unwrap_or(0)
    }

    pub fn broker_attached(&self) -> bool {
        self.network
            .lock()
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.broker.is_some())
            .unwrap_or(false)
    }

    pub fn is_torn_down(&self) -> bool {
        self.network
            .lock()
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.torn_down)
            .unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Provider Implementation
// ----------------------------------------------------------------------------

impl TransportProvider for SimulatedProvider {
    fn attach_broker(&mut self, broker: BrokerSender) {
        let mut state = self.network.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.identity) {
            endpoint.attached_broker = Some(broker.id());
            endpoint.broker = Some(broker);
        }
        state.log_call(&self.identity, ProviderCall::AttachBroker);
    }

    fn detach_broker(&mut self) -> Result<()> {
        let mut state = self.network.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.identity) else {
            return Ok(());
        };
        if endpoint.torn_down {
            // Releasing a bridge after module teardown would block forever natively
            return Err(RelayNetError::ShutdownOrderViolation {
                expected: None,
                attempted: ShutdownStep::ReleaseBridge,
            });
        }
        endpoint.broker = None;
        state.log_call(&self.identity, ProviderCall::DetachBroker);
        Ok(())
    }

    fn teardown_module(&mut self, released: BridgeReleased) -> Result<()> {
        let mut state = self.network.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.identity) else {
            return Ok(());
        };
        if endpoint.broker.is_some() || endpoint.attached_broker != Some(released.broker_id()) {
            warn!(
                identity = %self.identity,
                token = %released.broker_id(),
                "Teardown without releasing the attached broker"
            );
            return Err(RelayNetError::ShutdownOrderViolation {
                expected: Some(ShutdownStep::ReleaseBridge),
                attempted: ShutdownStep::TeardownProvider,
            });
        }
        endpoint.torn_down = true;
        endpoint.sinks.clear();
        endpoint.tickets.clear();
        endpoint.native_queue.clear();
        state.log_call(&self.identity, ProviderCall::TeardownModule);
        info!(identity = %self.identity, discarded = released.discarded(), "Simulated module torn down");
        Ok(())
    }

    fn local_identity(&self) -> Option<Identity> {
        if self.is_torn_down() {
            return None;
        }
        Some(self.identity.clone())
    }

    fn bootstrap_relay(&mut self) {
        let mut state = self.network.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.identity) {
            if endpoint.relay == RelayAvailability::Unknown {
                endpoint.relay = RelayAvailability::Attempting;
            }
        }
        state.log_call(&self.identity, ProviderCall::BootstrapRelay);
    }

    fn relay_status(&mut self) -> RelayAvailability {
        let mut state = self.network.lock();
        let Some(endpoint) = state.endpoints.get_mut(&self.identity) else {
            return RelayAvailability::Unknown;
        };
        if endpoint.relay != RelayAvailability::Attempting {
            return endpoint.relay.clone();
        }

        endpoint.relay_polls += 1;
        let polls = endpoint.relay_polls;
        match &endpoint.config.relay_script {
            RelayScript::SucceedAfter(n) if polls >= *n => {
                endpoint.relay = RelayAvailability::Current;
            }
            RelayScript::FailAfter(n, reason) if polls >= *n => {
                endpoint.relay = RelayAvailability::Failed(reason.clone());
            }
            _ => {}
        }
        endpoint.relay.clone()
    }

    fn local_ping_location(&self) -> Option<PingLocation> {
        let state = self.network.lock();
        if !Self::relay_current(&state, &self.identity) {
            return None;
        }
        state
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.config.ping_location.clone())
    }

    fn estimate_ping(&self, from: &PingLocation, to: &PingLocation) -> Option<u32> {
        if !Self::relay_current(&self.network.lock(), &self.identity) {
            return None;
        }
        let sources = from.entries();
        let targets = to.entries();
        sources
            .iter()
            .flat_map(|(pop, near)| {
                targets
                    .iter()
                    .filter(move |(other, _)| other == pop)
                    .map(move |(_, far)| near + far)
            })
            .min()
    }

    fn pop_list(&self) -> Vec<PopId> {
        let state = self.network.lock();
        if !Self::relay_current(&state, &self.identity) {
            return Vec::new();
        }
        state
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.config.pops.iter().map(|(pop, _)| *pop).collect())
            .unwrap_or_default()
    }

    fn ping_to_pop(&self, pop: PopId) -> Option<PopPing> {
        let state = self.network.lock();
        if !Self::relay_current(&state, &self.identity) {
            return None;
        }
        let endpoint = state.endpoints.get(&self.identity)?;
        endpoint
            .config
            .pops
            .iter()
            .find(|(candidate, _)| *candidate == pop)
            .map(|(pop, ping_ms)| PopPing {
                pop: *pop,
                ping_ms: *ping_ms,
                via: *pop,
            })
    }

    fn create_listen_socket(&mut self, port: VirtualPort) -> Option<ListenSocketHandle> {
        let mut state = self.network.lock();
        if state.find_listener(&self.identity, port).is_some() {
            return None;
        }
        let handle = ListenSocketHandle::new(state.allocate());
        state
            .listen_sockets
            .insert(handle, (self.identity.clone(), port));
        state.log_call(&self.identity, ProviderCall::CreateListenSocket(handle));
        Some(handle)
    }

    fn close_listen_socket(&mut self, socket: ListenSocketHandle) -> bool {
        let mut state = self.network.lock();
        match state.listen_sockets.get(&socket) {
            Some((owner, _)) if owner == &self.identity => {}
            _ => return false,
        }
        state.listen_sockets.remove(&socket);

        let accepted: Vec<ConnectionHandle> = state
            .connections
            .iter()
            .filter(|(_, connection)| connection.listen_socket == Some(socket))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in accepted {
            if let Some(connection) = state.connections.remove(&handle) {
                if let Some(peer) = connection.peer {
                    state.end_connection(peer, ConnectionState::ClosedByPeer, 0, "listen socket closed");
                }
            }
        }
        state.log_call(&self.identity, ProviderCall::CloseListenSocket(socket));
        true
    }

    fn connect(&mut self, remote: &Identity, port: VirtualPort) -> Option<ConnectionHandle> {
        let mut state = self.network.lock();
        let handle = ConnectionHandle::new(state.allocate());
        state.connections.insert(
            handle,
            SimConnection::new(self.identity.clone(), remote.clone()),
        );
        state.log_call(&self.identity, ProviderCall::Connect(handle));

        if let Some(socket) = state.find_listener(remote, port) {
            let peer = ConnectionHandle::new(state.allocate());
            let mut inbound = SimConnection::new(remote.clone(), self.identity.clone());
            inbound.listen_socket = Some(socket);
            inbound.peer = Some(handle);
            let info = inbound.info();
            state.connections.insert(peer, inbound);
            if let Some(outbound) = state.connections.get_mut(&handle) {
                outbound.peer = Some(peer);
            }
            state.emit(
                remote,
                ProviderEvent::ConnectionStatusChanged {
                    connection: peer,
                    old_state: ConnectionState::None,
                    info,
                },
            );
        } else if state.endpoints.contains_key(remote) {
            debug!(%remote, %port, "No listener on simulated endpoint");
            state.end_connection(
                handle,
                ConnectionState::ClosedByPeer,
                NO_LISTENER_REASON,
                "no listener on port",
            );
        }
        Some(handle)
    }

    fn accept(&mut self, connection: ConnectionHandle) -> ResultCode {
        let mut state = self.network.lock();
        let peer = match state.connections.get_mut(&connection) {
            Some(inbound) if inbound.owner == self.identity => {
                if inbound.listen_socket.is_none()
                    || inbound.accepted
                    || inbound.state != ConnectionState::Connecting
                {
                    return ResultCode::InvalidState;
                }
                inbound.accepted = true;
                inbound.peer
            }
            _ => return ResultCode::InvalidParam,
        };
        state.log_call(&self.identity, ProviderCall::Accept(connection));

        state.set_state(connection, ConnectionState::Connected);
        if let Some(peer) = peer {
            state.set_state(peer, ConnectionState::FindingRoute);
            state.set_state(peer, ConnectionState::Connected);
        }
        ResultCode::Ok
    }

    fn close_connection(
        &mut self,
        connection: ConnectionHandle,
        reason: i32,
        debug: &str,
        linger: bool,
    ) -> bool {
        let mut state = self.network.lock();
        if !Self::owns(&state, &self.identity, connection) {
            return false;
        }
        if linger {
            state.flush_outbox(connection);
        }
        let Some(closed) = state.connections.remove(&connection) else {
            return false;
        };
        if let Some(peer) = closed.peer {
            state.end_connection(peer, ConnectionState::ClosedByPeer, reason, debug);
        }
        state.log_call(&self.identity, ProviderCall::CloseConnection(connection));
        true
    }

    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        delivery: DeliveryClass,
    ) -> core::result::Result<u64, SendFailure> {
        let mut state = self.network.lock();
        let limit = state
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.config.send_buffer_limit)
            .unwrap_or(usize::MAX);

        let Some(sender) = state.connections.get_mut(&connection) else {
            return Err(SendFailure::Rejected(ResultCode::NoConnection));
        };
        if sender.owner != self.identity || sender.state.is_terminal() {
            return Err(SendFailure::Rejected(ResultCode::NoConnection));
        }
        if sender.listen_socket.is_some() && !sender.accepted {
            return Err(SendFailure::Rejected(ResultCode::InvalidState));
        }

        if sender.state != ConnectionState::Connected {
            if sender.pending_bytes + payload.len() > limit {
                return Err(SendFailure::LimitExceeded {
                    pending_bytes: sender.pending_bytes,
                    limit,
                });
            }
            let number = sender.next_message_number;
            sender.next_message_number += 1;
            sender.pending_bytes += payload.len();
            sender.outbox.push_back((delivery, payload.to_vec(), number));
            return Ok(number);
        }

        let number = sender.next_message_number;
        sender.next_message_number += 1;
        state.deliver(connection, delivery, payload.to_vec(), number);
        Ok(number)
    }

    fn flush(&mut self, connection: ConnectionHandle) -> ResultCode {
        if Self::owns(&self.network.lock(), &self.identity, connection) {
            ResultCode::Ok
        } else {
            ResultCode::NoConnection
        }
    }

    fn receive_on_connection(&mut self, connection: ConnectionHandle, max: usize) -> Vec<Message> {
        let mut state = self.network.lock();
        match state.connections.get_mut(&connection) {
            Some(target) if target.owner == self.identity => {
                let count = max.min(target.inbox.len());
                target.inbox.drain(..count).collect()
            }
            _ => Vec::new(),
        }
    }

    fn query_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo> {
        let state = self.network.lock();
        let target = state.connections.get(&connection)?;
        if target.owner != self.identity {
            return None;
        }
        let mut info = target.info();
        if Self::relay_current(&state, &self.identity) {
            let relay_pop = state
                .endpoints
                .get(&self.identity)
                .and_then(|endpoint| endpoint.config.pops.first().map(|(pop, _)| *pop));
            info.relay_pop = relay_pop;
            info.remote_pop = state
                .endpoints
                .get(&target.remote)
                .and_then(|endpoint| endpoint.config.pops.first().map(|(pop, _)| *pop))
                .or(relay_pop);
        }
        Some(info)
    }

    fn query_real_time_status(&self, connection: ConnectionHandle) -> Option<RealTimeStatus> {
        let state = self.network.lock();
        let target = state.connections.get(&connection)?;
        if target.owner != self.identity {
            return None;
        }
        let ping_ms = state
            .endpoints
            .get(&self.identity)
            .and_then(|endpoint| endpoint.config.pops.iter().map(|(_, ping)| *ping).min())
            .unwrap_or(0);
        let (reliable, unreliable) =
            target
                .outbox
                .iter()
                .fold((0, 0), |(reliable, unreliable), (delivery, payload, _)| {
                    if delivery.is_reliable() {
                        (reliable + payload.len(), unreliable)
                    } else {
                        (reliable, unreliable + payload.len())
                    }
                });
        Some(RealTimeStatus {
            state: target.state,
            ping_ms: ping_ms * 2,
            local_quality: 1.0,
            remote_quality: 1.0,
            send_rate_bytes_per_sec: 256 * 1024,
            pending_reliable_bytes: reliable,
            pending_unreliable_bytes: unreliable,
            sent_unacked_reliable_bytes: 0,
        })
    }

    fn set_connection_name(&mut self, connection: ConnectionHandle, name: &str) -> bool {
        let mut state = self.network.lock();
        match state.connections.get_mut(&connection) {
            Some(target) if target.owner == self.identity => {
                target.name = name.to_string();
                true
            }
            _ => false,
        }
    }

    fn create_poll_group(&mut self) -> Option<PollGroupHandle> {
        let mut state = self.network.lock();
        let group = PollGroupHandle::new(state.allocate());
        state.poll_groups.insert(group, self.identity.clone());
        state.log_call(&self.identity, ProviderCall::CreatePollGroup(group));
        Some(group)
    }

    fn destroy_poll_group(&mut self, group: PollGroupHandle) -> bool {
        let mut state = self.network.lock();
        match state.poll_groups.get(&group) {
            Some(owner) if owner == &self.identity => {}
            _ => return false,
        }
        state.poll_groups.remove(&group);
        for connection in state.connections.values_mut() {
            if connection.poll_group == Some(group) {
                connection.poll_group = None;
            }
        }
        state.log_call(&self.identity, ProviderCall::DestroyPollGroup(group));
        true
    }

    fn set_connection_poll_group(
        &mut self,
        connection: ConnectionHandle,
        group: Option<PollGroupHandle>,
    ) -> bool {
        let mut state = self.network.lock();
        if let Some(group) = group {
            match state.poll_groups.get(&group) {
                Some(owner) if owner == &self.identity => {}
                _ => return false,
            }
        }
        match state.connections.get_mut(&connection) {
            Some(target) if target.owner == self.identity => {
                target.poll_group = group;
                true
            }
            _ => false,
        }
    }

    fn receive_on_poll_group(&mut self, group: PollGroupHandle, max: usize) -> Vec<Message> {
        let mut state = self.network.lock();
        let mut members: Vec<ConnectionHandle> = state
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection.owner == self.identity && connection.poll_group == Some(group)
            })
            .map(|(handle, _)| *handle)
            .collect();
        members.sort();

        let mut messages = Vec::new();
        for handle in members {
            let remaining = max - messages.len();
            if remaining == 0 {
                break;
            }
            if let Some(member) = state.connections.get_mut(&handle) {
                let count = remaining.min(member.inbox.len());
                messages.extend(member.inbox.drain(..count));
            }
        }
        messages
    }

    fn poll_events(&mut self) -> Vec<ProviderEvent> {
        let mut state = self.network.lock();
        state
            .endpoints
            .get_mut(&self.identity)
            .map(|endpoint| endpoint.native_queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn register_credential_sink(
        &mut self,
        correlation: CorrelationId,
        sink: Arc<dyn CredentialCallbackSink>,
    ) -> bool {
        let mut state = self.network.lock();
        match state.endpoints.get_mut(&self.identity) {
            Some(endpoint) if !endpoint.torn_down => {
                endpoint.sinks.insert(correlation, sink);
            }
            _ => return false,
        }
        state.log_call(&self.identity, ProviderCall::RegisterSink(correlation));
        true
    }

    fn unregister_credential_sink(&mut self, correlation: CorrelationId) {
        let mut state = self.network.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.identity) {
            endpoint.sinks.remove(&correlation);
        }
        state.log_call(&self.identity, ProviderCall::UnregisterSink(correlation));
    }

    fn request_ticket(&mut self, kind: &TicketKind, correlation: CorrelationId) -> Option<TicketHandle> {
        let mut state = self.network.lock();
        let registered = state
            .endpoints
            .get(&self.identity)
            .map(|endpoint| endpoint.sinks.contains_key(&correlation))
            .unwrap_or(false);
        if !registered {
            return None;
        }
        let ticket = TicketHandle::new(state.allocate());
        if let Some(endpoint) = state.endpoints.get_mut(&self.identity) {
            endpoint.tickets.insert(ticket, (kind.clone(), correlation));
        }
        state.log_call(&self.identity, ProviderCall::RequestTicket(ticket));
        Some(ticket)
    }

    fn cancel_ticket(&mut self, ticket: TicketHandle) -> bool {
        let mut state = self.network.lock();
        let removed = state
            .endpoints
            .get_mut(&self.identity)
            .map(|endpoint| endpoint.tickets.remove(&ticket).is_some())
            .unwrap_or(false);
        state.log_call(&self.identity, ProviderCall::CancelTicket(ticket));
        removed
    }
}
