//! Shared state of a simulated relay network
//!
//! Every endpoint of one [`SimulatedNetwork`] sees the same connection table,
//! so a connect on one endpoint shows up as an incoming request on the
//! endpoint listening on the target port. Handles come from a single
//! counter shared by all handle kinds.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relaynet_core::{
    BrokerId, BrokerSender, ConnectionHandle, ConnectionInfo, ConnectionState, CorrelationId,
    CredentialCallbackSink, DeliveryClass, Identity, ListenSocketHandle, Message,
    PollGroupHandle, ProviderEvent, RelayAvailability, TicketHandle, TicketKind, VirtualPort,
};
use tracing::trace;

use crate::config::EndpointConfig;
use crate::provider::SimulatedProvider;

// ----------------------------------------------------------------------------
// Call Log
// ----------------------------------------------------------------------------

/// Provider calls recorded for ordering assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    AttachBroker,
    DetachBroker,
    TeardownModule,
    BootstrapRelay,
    Connect(ConnectionHandle),
    Accept(ConnectionHandle),
    CloseConnection(ConnectionHandle),
    CreateListenSocket(ListenSocketHandle),
    CloseListenSocket(ListenSocketHandle),
    CreatePollGroup(PollGroupHandle),
    DestroyPollGroup(PollGroupHandle),
    RegisterSink(CorrelationId),
    UnregisterSink(CorrelationId),
    RequestTicket(TicketHandle),
    CancelTicket(TicketHandle),
}

// ----------------------------------------------------------------------------
// Network State
// ----------------------------------------------------------------------------

pub(crate) struct Endpoint {
    pub(crate) config: EndpointConfig,
    pub(crate) native_queue: VecDeque<ProviderEvent>,
    pub(crate) broker: Option<BrokerSender>,
    /// Broker most recently attached, kept after detach to check release tokens
    pub(crate) attached_broker: Option<BrokerId>,
    pub(crate) relay: RelayAvailability,
    pub(crate) relay_polls: u32,
    pub(crate) sinks: HashMap<CorrelationId, Arc<dyn CredentialCallbackSink>>,
    pub(crate) tickets: HashMap<TicketHandle, (TicketKind, CorrelationId)>,
    pub(crate) calls: Vec<ProviderCall>,
    pub(crate) torn_down: bool,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            native_queue: VecDeque::new(),
            broker: None,
            attached_broker: None,
            relay: RelayAvailability::Unknown,
            relay_polls: 0,
            sinks: HashMap::new(),
            tickets: HashMap::new(),
            calls: Vec::new(),
            torn_down: false,
        }
    }
}

pub(crate) struct SimConnection {
    pub(crate) owner: Identity,
    pub(crate) remote: Identity,
    pub(crate) peer: Option<ConnectionHandle>,
    pub(crate) state: ConnectionState,
    pub(crate) listen_socket: Option<ListenSocketHandle>,
    pub(crate) accepted: bool,
    pub(crate) poll_group: Option<PollGroupHandle>,
    pub(crate) inbox: VecDeque<Message>,
    /// Payloads queued until the connection is connected
    pub(crate) outbox: VecDeque<(DeliveryClass, Vec<u8>, u64)>,
    pub(crate) pending_bytes: usize,
    /// Everything this side put on the wire
    pub(crate) sent: Vec<Message>,
    pub(crate) next_message_number: u64,
    pub(crate) name: String,
    pub(crate) end: Option<(i32, String)>,
}

impl SimConnection {
    pub(crate) fn new(owner: Identity, remote: Identity) -> Self {
        Self {
            owner,
            remote,
            peer: None,
            state: ConnectionState::Connecting,
            listen_socket: None,
            accepted: false,
            poll_group: None,
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            pending_bytes: 0,
            sent: Vec::new(),
            next_message_number: 1,
            name: String::new(),
            end: None,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(self.remote.clone(), self.state);
        info.listen_socket = self.listen_socket;
        info.name = self.name.clone();
        if let Some((reason, debug)) = &self.end {
            info = info.with_end(*reason, debug.clone());
        }
        info
    }
}

pub(crate) struct NetworkState {
    next_handle: u64,
    pub(crate) rng: fastrand::Rng,
    pub(crate) endpoints: HashMap<Identity, Endpoint>,
    pub(crate) connections: HashMap<ConnectionHandle, SimConnection>,
    pub(crate) listen_sockets: HashMap<ListenSocketHandle, (Identity, VirtualPort)>,
    pub(crate) poll_groups: HashMap<PollGroupHandle, Identity>,
}

impl NetworkState {
    pub(crate) fn allocate(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    pub(crate) fn log_call(&mut self, identity: &Identity, call: ProviderCall) {
        if let Some(endpoint) = self.endpoints.get_mut(identity) {
            endpoint.calls.push(call);
        }
    }

    /// Queue an event for `owner`, through the broker if it asked for that
    pub(crate) fn emit(&mut self, owner: &Identity, event: ProviderEvent) {
        let Some(endpoint) = self.endpoints.get_mut(owner) else {
            return;
        };
        if endpoint.torn_down {
            return;
        }
        if endpoint.config.status_via_broker {
            if let Some(broker) = &endpoint.broker {
                broker.post(event);
                return;
            }
        }
        endpoint.native_queue.push_back(event);
    }

    /// Listen socket of `identity` bound to `port`
    pub(crate) fn find_listener(&self, identity: &Identity, port: VirtualPort) -> Option<ListenSocketHandle> {
        self.listen_sockets
            .iter()
            .find(|(_, (owner, bound))| owner == identity && *bound == port)
            .map(|(handle, _)| *handle)
    }

    /// Move a connection to `next` and report it to its owner
    pub(crate) fn set_state(&mut self, handle: ConnectionHandle, next: ConnectionState) -> bool {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return false;
        };
        let old_state = connection.state;
        if old_state == next {
            return false;
        }
        connection.state = next;
        let info = connection.info();
        let owner = connection.owner.clone();
        trace!(%handle, from = %old_state, to = %next, "Simulated state change");

        self.emit(
            &owner,
            ProviderEvent::ConnectionStatusChanged {
                connection: handle,
                old_state,
                info,
            },
        );
        if next == ConnectionState::Connected {
            self.flush_outbox(handle);
        }
        true
    }

    /// End a connection with a reason, as the remote or the provider would
    pub(crate) fn end_connection(
        &mut self,
        handle: ConnectionHandle,
        state: ConnectionState,
        reason: i32,
        debug: &str,
    ) -> bool {
        match self.connections.get_mut(&handle) {
            Some(connection) if !connection.state.is_terminal() => {
                connection.end = Some((reason, debug.to_string()));
                connection.peer = None;
            }
            _ => return false,
        }
        self.set_state(handle, state)
    }

    pub(crate) fn flush_outbox(&mut self, handle: ConnectionHandle) {
        let queued: Vec<_> = match self.connections.get_mut(&handle) {
            Some(connection) => {
                connection.pending_bytes = 0;
                connection.outbox.drain(..).collect()
            }
            None => return,
        };
        for (delivery, payload, number) in queued {
            self.deliver(handle, delivery, payload, number);
        }
    }

    /// Put a payload on the wire from `from` to its peer
    pub(crate) fn deliver(
        &mut self,
        from: ConnectionHandle,
        delivery: DeliveryClass,
        payload: Vec<u8>,
        number: u64,
    ) {
        let Some(sender) = self.connections.get_mut(&from) else {
            return;
        };
        sender
            .sent
            .push(Message::new(from, delivery, number, payload.clone()));
        let Some(peer) = sender.peer else {
            return;
        };
        let (loss_rate, reorder) = match self.endpoints.get(&sender.owner) {
            Some(endpoint) => (
                endpoint.config.unreliable_loss_rate,
                endpoint.config.reorder_unreliable,
            ),
            None => (0.0, false),
        };

        let Some(target) = self.connections.get_mut(&peer) else {
            return;
        };
        if target.state.is_terminal() {
            return;
        }
        let message = Message::new(peer, delivery, number, payload);
        if delivery == DeliveryClass::Unreliable {
            if loss_rate > 0.0 && self.rng.f64() < loss_rate {
                trace!(%from, number, "Simulated loss of unreliable message");
                return;
            }
            if reorder {
                let position = self.rng.usize(..=target.inbox.len());
                target.inbox.insert(position, message);
                return;
            }
        }
        target.inbox.push_back(message);
    }
}

// ----------------------------------------------------------------------------
// Simulated Network
// ----------------------------------------------------------------------------

/// In-memory relay network shared by any number of simulated endpoints
#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::with_seed(0x5eed)
    }

    /// Network whose loss and reordering decisions follow `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                next_handle: 1,
                rng: fastrand::Rng::with_seed(seed),
                endpoints: HashMap::new(),
                connections: HashMap::new(),
                listen_sockets: HashMap::new(),
                poll_groups: HashMap::new(),
            })),
        }
    }

    /// Start handle allocation at `first`
    pub fn with_first_handle(self, first: u64) -> Self {
        self.lock().next_handle = first;
        self
    }

    /// Add an endpoint and return its provider
    pub fn endpoint(&self, config: EndpointConfig) -> SimulatedProvider {
        let identity = config.identity.clone();
        self.lock()
            .endpoints
            .insert(identity.clone(), Endpoint::new(config));
        SimulatedProvider::new(self.clone(), identity)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}
