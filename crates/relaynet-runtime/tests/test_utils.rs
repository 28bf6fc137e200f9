//! Shared setup for relaynet runtime integration tests

#![allow(dead_code)]

use relaynet_harness::{EndpointConfig, SimulatedNetwork, SimulatedProvider};
use relaynet_runtime::{
    BridgeEvent, ConnectionHandle, ConnectionState, Identity, IncomingConnectionRequest,
    ListenSocketHandle, RelayContext, RelayContextBuilder, RelayNetConfig, VirtualPort,
};

pub const SERVER: &str = "server";
pub const CLIENT: &str = "client";

pub fn game_port() -> VirtualPort {
    VirtualPort::new(7)
}

/// Context with the test configuration and logging disabled
pub fn quiet_context(provider: SimulatedProvider) -> RelayContext<SimulatedProvider> {
    RelayContextBuilder::new(provider)
        .with_config(RelayNetConfig::testing())
        .with_no_logging()
        .build()
        .expect("test context should build")
}

/// Standalone endpoint and its context
pub fn standalone(config: EndpointConfig) -> (SimulatedProvider, RelayContext<SimulatedProvider>) {
    let provider = SimulatedProvider::standalone(config);
    let context = quiet_context(provider.clone());
    (provider, context)
}

pub fn state_changes(events: &[BridgeEvent]) -> Vec<(ConnectionState, ConnectionState)> {
    events
        .iter()
        .filter_map(BridgeEvent::as_state_change)
        .map(|change| (change.old_state, change.new_state))
        .collect()
}

pub fn incoming_requests(events: &[BridgeEvent]) -> Vec<IncomingConnectionRequest> {
    events
        .iter()
        .filter_map(BridgeEvent::as_incoming_request)
        .cloned()
        .collect()
}

// ----------------------------------------------------------------------------
// Two-Endpoint Setup
// ----------------------------------------------------------------------------

/// Server listening on the game port and a client that dialed it
pub struct Pair {
    pub server_provider: SimulatedProvider,
    pub client_provider: SimulatedProvider,
    pub server: RelayContext<SimulatedProvider>,
    pub client: RelayContext<SimulatedProvider>,
    pub socket: ListenSocketHandle,
    /// Client side of the connection
    pub outbound: ConnectionHandle,
    /// Server side of the connection, still a pending request until accepted
    pub inbound: ConnectionHandle,
}

impl Pair {
    /// Accept on the server and let both sides observe `Connected`
    pub fn accept(&mut self) {
        self.server
            .accept(self.inbound)
            .expect("pending request should be accepted");
        let server_events = self.server.pump().expect("server pump");
        assert_eq!(
            state_changes(&server_events),
            vec![(ConnectionState::Connecting, ConnectionState::Connected)]
        );
        let client_events = self.client.pump().expect("client pump");
        assert_eq!(
            state_changes(&client_events),
            vec![
                (ConnectionState::Connecting, ConnectionState::FindingRoute),
                (ConnectionState::FindingRoute, ConnectionState::Connected),
            ]
        );
    }
}

/// Dial the server and pump it until the request shows up
pub fn pending_pair(network: &SimulatedNetwork, client_config: EndpointConfig) -> Pair {
    let server_provider = network.endpoint(EndpointConfig::new(SERVER));
    let client_provider = network.endpoint(client_config);
    let mut server = quiet_context(server_provider.clone());
    let mut client = quiet_context(client_provider.clone());

    let socket = server
        .create_listen_socket(game_port())
        .expect("listen socket");
    let outbound = client
        .connect(&Identity::from(SERVER), game_port())
        .expect("connect");

    let events = server.pump().expect("server pump");
    let requests = incoming_requests(&events);
    assert_eq!(requests.len(), 1, "expected exactly one incoming request");
    assert_eq!(requests[0].listen_socket, socket);

    Pair {
        server_provider,
        client_provider,
        server,
        client,
        socket,
        outbound,
        inbound: requests[0].connection,
    }
}

/// Fully connected pair on a fresh network
pub fn connected_pair(network: &SimulatedNetwork, client_config: EndpointConfig) -> Pair {
    let mut pair = pending_pair(network, client_config);
    pair.accept();
    pair
}
