//! Callback bridge dispatch behavior
//!
//! Handler isolation, reentrancy, dispatch order across the provider queue
//! and the broker, and subscription management.

mod test_utils;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use relaynet_core::ProviderEvent;
use relaynet_harness::{EndpointConfig, SimulatedNetwork, SimulatedProvider};
use relaynet_runtime::{
    ConnectionInfo, ConnectionState, DeliveryClass, EventSink, HandlerScope, Identity,
    RelayContextBuilder, RelayNetConfig, RelayNetError, RelayNetResult, StateChangeEvent,
    VirtualPort,
};
use test_utils::*;

#[test]
fn test_failing_handlers_do_not_stop_dispatch() {
    let (provider, mut context) = standalone(EndpointConfig::new("hostA"));
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(1))
        .unwrap();

    context
        .on_state_change(|_, _| Err(RelayNetError::handler_failed("boom")))
        .unwrap();
    context
        .on_state_change(|_, change| {
            if change.new_state == ConnectionState::FindingRoute {
                panic!("handler panic");
            }
            Ok(())
        })
        .unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let recorder = seen.clone();
    context
        .on_state_change(move |_, change| {
            recorder.borrow_mut().push(change.new_state);
            Ok(())
        })
        .unwrap();

    provider.script_transition(handle, ConnectionState::FindingRoute);
    provider.script_transition(handle, ConnectionState::Connected);
    let events = context.pump().unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(
        *seen.borrow(),
        vec![ConnectionState::FindingRoute, ConnectionState::Connected]
    );
    // boom twice, panic once
    let bridge = context.stats().bridge;
    assert_eq!(bridge.handler_failures, 3);
    assert_eq!(bridge.events_dispatched, 2);

    // The bridge keeps working after a handler panicked
    provider.script_end(handle, ConnectionState::ClosedByPeer, 0, "");
    assert_eq!(context.pump().unwrap().len(), 1);
    assert_eq!(seen.borrow().len(), 3);
}

#[test]
fn test_unisolated_panic_ends_pump_without_wedging_bridge() {
    let mut config = RelayNetConfig::testing();
    config.bridge.isolate_handler_panics = false;
    let provider = SimulatedProvider::standalone(EndpointConfig::new("hostA"));
    let mut context = RelayContextBuilder::new(provider.clone())
        .with_config(config)
        .with_no_logging()
        .build()
        .unwrap();
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(1))
        .unwrap();

    context
        .on_state_change(|_, change| {
            if change.new_state == ConnectionState::FindingRoute {
                panic!("handler panic");
            }
            Ok(())
        })
        .unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let recorder = seen.clone();
    context
        .on_state_change(move |_, change| {
            recorder.borrow_mut().push(change.new_state);
            Ok(())
        })
        .unwrap();

    provider.script_transition(handle, ConnectionState::FindingRoute);
    provider.script_transition(handle, ConnectionState::Connected);
    assert!(matches!(
        context.pump(),
        Err(RelayNetError::HandlerFailed { .. })
    ));
    assert!(seen.borrow().is_empty());
    // Skipped events still moved the connection along
    assert_eq!(context.stats().distribution.connected, 1);

    provider.script_end(handle, ConnectionState::ClosedByPeer, 0, "");
    let events = context.pump().unwrap();
    assert_eq!(
        state_changes(&events),
        vec![(ConnectionState::Connected, ConnectionState::ClosedByPeer)]
    );
    assert_eq!(*seen.borrow(), vec![ConnectionState::ClosedByPeer]);
    assert_eq!(context.stats().bridge.handler_failures, 1);
    assert_eq!(context.stats().bridge.reentrant_pumps, 0);
}

#[test]
fn test_pump_from_handler_is_rejected() {
    let (provider, mut context) = standalone(EndpointConfig::new("hostA"));
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(1))
        .unwrap();

    let rejected = Rc::new(Cell::new(false));
    let flag = rejected.clone();
    context
        .on_state_change(move |scope, _| {
            let nested = scope.pump();
            flag.set(matches!(nested, Err(RelayNetError::ReentrantPump)));
            Ok(())
        })
        .unwrap();

    provider.script_transition(handle, ConnectionState::Connected);
    assert_eq!(context.pump().unwrap().len(), 1);
    assert!(rejected.get());
    assert_eq!(context.stats().bridge.reentrant_pumps, 1);

    // The outer dispatch ended cleanly
    assert!(context.pump().unwrap().is_empty());
}

#[test]
fn test_handlers_can_send_on_connect() {
    struct Greeter;
    impl EventSink for Greeter {
        fn on_state_change(
            &mut self,
            scope: &mut HandlerScope<'_>,
            event: &StateChangeEvent,
        ) -> RelayNetResult<()> {
            if event.new_state == ConnectionState::Connected {
                scope.set_connection_name(event.connection, "greeted")?;
                scope.send(event.connection, b"hello", DeliveryClass::Reliable)?;
                scope.flush(event.connection)?;
            }
            Ok(())
        }
    }

    let network = SimulatedNetwork::new();
    let mut pair = pending_pair(&network, EndpointConfig::new(CLIENT));
    pair.client.register(Greeter).unwrap();
    pair.accept();

    let messages = pair.server.receive_on_connection(pair.inbound, 8).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, b"hello".to_vec());
    assert_eq!(
        pair.client.connection_info(pair.outbound).unwrap().name,
        "greeted"
    );
}

#[test]
fn test_provider_queue_dispatched_before_broker() {
    let (provider, mut context) = standalone(EndpointConfig::new("hostA"));
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(1))
        .unwrap();

    // Posted first, but broker records follow the provider's own queue
    provider.post_via_broker(ProviderEvent::ConnectionStatusChanged {
        connection: handle,
        old_state: ConnectionState::FindingRoute,
        info: ConnectionInfo::new(Identity::from("peerB"), ConnectionState::Connected),
    });
    provider.script_transition(handle, ConnectionState::FindingRoute);

    let events = context.pump().unwrap();
    assert_eq!(
        state_changes(&events),
        vec![
            (ConnectionState::Connecting, ConnectionState::FindingRoute),
            (ConnectionState::FindingRoute, ConnectionState::Connected),
        ]
    );
}

#[test]
fn test_status_reported_through_broker() {
    let network = SimulatedNetwork::new();
    let server_provider = network.endpoint(EndpointConfig::new(SERVER).with_status_via_broker());
    let client_provider = network.endpoint(EndpointConfig::new(CLIENT));
    let mut server = quiet_context(server_provider);
    let mut client = quiet_context(client_provider);

    server.create_listen_socket(game_port()).unwrap();
    client.connect(&Identity::from(SERVER), game_port()).unwrap();

    let requests = incoming_requests(&server.pump().unwrap());
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].remote, Identity::from(CLIENT));
}

#[test]
fn test_unsubscribe() {
    let (provider, mut context) = standalone(EndpointConfig::new("hostA"));
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(1))
        .unwrap();

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let id = context
        .on_state_change(move |_, _| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .unwrap();
    assert!(context.unsubscribe(id));
    assert!(!context.unsubscribe(id));

    provider.script_transition(handle, ConnectionState::Connected);
    assert_eq!(context.pump().unwrap().len(), 1);
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_sinks_notified_when_bridge_closes() {
    struct Closing(Rc<Cell<bool>>);
    impl EventSink for Closing {
        fn on_bridge_closing(&mut self) {
            self.0.set(true);
        }
    }

    let (_provider, mut context) = standalone(EndpointConfig::new("hostA"));
    let closed = Rc::new(Cell::new(false));
    context.register(Closing(closed.clone())).unwrap();

    context.shutdown_all().unwrap();
    assert!(closed.get());
    assert!(matches!(context.pump(), Err(RelayNetError::BridgeClosed)));
    assert!(matches!(
        context.register(Closing(Rc::new(Cell::new(false)))),
        Err(RelayNetError::BridgeClosed)
    ));
}
