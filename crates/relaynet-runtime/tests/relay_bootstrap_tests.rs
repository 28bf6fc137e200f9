//! Relay bootstrap and locality queries

use std::sync::Arc;
use std::time::Duration;

use relaynet_core::{ProviderEvent, RelayConfig};
use relaynet_harness::{EndpointConfig, ManualTimeSource, ProviderCall, RelayScript, SimulatedProvider};
use relaynet_runtime::{
    EventSink, Identity, PingLocation, PopId, RelayAvailability, RelayContext,
    RelayContextBuilder, RelayNetConfig, RelayNetError, VirtualPort, BOOTSTRAP_TIMEOUT_REASON,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Context that refuses connects until the relay network is current
fn gated_context(
    script: RelayScript,
    clock: &ManualTimeSource,
) -> (SimulatedProvider, RelayContext<SimulatedProvider>) {
    let provider =
        SimulatedProvider::standalone(EndpointConfig::new("hostA").with_relay_script(script));
    let mut config = RelayNetConfig::testing();
    config.connections.require_relay_for_connect = true;
    config.relay = RelayConfig {
        init_on_start: false,
        bootstrap_timeout_ms: 500,
    };
    let context = RelayContextBuilder::new(provider.clone())
        .with_config(config)
        .with_time_source(Arc::new(clock.clone()))
        .with_no_logging()
        .build()
        .unwrap();
    (provider, context)
}

#[test]
fn test_bootstrap_success_unlocks_connect_and_identity() {
    let clock = ManualTimeSource::new(1_000);
    let (_provider, mut context) = gated_context(RelayScript::SucceedAfter(2), &clock);

    assert_eq!(context.relay_status(), RelayAvailability::Unknown);
    assert!(context.local_identity().is_none());

    context.init_relay().unwrap();
    assert_eq!(context.relay_status(), RelayAvailability::Attempting);
    assert!(context.local_identity().is_none());
    assert!(context.local_ping_location().is_none());

    // The connect polls relay status too, which completes the bootstrap
    let handle = context
        .connect(&Identity::from("peerB"), VirtualPort::new(3))
        .unwrap();
    assert!(context.is_live(handle));
    assert_eq!(context.relay_status(), RelayAvailability::Current);
    assert_eq!(context.local_identity(), Some(Identity::from("hostA")));
}

#[test]
fn test_connect_refused_until_relay_current() {
    let clock = ManualTimeSource::new(0);
    let (_provider, mut context) = gated_context(RelayScript::Stall, &clock);
    context.init_relay().unwrap();

    let err = context
        .connect(&Identity::from("peerB"), VirtualPort::new(3))
        .unwrap_err();
    assert!(matches!(
        err,
        RelayNetError::TransportUnavailable {
            status: RelayAvailability::Attempting
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(context.stats().connections.connects_refused, 1);
}

#[test]
fn test_bootstrap_times_out() {
    let clock = ManualTimeSource::new(0);
    let (_provider, mut context) = gated_context(RelayScript::Stall, &clock);
    context.init_relay().unwrap();

    clock.advance(Duration::from_millis(499));
    assert_eq!(context.relay_status(), RelayAvailability::Attempting);

    clock.advance(Duration::from_millis(1));
    assert_eq!(
        context.relay_status(),
        RelayAvailability::Failed(BOOTSTRAP_TIMEOUT_REASON.to_string())
    );
    // Settled, even though it failed
    assert_eq!(context.local_identity(), Some(Identity::from("hostA")));

    clock.advance(Duration::from_secs(60));
    assert!(matches!(
        context.relay_status(),
        RelayAvailability::Failed(_)
    ));
}

#[test]
fn test_bootstrap_failure_reported_by_provider() {
    let clock = ManualTimeSource::new(0);
    let (_provider, mut context) = gated_context(
        RelayScript::FailAfter(1, "no relay configuration".to_string()),
        &clock,
    );
    context.init_relay().unwrap();

    let failed = RelayAvailability::Failed("no relay configuration".to_string());
    assert_eq!(context.relay_status(), failed);
    assert!(matches!(
        context.connect(&Identity::from("peerB"), VirtualPort::new(3)),
        Err(RelayNetError::TransportUnavailable { status }) if status == failed
    ));
}

#[test]
fn test_init_is_idempotent() {
    let clock = ManualTimeSource::new(0);
    let (provider, mut context) = gated_context(RelayScript::Stall, &clock);
    context.init_relay().unwrap();
    context.init_relay().unwrap();

    let bootstraps = provider
        .call_log()
        .iter()
        .filter(|call| **call == ProviderCall::BootstrapRelay)
        .count();
    assert_eq!(bootstraps, 1);
}

#[test]
fn test_init_on_start() {
    let provider = SimulatedProvider::standalone(EndpointConfig::new("hostA"));
    let mut context = RelayContextBuilder::new(provider.clone())
        .with_config(RelayNetConfig::testing())
        .init_relay_on_start(true)
        .with_no_logging()
        .build()
        .unwrap();

    assert_eq!(
        &provider.call_log()[..2],
        &[ProviderCall::AttachBroker, ProviderCall::BootstrapRelay]
    );
    assert_eq!(context.relay_status(), RelayAvailability::Current);
}

#[test]
fn test_locality_queries_once_current() {
    let clock = ManualTimeSource::new(0);
    let (_provider, mut context) = gated_context(RelayScript::SucceedAfter(1), &clock);
    let fra = PopId::from_code("fra").unwrap();

    assert!(context.pop_list().is_empty());
    assert!(context.ping_to_pop(fra).is_none());

    context.init_relay().unwrap();
    assert!(context.relay_status().is_current());

    assert_eq!(context.pop_list().len(), 3);
    let ping = context.ping_to_pop(fra).unwrap();
    assert_eq!(ping.ping_ms, 12);
    assert_eq!(ping.via, fra);
    assert!(context.ping_to_pop(PopId::from_code("syd").unwrap()).is_none());

    assert!(context.local_ping_location().is_some());
    // Best shared POP: fra (12 + 30) beats sgp (170 + 5)
    let remote = PingLocation::new("fra=30,sgp=5");
    assert_eq!(context.estimate_latency(&remote), Some(42));
    assert_eq!(
        context.estimate_latency_between(&PingLocation::new("iad=10"), &PingLocation::new("iad=15")),
        Some(25)
    );
    assert_eq!(
        context.estimate_latency_between(&PingLocation::new("iad=10"), &PingLocation::new("fra=15")),
        None
    );
}

#[test]
fn test_relay_status_events_only_move_forward() {
    struct Recorder(Rc<RefCell<Vec<RelayAvailability>>>);
    impl EventSink for Recorder {
        fn on_relay_status(&mut self, status: &RelayAvailability) -> relaynet_runtime::RelayNetResult<()> {
            self.0.borrow_mut().push(status.clone());
            Ok(())
        }
    }

    let clock = ManualTimeSource::new(0);
    let (provider, mut context) = gated_context(RelayScript::Stall, &clock);
    let seen = Rc::new(RefCell::new(Vec::new()));
    context.register(Recorder(seen.clone())).unwrap();

    provider.post_via_broker(ProviderEvent::RelayStatusChanged(RelayAvailability::Attempting));
    provider.post_via_broker(ProviderEvent::RelayStatusChanged(RelayAvailability::Current));
    provider.post_via_broker(ProviderEvent::RelayStatusChanged(RelayAvailability::Attempting));
    let events = context.pump().unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(
        *seen.borrow(),
        vec![RelayAvailability::Attempting, RelayAvailability::Current]
    );
    assert!(context.relay_status().is_current());
}
