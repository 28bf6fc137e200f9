//! Callback bridge
//!
//! Collects native events from the provider (its own queue plus the broker
//! fed by foreign threads) and dispatches them to registered sinks on the
//! thread that calls `pump()`. Handlers run one at a time, in arrival order,
//! and receive a [`HandlerScope`] that exposes the connection operations that
//! are safe to call from inside a handler.

use std::panic::{catch_unwind, AssertUnwindSafe};

use relaynet_core::{
    event_broker, BridgeConfig, BridgeEvent, BridgeReleased, BrokerReceiver, BrokerSender,
    ConnectionHandle, ConnectionInfo, DeliveryClass, IncomingConnectionRequest,
    PollGroupHandle, ProviderEvent, RelayAvailability, RelayNetError, Result, SendReceipt,
    StateChangeEvent, TicketResolved, TransportProvider,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::managers::{ConnectionManager, PollGroupManager};
use crate::registry::HandleRegistry;

// ----------------------------------------------------------------------------
// Event Sinks
// ----------------------------------------------------------------------------

/// Receiver of bridge events
///
/// Every method has a no-op default, so sinks only implement what they care
/// about. An `Err` from a handler is logged and counted; it never stops the
/// dispatch of the remaining handlers or events.
pub trait EventSink {
    fn on_state_change(
        &mut self,
        _scope: &mut HandlerScope<'_>,
        _event: &StateChangeEvent,
    ) -> Result<()> {
        Ok(())
    }

    fn on_incoming_request(
        &mut self,
        _scope: &mut HandlerScope<'_>,
        _request: &IncomingConnectionRequest,
    ) -> Result<()> {
        Ok(())
    }

    fn on_relay_status(&mut self, _status: &RelayAvailability) -> Result<()> {
        Ok(())
    }

    fn on_ticket_resolved(&mut self, _resolved: &TicketResolved) -> Result<()> {
        Ok(())
    }

    /// Last call before the bridge drops the sink during shutdown
    fn on_bridge_closing(&mut self) {}
}

/// Identifies a registered sink for `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Closure adapter for state change handlers
pub(crate) struct StateChangeHandler<F>(pub(crate) F);

impl<F> EventSink for StateChangeHandler<F>
where
    F: FnMut(&mut HandlerScope<'_>, &StateChangeEvent) -> Result<()>,
{
    fn on_state_change(
        &mut self,
        scope: &mut HandlerScope<'_>,
        event: &StateChangeEvent,
    ) -> Result<()> {
        (self.0)(scope, event)
    }
}

/// Closure adapter for incoming request handlers
pub(crate) struct IncomingRequestHandler<F>(pub(crate) F);

impl<F> EventSink for IncomingRequestHandler<F>
where
    F: FnMut(&mut HandlerScope<'_>, &IncomingConnectionRequest) -> Result<()>,
{
    fn on_incoming_request(
        &mut self,
        scope: &mut HandlerScope<'_>,
        request: &IncomingConnectionRequest,
    ) -> Result<()> {
        (self.0)(scope, request)
    }
}

type Subscriptions = Vec<(SubscriptionId, Box<dyn EventSink>)>;

// ----------------------------------------------------------------------------
// Handler Scope
// ----------------------------------------------------------------------------

/// Operations available to a handler while an event is being dispatched
pub struct HandlerScope<'a> {
    pub(crate) bridge: &'a mut CallbackBridge,
    pub(crate) registry: &'a mut HandleRegistry,
    pub(crate) connections: &'a mut ConnectionManager,
    pub(crate) poll_groups: &'a mut PollGroupManager,
    pub(crate) provider: &'a mut dyn TransportProvider,
}

impl<'a> HandlerScope<'a> {
    pub fn accept(&mut self, connection: ConnectionHandle) -> Result<()> {
        self.connections
            .accept(self.registry, self.provider, connection)
    }

    pub fn close(&mut self, connection: ConnectionHandle, reason: i32, debug: &str, linger: bool) -> bool {
        self.connections
            .close(self.registry, self.provider, connection, reason, debug, linger)
    }

    pub fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        delivery: DeliveryClass,
    ) -> Result<SendReceipt> {
        self.connections
            .send(self.registry, self.provider, connection, payload, delivery)
    }

    pub fn flush(&mut self, connection: ConnectionHandle) -> Result<()> {
        self.connections
            .flush(self.registry, self.provider, connection)
    }

    pub fn connection_info(&self, connection: ConnectionHandle) -> Result<ConnectionInfo> {
        self.connections
            .info(self.registry, self.provider, connection)
    }

    pub fn set_connection_name(&mut self, connection: ConnectionHandle, name: &str) -> Result<()> {
        self.connections
            .set_name(self.registry, self.provider, connection, name)
    }

    pub fn assign_to_poll_group(
        &mut self,
        connection: ConnectionHandle,
        group: PollGroupHandle,
    ) -> Result<()> {
        self.poll_groups
            .assign(self.registry, self.provider, connection, group)
    }

    /// Always fails: the bridge is already dispatching
    pub fn pump(&mut self) -> Result<()> {
        self.bridge.begin_dispatch()?;
        self.bridge.end_dispatch();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Callback Bridge
// ----------------------------------------------------------------------------

pub struct CallbackBridge {
    config: BridgeConfig,
    /// `None` once released during shutdown
    broker: Option<BrokerReceiver>,
    sinks: Subscriptions,
    next_subscription: u64,
    dispatching: bool,
    stats: BridgeStats,
}

impl CallbackBridge {
    /// Create the bridge and the broker sender to hand to the provider
    pub fn new(config: BridgeConfig) -> (Self, BrokerSender) {
        let (sender, receiver) = event_broker();
        let bridge = Self {
            config,
            broker: Some(receiver),
            sinks: Vec::new(),
            next_subscription: 1,
            dispatching: false,
            stats: BridgeStats::default(),
        };
        (bridge, sender)
    }

    pub fn is_closed(&self) -> bool {
        self.broker.is_none()
    }

    pub fn register(&mut self, sink: Box<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.sinks.push((id, sink));
        debug!(subscription = id.raw(), "Registered event sink");
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|(existing, _)| *existing != id);
        self.sinks.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.sinks.len()
    }

    /// Enter dispatch; fails when closed or when already dispatching
    pub fn begin_dispatch(&mut self) -> Result<()> {
        if self.broker.is_none() {
            return Err(RelayNetError::BridgeClosed);
        }
        if self.dispatching {
            self.stats.reentrant_pumps += 1;
            warn!("pump() called from inside an event handler");
            return Err(RelayNetError::ReentrantPump);
        }
        self.dispatching = true;
        Ok(())
    }

    pub fn end_dispatch(&mut self) {
        self.dispatching = false;
    }

    /// Native events from the provider queue, then from the broker
    pub fn collect(&mut self, provider: &mut dyn TransportProvider) -> Result<Vec<ProviderEvent>> {
        let broker = self.broker.as_mut().ok_or(RelayNetError::BridgeClosed)?;
        let mut events = provider.poll_events();
        events.extend(broker.drain());

        self.stats.pumps += 1;
        self.stats.native_events += events.len() as u64;
        if events.len() > self.config.backlog_warning_threshold {
            warn!(
                backlog = events.len(),
                threshold = self.config.backlog_warning_threshold,
                "Large native event backlog; pump more often"
            );
        }
        Ok(events)
    }

    /// Take the sinks out for the duration of a dispatch
    pub(crate) fn take_sinks(&mut self) -> Subscriptions {
        std::mem::take(&mut self.sinks)
    }

    pub(crate) fn restore_sinks(&mut self, mut sinks: Subscriptions) {
        // Keep sinks registered before this dispatch ahead of any added since
        sinks.append(&mut self.sinks);
        self.sinks = sinks;
    }

    pub(crate) fn record_dispatch(&mut self, failures: usize) {
        self.stats.events_dispatched += 1;
        self.stats.handler_failures += failures as u64;
    }

    pub fn isolates_panics(&self) -> bool {
        self.config.isolate_handler_panics
    }

    /// Release the broker, returning the token provider teardown requires
    pub fn shutdown(&mut self, provider: &mut dyn TransportProvider) -> Result<BridgeReleased> {
        if self.broker.is_none() {
            return Err(RelayNetError::BridgeClosed);
        }

        for (id, sink) in self.sinks.iter_mut() {
            let closing = catch_unwind(AssertUnwindSafe(|| sink.on_bridge_closing()));
            if closing.is_err() {
                error!(subscription = id.raw(), "Event sink panicked while closing");
            }
        }
        self.sinks.clear();

        provider.detach_broker()?;
        let released = match self.broker.take() {
            Some(receiver) => receiver.close(),
            None => return Err(RelayNetError::BridgeClosed),
        };
        self.stats.events_discarded += released.discarded() as u64;
        info!(discarded = released.discarded(), "Callback bridge released");
        Ok(released)
    }

    pub fn statistics(&self) -> &BridgeStats {
        &self.stats
    }
}

/// Deliver one event to every sink; returns the number of failed handlers
///
/// A panicking handler counts as a failure. Unless panics are isolated it
/// also ends the dispatch, and the remaining sinks do not see the event.
pub(crate) fn dispatch_to_sinks(
    sinks: &mut Subscriptions,
    scope: &mut HandlerScope<'_>,
    event: &BridgeEvent,
    isolate_panics: bool,
) -> Result<usize> {
    let mut failures = 0;
    for (id, sink) in sinks.iter_mut() {
        let call = || match event {
            BridgeEvent::StateChanged(change) => sink.on_state_change(scope, change),
            BridgeEvent::IncomingRequest(request) => sink.on_incoming_request(scope, request),
            BridgeEvent::RelayStatusChanged(status) => sink.on_relay_status(status),
            BridgeEvent::TicketResolved(resolved) => sink.on_ticket_resolved(resolved),
        };

        let outcome = match catch_unwind(AssertUnwindSafe(call)) {
            Ok(outcome) => outcome,
            Err(_) if isolate_panics => Err(RelayNetError::handler_failed("handler panicked")),
            Err(_) => {
                error!(subscription = id.raw(), event = event.kind(), "Event handler panicked; abandoning dispatch");
                return Err(RelayNetError::handler_failed("handler panicked"));
            }
        };

        if let Err(err) = outcome {
            failures += 1;
            error!(subscription = id.raw(), event = event.kind(), error = %err, "Event handler failed");
        }
    }
    Ok(failures)
}

/// Statistics for the callback bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub pumps: u64,
    pub native_events: u64,
    pub events_dispatched: u64,
    pub handler_failures: u64,
    pub reentrant_pumps: u64,
    /// Native events dropped when the broker was released
    pub events_discarded: u64,
}
