//! Credential ticket management
//!
//! Tickets are requested from the provider, which answers later through the
//! credential callback sink. The sink registered here never touches host
//! state: it only posts a [`ProviderEvent::TicketReady`] into the bridge
//! broker, and the outcome is applied on the next pump.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use relaynet_core::{
    BridgeEvent, BrokerSender, CorrelationId, CredentialCallbackSink, CredentialTicket,
    HandleFault, HandleKind, ProviderEvent, RelayNetError, Result, ResultCode, TicketConfig,
    TicketHandle, TicketKind, TicketOutcome, TicketResolved, TicketState, TransportProvider,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

// ----------------------------------------------------------------------------
// Callback Sink
// ----------------------------------------------------------------------------

/// Sink handed to the provider; forwards every callback into the broker
#[derive(Debug)]
pub struct BrokerCredentialSink {
    broker: BrokerSender,
}

impl BrokerCredentialSink {
    pub fn new(broker: BrokerSender) -> Self {
        Self { broker }
    }
}

impl CredentialCallbackSink for BrokerCredentialSink {
    fn on_ticket_ready(&self, correlation: CorrelationId, ticket: TicketHandle, outcome: TicketOutcome) {
        if !self.broker.post(ProviderEvent::TicketReady {
            correlation,
            ticket,
            outcome,
        }) {
            trace!(%ticket, "Ticket callback arrived after bridge release");
        }
    }
}

// ----------------------------------------------------------------------------
// Ticket Future
// ----------------------------------------------------------------------------

/// Resolves once the provider delivered (or refused) a ticket
///
/// The future is only woken by `pump()`; awaiting it without pumping the
/// context never completes.
#[derive(Debug)]
pub struct TicketFuture {
    handle: TicketHandle,
    receiver: oneshot::Receiver<Result<CredentialTicket>>,
}

impl TicketFuture {
    pub fn handle(&self) -> TicketHandle {
        self.handle
    }

    /// Non-blocking check; `None` while the ticket is still pending
    pub fn try_take(&mut self) -> Option<Result<CredentialTicket>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RelayNetError::TicketCanceled {
                handle: self.handle.raw(),
            })),
        }
    }
}

impl Future for TicketFuture {
    type Output = Result<CredentialTicket>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let handle = self.handle;
        Pin::new(&mut self.receiver).poll(cx).map(|outcome| {
            outcome.unwrap_or(Err(RelayNetError::TicketCanceled {
                handle: handle.raw(),
            }))
        })
    }
}

// ----------------------------------------------------------------------------
// Ticket Manager
// ----------------------------------------------------------------------------

struct TicketEntry {
    ticket: CredentialTicket,
    waiter: Option<oneshot::Sender<Result<CredentialTicket>>>,
}

impl TicketEntry {
    fn notify(&mut self, outcome: Result<CredentialTicket>) {
        if let Some(waiter) = self.waiter.take() {
            // The host may have dropped the future; that is fine
            let _ = waiter.send(outcome);
        }
    }
}

/// Bounded memory of canceled tickets
struct CanceledTickets {
    order: VecDeque<TicketHandle>,
    members: HashSet<TicketHandle>,
    capacity: usize,
}

impl CanceledTickets {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn remember(&mut self, handle: TicketHandle) {
        if self.capacity == 0 || !self.members.insert(handle) {
            return;
        }
        self.order.push_back(handle);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, handle: TicketHandle) -> bool {
        self.members.contains(&handle)
    }
}

/// Tracks issued tickets and routes provider callbacks to their futures
///
/// Only pending and valid tickets are held; canceled ones move to a bounded
/// memory and failed ones are forgotten.
pub struct CredentialTickets {
    config: TicketConfig,
    broker: BrokerSender,
    /// Set once the callback sink is registered with the provider
    correlation: Option<CorrelationId>,
    torn_down: bool,
    entries: BTreeMap<TicketHandle, TicketEntry>,
    canceled: CanceledTickets,
    stats: TicketStats,
}

impl CredentialTickets {
    pub fn new(config: TicketConfig, broker: BrokerSender) -> Self {
        Self {
            canceled: CanceledTickets::new(config.canceled_memory),
            config,
            broker,
            correlation: None,
            torn_down: false,
            entries: BTreeMap::new(),
            stats: TicketStats::default(),
        }
    }

    /// Register the callback sink on first use; at most once per context
    fn ensure_registered(&mut self, provider: &mut dyn TransportProvider) -> Result<CorrelationId> {
        if let Some(correlation) = self.correlation {
            return Ok(correlation);
        }
        let correlation = CorrelationId::for_tickets();
        let sink = Arc::new(BrokerCredentialSink::new(self.broker.clone()));
        if !provider.register_credential_sink(correlation, sink) {
            return Err(RelayNetError::provider(
                "register_credential_sink",
                ResultCode::Fail,
            ));
        }
        debug!(%correlation, "Registered credential callback sink");
        self.correlation = Some(correlation);
        Ok(correlation)
    }

    /// Tickets that are pending or valid
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }

    fn canceled_error(handle: TicketHandle) -> RelayNetError {
        RelayNetError::TicketCanceled {
            handle: handle.raw(),
        }
    }

    pub fn request(
        &mut self,
        provider: &mut dyn TransportProvider,
        kind: TicketKind,
    ) -> Result<TicketFuture> {
        if self.torn_down {
            return Err(RelayNetError::BridgeClosed);
        }
        if self.outstanding() >= self.config.max_outstanding {
            return Err(RelayNetError::TicketLimitReached {
                limit: self.config.max_outstanding,
            });
        }

        let correlation = self.ensure_registered(provider)?;
        let handle = provider
            .request_ticket(&kind, correlation)
            .ok_or_else(|| RelayNetError::provider("request_ticket", ResultCode::Fail))?;

        let (sender, receiver) = oneshot::channel();
        info!(ticket = %handle, %kind, "Requested credential ticket");
        self.entries.insert(
            handle,
            TicketEntry {
                ticket: CredentialTicket::new(handle, kind),
                waiter: Some(sender),
            },
        );
        self.stats.requested += 1;
        Ok(TicketFuture { handle, receiver })
    }

    /// Apply a provider callback drained from the broker
    pub fn resolve(
        &mut self,
        correlation: CorrelationId,
        handle: TicketHandle,
        outcome: TicketOutcome,
    ) -> Option<BridgeEvent> {
        if self.correlation != Some(correlation) {
            trace!(%correlation, ticket = %handle, "Ticket callback for another sink");
            return None;
        }
        let Some(entry) = self.entries.get_mut(&handle) else {
            if self.canceled.contains(handle) {
                debug!(ticket = %handle, "Ignoring callback for canceled ticket");
            } else {
                trace!(ticket = %handle, "Ticket callback for unknown ticket");
            }
            return None;
        };
        if entry.ticket.state != TicketState::Pending {
            debug!(ticket = %handle, state = ?entry.ticket.state, "Ignoring late ticket callback");
            return None;
        }

        match outcome {
            Ok(bytes) => {
                entry.ticket.validate(bytes);
                let snapshot = entry.ticket.clone();
                entry.notify(Ok(snapshot));
                self.stats.resolved += 1;
                debug!(ticket = %handle, "Ticket became valid");
                Some(BridgeEvent::TicketResolved(TicketResolved {
                    ticket: handle,
                    valid: true,
                }))
            }
            Err(code) => {
                if let Some(mut entry) = self.entries.remove(&handle) {
                    entry.notify(Err(RelayNetError::provider("request_ticket", code)));
                }
                self.stats.failed += 1;
                warn!(ticket = %handle, %code, "Ticket request failed");
                Some(BridgeEvent::TicketResolved(TicketResolved {
                    ticket: handle,
                    valid: false,
                }))
            }
        }
    }

    /// Current view of a ticket
    pub fn ticket(&self, handle: TicketHandle) -> Result<CredentialTicket> {
        match self.entries.get(&handle) {
            Some(entry) => Ok(entry.ticket.clone()),
            None if self.canceled.contains(handle) => Err(Self::canceled_error(handle)),
            None => Err(RelayNetError::invalid_handle(
                HandleKind::Ticket,
                handle.raw(),
                HandleFault::Unknown,
            )),
        }
    }

    /// Cancel a pending or valid ticket, wiping its bytes
    pub fn cancel(&mut self, provider: &mut dyn TransportProvider, handle: TicketHandle) -> Result<()> {
        if self.torn_down {
            return Err(RelayNetError::BridgeClosed);
        }
        self.cancel_entry(provider, handle)
    }

    fn cancel_entry(&mut self, provider: &mut dyn TransportProvider, handle: TicketHandle) -> Result<()> {
        if self.canceled.contains(handle) {
            return Err(Self::canceled_error(handle));
        }
        let mut entry = self.entries.remove(&handle).ok_or_else(|| {
            RelayNetError::invalid_handle(HandleKind::Ticket, handle.raw(), HandleFault::Unknown)
        })?;

        if !provider.cancel_ticket(handle) {
            debug!(ticket = %handle, "Provider had already released the ticket");
        }
        entry.ticket.cancel();
        entry.notify(Err(Self::canceled_error(handle)));
        self.canceled.remember(handle);
        self.stats.canceled += 1;
        debug!(ticket = %handle, "Canceled ticket");
        Ok(())
    }

    /// Cancel every outstanding ticket; returns how many were canceled
    pub fn cancel_all(&mut self, provider: &mut dyn TransportProvider) -> usize {
        let handles: Vec<TicketHandle> = self.entries.keys().copied().collect();
        handles
            .into_iter()
            .filter(|handle| self.cancel_entry(provider, *handle).is_ok())
            .count()
    }

    /// Unregister the callback sink; later requests and cancels fail with `BridgeClosed`
    pub fn teardown(&mut self, provider: &mut dyn TransportProvider) {
        if let Some(correlation) = self.correlation.take() {
            provider.unregister_credential_sink(correlation);
            debug!(%correlation, "Unregistered credential callback sink");
        }
        self.torn_down = true;
    }

    pub fn statistics(&self) -> &TicketStats {
        &self.stats
    }
}

/// Statistics for credential tickets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TicketStats {
    pub requested: u64,
    pub resolved: u64,
    pub failed: u64,
    pub canceled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaynet_core::event_broker;

    #[test]
    fn test_sink_posts_into_broker() {
        let (sender, mut receiver) = event_broker();
        let sink = BrokerCredentialSink::new(sender);
        let correlation = CorrelationId::new(3);
        sink.on_ticket_ready(correlation, TicketHandle::new(1), Ok(vec![1, 2]));

        let drained = receiver.drain();
        assert_eq!(
            drained,
            vec![ProviderEvent::TicketReady {
                correlation,
                ticket: TicketHandle::new(1),
                outcome: Ok(vec![1, 2]),
            }]
        );
    }

    #[test]
    fn test_future_reports_cancel_when_sender_dropped() {
        let (sender, receiver) = oneshot::channel::<Result<CredentialTicket>>();
        let mut future = TicketFuture {
            handle: TicketHandle::new(8),
            receiver,
        };
        assert!(future.try_take().is_none());
        drop(sender);
        assert!(matches!(
            future.try_take(),
            Some(Err(RelayNetError::TicketCanceled { handle: 8 }))
        ));
    }

    #[test]
    fn test_resolve_ignores_foreign_correlation() {
        let (sender, _receiver) = event_broker();
        let mut tickets = CredentialTickets::new(TicketConfig::default(), sender);
        assert!(tickets
            .resolve(CorrelationId::new(999), TicketHandle::new(1), Ok(vec![1]))
            .is_none());
        assert!(tickets.ticket(TicketHandle::new(1)).is_err());
    }
}
