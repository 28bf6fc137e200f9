//! Event broker between native callbacks and the pump thread
//!
//! The broker is the only cross-thread path in the connection layer. The
//! provider (and any foreign thread it runs callbacks on) holds a cloneable
//! [`BrokerSender`]; the callback bridge owns the single [`BrokerReceiver`]
//! and drains it without blocking from inside `pump()`.
//!
//! Closing the receiver is the only way to obtain a [`BridgeReleased`]
//! token, and provider module teardown requires that token. The token names
//! the broker it was produced from; a provider accepts it only for the
//! broker it was handed in `attach_broker`, so a token minted from an
//! unrelated broker cannot stand in for releasing the attached one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::events::ProviderEvent;

static NEXT_BROKER: AtomicU64 = AtomicU64::new(1);

/// Identity of one broker channel, shared by both halves and its release token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerId(u64);

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker-{}", self.0)
    }
}

/// Create a connected broker pair
pub fn event_broker() -> (BrokerSender, BrokerReceiver) {
    let id = BrokerId(NEXT_BROKER.fetch_add(1, Ordering::Relaxed));
    let (sender, receiver) = mpsc::unbounded_channel();
    (BrokerSender { id, sender }, BrokerReceiver { id, receiver })
}

// ----------------------------------------------------------------------------
// Sender
// ----------------------------------------------------------------------------

/// Thread-safe handle used to post native events
#[derive(Debug, Clone)]
pub struct BrokerSender {
    id: BrokerId,
    sender: mpsc::UnboundedSender<ProviderEvent>,
}

impl BrokerSender {
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Queue an event for the next pump; returns `false` once the bridge released the broker
    pub fn post(&self, event: ProviderEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => true,
            Err(rejected) => {
                trace!(kind = rejected.0.kind(), "Broker closed, dropping native event");
                false
            }
        }
    }

    /// Whether the receiving side is gone
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Receiver
// ----------------------------------------------------------------------------

/// Receiving half, owned by the callback bridge
#[derive(Debug)]
pub struct BrokerReceiver {
    id: BrokerId,
    receiver: mpsc::UnboundedReceiver<ProviderEvent>,
}

impl BrokerReceiver {
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Take every event queued so far, in arrival order; never blocks
    pub fn drain(&mut self) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the broker, discarding anything still queued
    pub fn close(mut self) -> BridgeReleased {
        self.receiver.close();
        let discarded = self.drain().len();
        BridgeReleased {
            broker: self.id,
            discarded,
        }
    }
}

/// Proof that the callback bridge released its broker
#[derive(Debug)]
#[must_use = "provider teardown requires the release token"]
pub struct BridgeReleased {
    broker: BrokerId,
    discarded: usize,
}

impl BridgeReleased {
    /// Broker this token proves released
    pub fn broker_id(&self) -> BrokerId {
        self.broker
    }

    /// Native events that were still queued when the broker closed
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}
