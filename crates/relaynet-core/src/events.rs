//! Native event records and the typed events the bridge dispatches
//!
//! [`ProviderEvent`] is what the transport provider emits, either from
//! `poll_events()` or through the broker. The runtime translates each record
//! into zero or more [`BridgeEvent`]s once it has updated its own state.

use serde::{Deserialize, Serialize};

use crate::info::ConnectionInfo;
use crate::relay::RelayAvailability;
use crate::state::ConnectionState;
use crate::ticket::{CorrelationId, TicketOutcome};
use crate::types::{ConnectionHandle, Identity, ListenSocketHandle, TicketHandle};

// ----------------------------------------------------------------------------
// Native Records
// ----------------------------------------------------------------------------

/// Raw notification emitted by the transport provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A connection changed state; `info.state` is the new state
    ConnectionStatusChanged {
        connection: ConnectionHandle,
        old_state: ConnectionState,
        info: ConnectionInfo,
    },
    /// Relay availability changed on the provider side
    RelayStatusChanged(RelayAvailability),
    /// One-shot credential callback
    TicketReady {
        correlation: CorrelationId,
        ticket: TicketHandle,
        outcome: TicketOutcome,
    },
}

impl ProviderEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::ConnectionStatusChanged { .. } => "ConnectionStatusChanged",
            ProviderEvent::RelayStatusChanged(_) => "RelayStatusChanged",
            ProviderEvent::TicketReady { .. } => "TicketReady",
        }
    }

    /// Whether this record announces a new inbound connection
    pub fn is_incoming_request(&self) -> bool {
        matches!(
            self,
            ProviderEvent::ConnectionStatusChanged { old_state: ConnectionState::None, info, .. }
                if info.state == ConnectionState::Connecting && info.listen_socket.is_some()
        )
    }
}

// ----------------------------------------------------------------------------
// Typed Events
// ----------------------------------------------------------------------------

/// A connection moved from `old_state` to `new_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub connection: ConnectionHandle,
    pub old_state: ConnectionState,
    pub new_state: ConnectionState,
    /// Snapshot taken at the time of the transition
    pub info: ConnectionInfo,
}

/// A remote peer asked to connect to one of our listen sockets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingConnectionRequest {
    pub listen_socket: ListenSocketHandle,
    pub remote: Identity,
    /// Pre-allocated by the provider, in `Connecting` until accepted
    pub connection: ConnectionHandle,
}

/// Outcome of a ticket request, as seen by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketResolved {
    pub ticket: TicketHandle,
    /// `true` when the ticket became valid
    pub valid: bool,
}

/// Events dispatched from `pump()`, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeEvent {
    StateChanged(StateChangeEvent),
    IncomingRequest(IncomingConnectionRequest),
    RelayStatusChanged(RelayAvailability),
    TicketResolved(TicketResolved),
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::StateChanged(_) => "StateChanged",
            BridgeEvent::IncomingRequest(_) => "IncomingRequest",
            BridgeEvent::RelayStatusChanged(_) => "RelayStatusChanged",
            BridgeEvent::TicketResolved(_) => "TicketResolved",
        }
    }

    pub fn as_state_change(&self) -> Option<&StateChangeEvent> {
        match self {
            BridgeEvent::StateChanged(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_incoming_request(&self) -> Option<&IncomingConnectionRequest> {
        match self {
            BridgeEvent::IncomingRequest(request) => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_request_detection() {
        let info = ConnectionInfo::new(Identity::new("peerY"), ConnectionState::Connecting)
            .with_listen_socket(ListenSocketHandle::new(5));
        let incoming = ProviderEvent::ConnectionStatusChanged {
            connection: ConnectionHandle::new(9),
            old_state: ConnectionState::None,
            info: info.clone(),
        };
        assert!(incoming.is_incoming_request());

        let outbound = ProviderEvent::ConnectionStatusChanged {
            connection: ConnectionHandle::new(9),
            old_state: ConnectionState::None,
            info: ConnectionInfo::new(Identity::new("peerY"), ConnectionState::Connecting),
        };
        assert!(!outbound.is_incoming_request());

        let progressed = ProviderEvent::ConnectionStatusChanged {
            connection: ConnectionHandle::new(9),
            old_state: ConnectionState::Connecting,
            info,
        };
        assert!(!progressed.is_incoming_request());
    }
}
