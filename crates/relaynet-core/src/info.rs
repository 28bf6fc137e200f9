//! Connection snapshots, messages and status queries
//!
//! Everything here is a plain value captured from the provider at a point in
//! time. None of it is cached across pump ticks by the runtime.

use serde::{Deserialize, Serialize};

use crate::state::ConnectionState;
use crate::types::{ConnectionHandle, Identity, ListenSocketHandle, PopId};

// ----------------------------------------------------------------------------
// Connection Info
// ----------------------------------------------------------------------------

/// Snapshot of a connection as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Identity of the remote end
    pub remote: Identity,
    /// State at the time the snapshot was taken
    pub state: ConnectionState,
    /// Listen socket that accepted this connection (server side only)
    pub listen_socket: Option<ListenSocketHandle>,
    /// POP the remote host is closest to, when relayed
    pub remote_pop: Option<PopId>,
    /// POP the traffic is relayed through
    pub relay_pop: Option<PopId>,
    /// Application or provider reason code once the connection ended
    pub end_reason: Option<i32>,
    /// Free-text end/debug message
    pub end_debug: String,
    /// Display name given with `set_connection_name`
    pub name: String,
}

impl ConnectionInfo {
    /// Minimal snapshot for a connection in `state`
    pub fn new(remote: Identity, state: ConnectionState) -> Self {
        Self {
            remote,
            state,
            listen_socket: None,
            remote_pop: None,
            relay_pop: None,
            end_reason: None,
            end_debug: String::new(),
            name: String::new(),
        }
    }

    /// Human readable name of `state`
    pub fn state_name(&self) -> &'static str {
        self.state.state_name()
    }

    /// Whether the connection was accepted through a local listen socket
    pub fn is_inbound(&self) -> bool {
        self.listen_socket.is_some()
    }

    pub fn with_listen_socket(mut self, socket: ListenSocketHandle) -> Self {
        self.listen_socket = Some(socket);
        self
    }

    pub fn with_end(mut self, reason: i32, debug: impl Into<String>) -> Self {
        self.end_reason = Some(reason);
        self.end_debug = debug.into();
        self
    }
}

// ----------------------------------------------------------------------------
// Real-Time Status
// ----------------------------------------------------------------------------

/// Point-in-time connection metrics
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RealTimeStatus {
    pub state: ConnectionState,
    /// Round-trip estimate in milliseconds
    pub ping_ms: u32,
    /// Fraction of packets delivered locally (0.0..=1.0)
    pub local_quality: f32,
    /// Fraction of packets delivered at the remote end (0.0..=1.0)
    pub remote_quality: f32,
    /// Current outbound rate estimate in bytes per second
    pub send_rate_bytes_per_sec: u32,
    /// Reliable bytes not yet acknowledged
    pub pending_reliable_bytes: usize,
    /// Unreliable bytes not yet put on the wire
    pub pending_unreliable_bytes: usize,
    /// Reliable bytes sent but waiting for acknowledgement
    pub sent_unacked_reliable_bytes: usize,
}

impl RealTimeStatus {
    /// Total bytes still held by the provider for this connection
    pub fn pending_bytes(&self) -> usize {
        self.pending_reliable_bytes + self.pending_unreliable_bytes
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Delivery guarantee requested for a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// Retransmitted until acknowledged, ordered per connection
    Reliable,
    /// Best effort; may be dropped or arrive out of order
    Unreliable,
}

impl DeliveryClass {
    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryClass::Reliable)
    }
}

/// A received payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Connection the payload arrived on
    pub connection: ConnectionHandle,
    /// Delivery class it was sent with
    pub delivery: DeliveryClass,
    /// Provider-assigned message number on the sending side
    pub message_number: u64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        connection: ConnectionHandle,
        delivery: DeliveryClass,
        message_number: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            connection,
            delivery,
            message_number,
            payload,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Result of a send accepted by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub connection: ConnectionHandle,
    /// Monotonically increasing per connection
    pub sequence: u64,
}

// ----------------------------------------------------------------------------
// Relay Pings
// ----------------------------------------------------------------------------

/// Ping to a relay point of presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopPing {
    pub pop: PopId,
    pub ping_ms: u32,
    /// First hop used to reach `pop`; equal to `pop` for a direct ping
    pub via: PopId,
}
