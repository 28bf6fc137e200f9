//! Credential ticket types and the native callback seam
//!
//! Ticket issuance is a one-shot asynchronous exchange: the provider hands
//! out a [`TicketHandle`] immediately and later reports the ticket bytes
//! through a [`CredentialCallbackSink`], possibly from a thread the host does
//! not own.

use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::provider::ResultCode;
use crate::types::{Identity, TicketHandle};

// ----------------------------------------------------------------------------
// Ticket Types
// ----------------------------------------------------------------------------

/// What a ticket authenticates against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketKind {
    /// Session ticket for a peer or game server, optionally bound to its identity
    AuthSession { remote: Option<Identity> },
    /// Ticket for a named web API service
    WebApi { service: String },
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketKind::AuthSession { remote: Some(remote) } => write!(f, "AuthSession({})", remote),
            TicketKind::AuthSession { remote: None } => write!(f, "AuthSession"),
            TicketKind::WebApi { service } => write!(f, "WebApi({})", service),
        }
    }
}

/// Ticket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketState {
    Pending,
    Valid,
    Canceled,
}

/// An issued credential ticket
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialTicket {
    pub handle: TicketHandle,
    pub kind: TicketKind,
    pub state: TicketState,
    bytes: Vec<u8>,
}

impl CredentialTicket {
    pub fn new(handle: TicketHandle, kind: TicketKind) -> Self {
        Self {
            handle,
            kind,
            state: TicketState::Pending,
            bytes: Vec::new(),
        }
    }

    /// Ticket bytes; empty until the ticket is valid
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex rendering, the form web APIs expect
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Mark valid with the bytes delivered by the provider
    pub fn validate(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.state = TicketState::Valid;
    }

    /// Mark canceled and wipe the buffer
    pub fn cancel(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
        self.bytes.clear();
        self.state = TicketState::Canceled;
    }
}

// Ticket bytes are credentials; keep them out of logs
impl fmt::Debug for CredentialTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialTicket")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Callback Correlation
// ----------------------------------------------------------------------------

/// Identifier the provider uses to route ticket callbacks back to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(u32);

static NEXT_CORRELATION: AtomicU32 = AtomicU32::new(1);
static TICKET_CORRELATION: OnceLock<CorrelationId> = OnceLock::new();

impl CorrelationId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Correlation id for ticket callbacks, allocated once per process
    pub fn for_tickets() -> Self {
        *TICKET_CORRELATION
            .get_or_init(|| Self(NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed)))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a ticket request as reported by the provider
pub type TicketOutcome = Result<Vec<u8>, ResultCode>;

/// Receiver of one-shot credential callbacks
///
/// The provider may call this from any thread. Implementations must not
/// touch host state directly; the runtime's sink only posts into the bridge
/// broker.
pub trait CredentialCallbackSink: Send + Sync {
    fn on_ticket_ready(&self, correlation: CorrelationId, ticket: TicketHandle, outcome: TicketOutcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_lifecycle() {
        let mut ticket = CredentialTicket::new(
            TicketHandle::new(3),
            TicketKind::WebApi {
                service: "matchmaking".into(),
            },
        );
        assert_eq!(ticket.state, TicketState::Pending);
        assert!(ticket.bytes().is_empty());

        ticket.validate(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(ticket.state, TicketState::Valid);
        assert_eq!(ticket.to_hex(), "deadbeef");

        ticket.cancel();
        assert_eq!(ticket.state, TicketState::Canceled);
        assert!(ticket.bytes().is_empty());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let mut ticket = CredentialTicket::new(
            TicketHandle::new(1),
            TicketKind::AuthSession { remote: None },
        );
        ticket.validate(vec![0xab; 4]);
        let rendered = format!("{:?}", ticket);
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("len: 4"));
    }

    #[test]
    fn test_ticket_correlation_is_stable() {
        assert_eq!(CorrelationId::for_tickets(), CorrelationId::for_tickets());
    }
}
