//! Error types for the relaynet connection layer
//!
//! One error enum covers the whole surface. Per-connection failures
//! (`PeerClosed`, `LocalProblem`) are normally surfaced through state change
//! events; they appear here so callers can convert a terminal state into an
//! error when that reads better at the call site.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::provider::ResultCode;
use crate::relay::RelayAvailability;
use crate::state::{ConnectionState, StateTransitionError};
use crate::types::HandleKind;

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Why a handle was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFault {
    /// Never issued, or issued to a different context
    Unknown,
    /// Registered, but a terminal state has been observed
    Dead,
    /// Closed or destroyed by the host
    Retired,
}

impl fmt::Display for HandleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleFault::Unknown => write!(f, "unknown"),
            HandleFault::Dead => write!(f, "dead"),
            HandleFault::Retired => write!(f, "retired"),
        }
    }
}

/// Steps of the shutdown sequence, in the order they must run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShutdownStep {
    CancelTickets,
    DestroyPollGroups,
    CloseConnections,
    ReleaseBridge,
    TeardownProvider,
}

impl ShutdownStep {
    /// The full sequence
    pub const SEQUENCE: [ShutdownStep; 5] = [
        ShutdownStep::CancelTickets,
        ShutdownStep::DestroyPollGroups,
        ShutdownStep::CloseConnections,
        ShutdownStep::ReleaseBridge,
        ShutdownStep::TeardownProvider,
    ];

    /// Step that must follow this one
    pub fn next(&self) -> Option<ShutdownStep> {
        let index = Self::SEQUENCE.iter().position(|step| step == self)?;
        Self::SEQUENCE.get(index + 1).copied()
    }
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownStep::CancelTickets => "cancel tickets",
            ShutdownStep::DestroyPollGroups => "destroy poll groups",
            ShutdownStep::CloseConnections => "close connections",
            ShutdownStep::ReleaseBridge => "release bridge",
            ShutdownStep::TeardownProvider => "teardown provider",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Errors reported by the connection layer
#[derive(Debug, thiserror::Error)]
pub enum RelayNetError {
    #[error("Invalid {kind} handle {handle}: {fault}")]
    HandleInvalid {
        kind: HandleKind,
        handle: u64,
        fault: HandleFault,
    },

    #[error("Transport unavailable: relay network is {status}")]
    TransportUnavailable { status: RelayAvailability },

    #[error("Connection {handle} closed by peer")]
    PeerClosed { handle: u64 },

    #[error("Connection {handle} hit a local problem: {reason}")]
    LocalProblem { handle: u64, reason: String },

    #[error("Shutdown order violated: expected {expected:?}, attempted {attempted}")]
    ShutdownOrderViolation {
        expected: Option<ShutdownStep>,
        attempted: ShutdownStep,
    },

    #[error("Send buffer full: {pending_bytes} bytes pending (limit {limit})")]
    BackpressureExceeded { pending_bytes: usize, limit: usize },

    #[error("Connection {handle} is not a pending request (state {state})")]
    NotPendingRequest { handle: u64, state: ConnectionState },

    #[error("pump() called from inside an event handler")]
    ReentrantPump,

    #[error("Callback bridge is closed")]
    BridgeClosed,

    #[error("Ticket {handle} was canceled")]
    TicketCanceled { handle: u64 },

    #[error("Too many outstanding tickets (limit {limit})")]
    TicketLimitReached { limit: usize },

    #[error("Provider refused {operation}: {code}")]
    Provider {
        operation: &'static str,
        code: ResultCode,
    },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Event handler failed: {reason}")]
    HandlerFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl RelayNetError {
    /// Create a handle error
    pub fn invalid_handle(kind: HandleKind, handle: u64, fault: HandleFault) -> Self {
        RelayNetError::HandleInvalid {
            kind,
            handle,
            fault,
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        RelayNetError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a provider refusal error
    pub fn provider(operation: &'static str, code: ResultCode) -> Self {
        RelayNetError::Provider { operation, code }
    }

    /// Create a handler failure with a message
    pub fn handler_failed<T: Into<String>>(reason: T) -> Self {
        RelayNetError::HandlerFailed {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayNetError::TransportUnavailable { .. } | RelayNetError::BackpressureExceeded { .. }
        )
    }

    /// Whether this is a handle liveness failure
    pub fn is_handle_invalid(&self) -> bool {
        matches!(self, RelayNetError::HandleInvalid { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, RelayNetError>;
pub type RelayNetResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_sequence() {
        assert_eq!(
            ShutdownStep::CancelTickets.next(),
            Some(ShutdownStep::DestroyPollGroups)
        );
        assert_eq!(
            ShutdownStep::ReleaseBridge.next(),
            Some(ShutdownStep::TeardownProvider)
        );
        assert_eq!(ShutdownStep::TeardownProvider.next(), None);
        assert!(ShutdownStep::ReleaseBridge < ShutdownStep::TeardownProvider);
    }

    #[test]
    fn test_error_messages() {
        let err = RelayNetError::invalid_handle(HandleKind::Connection, 42, HandleFault::Dead);
        assert_eq!(err.to_string(), "Invalid connection handle 42: dead");
        assert!(err.is_handle_invalid());
        assert!(!err.is_retryable());

        let err = RelayNetError::TransportUnavailable {
            status: RelayAvailability::Attempting,
        };
        assert!(err.to_string().contains("Attempting"));
        assert!(err.is_retryable());
    }
}
