//! Connection State Machine
//!
//! Lifecycle states reported by the transport provider and the table of
//! legal transitions between them. States only move forward; the single
//! exception is `Dead`, which any other state (terminal ones included) may
//! enter. A report of the current state is always a duplicate.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::ConnectionHandle;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No native connection exists
    None,
    /// Connection attempt started (outbound) or requested (inbound)
    Connecting,
    /// Remote host answered, a relay route is being negotiated
    FindingRoute,
    /// Connection established, data can flow both ways
    Connected,
    /// Remote end closed the connection
    ClosedByPeer,
    /// Local side detected a failure (timeout, route loss, rejection)
    ProblemDetectedLocally,
    /// Closed locally with linger, flushing remaining reliable data
    FinWaitLinger,
    /// Native resources released
    Dead,
}

impl ConnectionState {
    /// Every state, in lifecycle order
    pub const ALL: [ConnectionState; 8] = [
        ConnectionState::None,
        ConnectionState::Connecting,
        ConnectionState::FindingRoute,
        ConnectionState::Connected,
        ConnectionState::ClosedByPeer,
        ConnectionState::ProblemDetectedLocally,
        ConnectionState::FinWaitLinger,
        ConnectionState::Dead,
    ];

    /// Human readable state name
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::None => "None",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::FindingRoute => "FindingRoute",
            ConnectionState::Connected => "Connected",
            ConnectionState::ClosedByPeer => "ClosedByPeer",
            ConnectionState::ProblemDetectedLocally => "ProblemDetectedLocally",
            ConnectionState::FinWaitLinger => "FinWaitLinger",
            ConnectionState::Dead => "Dead",
        }
    }

    /// Whether the connection can no longer carry traffic
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedByPeer
                | ConnectionState::ProblemDetectedLocally
                | ConnectionState::FinWaitLinger
                | ConnectionState::Dead
        )
    }

    /// Whether a handle in this state may still be used for commands
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::FindingRoute | ConnectionState::Connected
        )
    }

    /// Check if state allows message sending
    pub fn can_send_messages(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, next) {
            (from, Dead) => from != Dead,
            (None, Connecting) => true,
            (Connecting, FindingRoute) | (Connecting, Connected) => true,
            (FindingRoute, Connected) => true,
            (Connecting | FindingRoute | Connected, ClosedByPeer) => true,
            (None | Connecting | FindingRoute | Connected, ProblemDetectedLocally) => true,
            (Connected, FinWaitLinger) => true,
            _ => false,
        }
    }

    /// Validate a move to `next`, returning the resulting transition
    pub fn transition(
        self,
        connection: ConnectionHandle,
        next: ConnectionState,
    ) -> Result<StateTransition, StateTransitionError> {
        if self == next {
            return Err(StateTransitionError::Duplicate {
                connection,
                state: next,
            });
        }
        if !self.can_transition_to(next) {
            return Err(StateTransitionError::InvalidTransition {
                connection,
                from_state: self,
                to_state: next,
            });
        }
        Ok(StateTransition {
            connection,
            from: self,
            to: next,
        })
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::None
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// A validated state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub connection: ConnectionHandle,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl StateTransition {
    /// Whether this transition ends the connection's usable life
    pub fn ends_connection(&self) -> bool {
        !self.from.is_terminal() && self.to.is_terminal()
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// The provider reported a move the lifecycle does not allow
    InvalidTransition {
        connection: ConnectionHandle,
        from_state: ConnectionState,
        to_state: ConnectionState,
    },
    /// The provider reported the state the connection is already in
    Duplicate {
        connection: ConnectionHandle,
        state: ConnectionState,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                connection,
                from_state,
                to_state,
            } => write!(
                f,
                "Invalid transition for connection {}: {} -> {}",
                connection, from_state, to_state
            ),
            StateTransitionError::Duplicate { connection, state } => {
                write!(f, "Connection {} already in state {}", connection, state)
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(7)
    }

    #[test]
    fn test_happy_path() {
        let path = [None, Connecting, FindingRoute, Connected, ClosedByPeer, Dead];
        for pair in path.windows(2) {
            let transition = pair[0].transition(handle(), pair[1]).unwrap();
            assert_eq!(transition.from, pair[0]);
            assert_eq!(transition.to, pair[1]);
        }
    }

    #[test]
    fn test_direct_connect_skips_route_finding() {
        assert!(Connecting.can_transition_to(Connected));
    }

    #[test]
    fn test_local_problem_from_any_live_state() {
        for state in [None, Connecting, FindingRoute, Connected] {
            assert!(state.can_transition_to(ProblemDetectedLocally), "{}", state);
        }
        assert!(!ClosedByPeer.can_transition_to(ProblemDetectedLocally));
    }

    #[test]
    fn test_dead_reachable_from_everything() {
        for state in ConnectionState::ALL.into_iter().filter(|state| *state != Dead) {
            assert!(state.can_transition_to(Dead), "{}", state);
        }
        assert!(!Dead.can_transition_to(Dead));
        let err = Dead.transition(handle(), Dead).unwrap_err();
        assert_eq!(
            err,
            StateTransitionError::Duplicate {
                connection: handle(),
                state: Dead,
            }
        );
    }

    #[test]
    fn test_no_backwards_moves() {
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Dead.can_transition_to(Connected));
        assert!(!ClosedByPeer.can_transition_to(Connected));
        assert!(!FindingRoute.can_transition_to(Connecting));
    }

    #[test]
    fn test_invalid_and_duplicate_errors() {
        let err = None.transition(handle(), Connected).unwrap_err();
        assert_eq!(
            err,
            StateTransitionError::InvalidTransition {
                connection: handle(),
                from_state: None,
                to_state: Connected,
            }
        );

        let err = Connected.transition(handle(), Connected).unwrap_err();
        assert!(matches!(err, StateTransitionError::Duplicate { .. }));
        assert!(err.to_string().contains("already in state Connected"));
    }

    #[test]
    fn test_liveness_classification() {
        assert!(Connecting.is_live());
        assert!(Connected.is_live());
        assert!(!None.is_live());
        for state in [ClosedByPeer, ProblemDetectedLocally, FinWaitLinger, Dead] {
            assert!(state.is_terminal());
            assert!(!state.is_live());
        }
        assert!(Connected.can_send_messages());
        assert!(!Connecting.can_send_messages());
    }

    #[test]
    fn test_ends_connection() {
        let transition = Connected.transition(handle(), ClosedByPeer).unwrap();
        assert!(transition.ends_connection());
        let transition = ClosedByPeer.transition(handle(), Dead).unwrap();
        assert!(!transition.ends_connection());
    }
}
