//! Property-based tests for the connection state machine
//!
//! Feeds arbitrary provider reports through `ConnectionState::transition`
//! and checks that the accepted ones never leave a terminal state (other
//! than into `Dead`), never leave `Dead` and never move a connection
//! backwards.

use proptest::prelude::*;
use relaynet_core::{ConnectionHandle, ConnectionState, StateTransitionError};

fn arb_state() -> impl Strategy<Value = ConnectionState> {
    prop::sample::select(ConnectionState::ALL.to_vec())
}

/// Position in the lifecycle; terminal states share a rank below `Dead`
fn rank(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::None => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::FindingRoute => 2,
        ConnectionState::Connected => 3,
        ConnectionState::ClosedByPeer
        | ConnectionState::ProblemDetectedLocally
        | ConnectionState::FinWaitLinger => 4,
        ConnectionState::Dead => 5,
    }
}

proptest! {
    /// Property: accepted reports only move forward through the lifecycle
    #[test]
    fn accepted_transitions_move_forward(reports in prop::collection::vec(arb_state(), 1..64)) {
        let handle = ConnectionHandle::new(1);
        let mut current = ConnectionState::None;

        for next in reports {
            match current.transition(handle, next) {
                Ok(transition) => {
                    prop_assert_eq!(transition.from, current);
                    prop_assert_ne!(current, ConnectionState::Dead);
                    prop_assert!(rank(next) > rank(current));
                    if current.is_terminal() {
                        prop_assert_eq!(next, ConnectionState::Dead);
                    }
                    current = next;
                }
                Err(StateTransitionError::Duplicate { state, .. }) => {
                    prop_assert_eq!(state, current);
                    prop_assert_eq!(next, current);
                }
                Err(StateTransitionError::InvalidTransition { from_state, to_state, .. }) => {
                    prop_assert_eq!(from_state, current);
                    prop_assert!(!current.can_transition_to(to_state));
                }
            }
        }
    }

    /// Property: a walk ends the connection once if it finishes terminal, never otherwise
    #[test]
    fn connection_ends_at_most_once(reports in prop::collection::vec(arb_state(), 1..64)) {
        let handle = ConnectionHandle::new(1);
        let mut current = ConnectionState::None;
        let mut endings = 0;

        for next in reports {
            if let Ok(transition) = current.transition(handle, next) {
                if transition.ends_connection() {
                    endings += 1;
                }
                current = next;
            }
        }
        prop_assert_eq!(endings, usize::from(current.is_terminal()));
    }
}
