//! Stateful managers for the relaynet runtime
//!
//! Each manager owns one concern and operates on the shared handle registry
//! and the transport provider passed in by the context.

pub mod connection;
pub mod poll_group;
pub mod tickets;

pub use connection::{
    AuditEntry, ConnectionManager, ConnectionStats, StateDistribution, StatusEvents,
    TransitionCause,
};
pub use poll_group::{GroupMembers, PollGroupManager, PollGroupStats};
pub use tickets::{BrokerCredentialSink, CredentialTickets, TicketFuture, TicketStats};
