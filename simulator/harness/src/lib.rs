//! relaynet Harness
//!
//! In-memory transport provider for exercising the relaynet runtime without
//! a platform service. Endpoints created from one [`SimulatedNetwork`] can
//! connect to each other; loss and reordering of unreliable traffic follow
//! a seeded generator so failures reproduce.

pub mod config;
pub mod network;
pub mod provider;
pub mod time;

pub use config::{EndpointConfig, RelayScript};
pub use network::{ProviderCall, SimulatedNetwork};
pub use provider::{SimulatedProvider, NO_LISTENER_REASON};
pub use time::ManualTimeSource;
