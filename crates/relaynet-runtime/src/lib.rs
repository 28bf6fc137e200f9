//! relaynet Runtime
//!
//! Host-pumped runtime for the relaynet connection layer:
//! - `RelayContext`: owns the provider and exposes every host operation
//! - Callback bridge that dispatches native events on the pumping thread
//! - Handle registry, connection and poll group managers
//! - Relay bootstrap tracking and credential tickets
//! - Ordered shutdown
//!
//! Nothing here spawns threads or blocks. The host drives progress by
//! calling `pump()`.

pub mod bootstrap;
pub mod bridge;
pub mod builder;
pub mod context;
pub mod logging;
pub mod managers;
pub mod registry;
pub mod shutdown;

pub use bootstrap::{RelayBootstrap, BOOTSTRAP_TIMEOUT_REASON};
pub use bridge::{BridgeStats, CallbackBridge, EventSink, HandlerScope, SubscriptionId};
pub use builder::RelayContextBuilder;
pub use context::{ContextStats, RelayContext};
pub use logging::init_console_logging;
pub use managers::*;
pub use registry::{ConnectionEntry, HandleRegistry, ListenSocketEntry, PollGroupEntry};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};

// Re-export core types for convenience
pub use relaynet_core::{
    BridgeEvent, ConnectionHandle, ConnectionInfo, ConnectionState, CredentialTicket,
    DeliveryClass, HandleFault, Identity, IncomingConnectionRequest, ListenSocketHandle, Message,
    PingLocation, PollGroupHandle, PopId, RelayAvailability, RelayNetConfig, RelayNetError,
    RelayNetResult, StateChangeEvent, TicketHandle, TicketKind, TransportProvider, VirtualPort,
};
