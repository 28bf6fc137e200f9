//! relaynet Core
//!
//! Types, provider interface and configuration for a connection-oriented
//! peer-to-peer transport layer running on top of a relay-routed platform
//! service. The runtime that drives these types lives in `relaynet-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod broker;
pub mod config;
pub mod errors;
pub mod events;
pub mod info;
pub mod provider;
pub mod relay;
pub mod state;
pub mod ticket;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use broker::{event_broker, BridgeReleased, BrokerId, BrokerReceiver, BrokerSender};
pub use config::{BridgeConfig, ConnectionConfig, RelayConfig, RelayNetConfig, TicketConfig};
pub use errors::{HandleFault, RelayNetError, RelayNetResult, Result, ShutdownStep};
pub use events::{
    BridgeEvent, IncomingConnectionRequest, ProviderEvent, StateChangeEvent, TicketResolved,
};
pub use info::{ConnectionInfo, DeliveryClass, Message, PopPing, RealTimeStatus, SendReceipt};
pub use provider::{ResultCode, SendFailure, TransportProvider};
pub use relay::RelayAvailability;
pub use state::{ConnectionState, StateTransition, StateTransitionError};
pub use ticket::{
    CorrelationId, CredentialCallbackSink, CredentialTicket, TicketKind, TicketOutcome,
    TicketState,
};
pub use types::{
    ConnectionHandle, HandleKind, Identity, ListenSocketHandle, PingLocation, PollGroupHandle,
    PopId, SystemTimeSource, TicketHandle, TimeSource, Timestamp, VirtualPort,
};
