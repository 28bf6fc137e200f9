//! Transport provider abstraction
//!
//! The provider is the external platform service that actually owns sockets,
//! relay routes and authentication. This trait is the complete surface the
//! connection layer consumes from it. Every method must return immediately;
//! asynchronous outcomes are reported later through [`ProviderEvent`]s, either
//! from [`TransportProvider::poll_events`] or through the attached broker.
//!
//! [`ProviderEvent`]: crate::events::ProviderEvent

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::{BridgeReleased, BrokerSender};
use crate::errors::Result;
use crate::events::ProviderEvent;
use crate::info::{ConnectionInfo, DeliveryClass, Message, PopPing, RealTimeStatus};
use crate::relay::RelayAvailability;
use crate::ticket::{CorrelationId, CredentialCallbackSink, TicketKind};
use crate::types::{
    ConnectionHandle, Identity, ListenSocketHandle, PingLocation, PollGroupHandle, PopId,
    TicketHandle, VirtualPort,
};

// ----------------------------------------------------------------------------
// Result Codes
// ----------------------------------------------------------------------------

/// Status codes returned by provider operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    /// Bad argument (unknown handle, oversized payload)
    InvalidParam,
    /// Operation not legal in the object's current state
    InvalidState,
    /// The connection is gone on the native side
    NoConnection,
    /// A provider-side buffer or quota is full
    LimitExceeded,
    /// Operation was canceled
    Canceled,
    /// The service refused or failed without detail
    Fail,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Ok => "Ok",
            ResultCode::InvalidParam => "InvalidParam",
            ResultCode::InvalidState => "InvalidState",
            ResultCode::NoConnection => "NoConnection",
            ResultCode::LimitExceeded => "LimitExceeded",
            ResultCode::Canceled => "Canceled",
            ResultCode::Fail => "Fail",
        };
        f.write_str(name)
    }
}

/// Why the provider refused a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Outbound buffer would exceed the provider limit
    LimitExceeded { pending_bytes: usize, limit: usize },
    /// Any other provider status
    Rejected(ResultCode),
}

// ----------------------------------------------------------------------------
// Provider Trait
// ----------------------------------------------------------------------------

/// Primitive operations supplied by the platform transport service
///
/// One value stands for one native module instance and is owned by a single
/// context. Credential sinks registered through it belong to that instance
/// only, even though every context uses the same correlation id.
pub trait TransportProvider {
    // --- broker lifecycle ---

    /// Hand the provider the sender it posts callback-style events through
    fn attach_broker(&mut self, broker: BrokerSender);

    /// Drop the provider's broker sender; called by the bridge before it closes the broker
    fn detach_broker(&mut self) -> Result<()>;

    /// Module-level teardown; only callable once the bridge released its broker
    ///
    /// Implementations must refuse a token whose `broker_id()` differs from
    /// the broker last passed to `attach_broker`.
    fn teardown_module(&mut self, released: BridgeReleased) -> Result<()>;

    // --- identity and relay ---

    fn local_identity(&self) -> Option<Identity>;

    /// Start relay bootstrap; must be idempotent and return immediately
    fn bootstrap_relay(&mut self);

    fn relay_status(&mut self) -> RelayAvailability;

    /// Local locality token; `None` until topology data arrived
    fn local_ping_location(&self) -> Option<PingLocation>;

    /// Estimated round trip between two locations, from cached topology only
    fn estimate_ping(&self, from: &PingLocation, to: &PingLocation) -> Option<u32>;

    fn pop_list(&self) -> Vec<PopId>;

    fn ping_to_pop(&self, pop: PopId) -> Option<PopPing>;

    // --- listen sockets and connections ---

    fn create_listen_socket(&mut self, port: VirtualPort) -> Option<ListenSocketHandle>;

    fn close_listen_socket(&mut self, socket: ListenSocketHandle) -> bool;

    fn connect(&mut self, remote: &Identity, port: VirtualPort) -> Option<ConnectionHandle>;

    fn accept(&mut self, connection: ConnectionHandle) -> ResultCode;

    fn close_connection(
        &mut self,
        connection: ConnectionHandle,
        reason: i32,
        debug: &str,
        linger: bool,
    ) -> bool;

    /// Enqueue a payload, returning the provider's message number
    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        delivery: DeliveryClass,
    ) -> core::result::Result<u64, SendFailure>;

    fn flush(&mut self, connection: ConnectionHandle) -> ResultCode;

    fn receive_on_connection(&mut self, connection: ConnectionHandle, max: usize) -> Vec<Message>;

    fn query_info(&self, connection: ConnectionHandle) -> Option<ConnectionInfo>;

    fn query_real_time_status(&self, connection: ConnectionHandle) -> Option<RealTimeStatus>;

    fn set_connection_name(&mut self, connection: ConnectionHandle, name: &str) -> bool;

    // --- poll groups ---

    fn create_poll_group(&mut self) -> Option<PollGroupHandle>;

    fn destroy_poll_group(&mut self, group: PollGroupHandle) -> bool;

    fn set_connection_poll_group(
        &mut self,
        connection: ConnectionHandle,
        group: Option<PollGroupHandle>,
    ) -> bool;

    fn receive_on_poll_group(&mut self, group: PollGroupHandle, max: usize) -> Vec<Message>;

    // --- events ---

    /// Drain the provider's native event queue (pump-style reporting)
    fn poll_events(&mut self) -> Vec<ProviderEvent>;

    // --- credential tickets ---

    fn register_credential_sink(
        &mut self,
        correlation: CorrelationId,
        sink: Arc<dyn CredentialCallbackSink>,
    ) -> bool;

    fn unregister_credential_sink(&mut self, correlation: CorrelationId);

    fn request_ticket(&mut self, kind: &TicketKind, correlation: CorrelationId) -> Option<TicketHandle>;

    fn cancel_ticket(&mut self, ticket: TicketHandle) -> bool;
}
