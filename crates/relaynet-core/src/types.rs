//! Core types for the relaynet connection layer
//!
//! Opaque handles, identities and time primitives shared by the provider
//! interface and the runtime. Handles use newtype wrappers around the raw
//! 64-bit values handed out by the transport provider so that a connection
//! handle can never be passed where a poll group is expected.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::RelayNetError;

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw provider handle value
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw value, suitable for logging and cross-process correlation
            pub const fn raw(&self) -> u64 {
                self.0
            }

            /// Kind tag used in error reports
            pub const fn kind() -> HandleKind {
                $kind
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(handle: $name) -> u64 {
                handle.0
            }
        }
    };
}

define_handle!(
    /// Handle of a single peer-to-peer connection
    ConnectionHandle,
    HandleKind::Connection
);
define_handle!(
    /// Handle of a listen socket accepting inbound connections
    ListenSocketHandle,
    HandleKind::ListenSocket
);
define_handle!(
    /// Handle of a poll group
    PollGroupHandle,
    HandleKind::PollGroup
);
define_handle!(
    /// Handle of a credential ticket issued by the provider
    TicketHandle,
    HandleKind::Ticket
);

/// Which registry a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Connection,
    ListenSocket,
    PollGroup,
    Ticket,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Connection => write!(f, "connection"),
            HandleKind::ListenSocket => write!(f, "listen socket"),
            HandleKind::PollGroup => write!(f, "poll group"),
            HandleKind::Ticket => write!(f, "ticket"),
        }
    }
}

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Identity of a peer as understood by the platform service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create a new identity from its string form
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Borrow the identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = RelayNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RelayNetError::config_error("identity cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Virtual port selecting a listen socket on the remote identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualPort(u32);

impl VirtualPort {
    pub const fn new(port: u32) -> Self {
        Self(port)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for VirtualPort {
    fn from(port: u32) -> Self {
        Self(port)
    }
}

impl fmt::Display for VirtualPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Relay Locality
// ----------------------------------------------------------------------------

/// Relay point-of-presence identifier
///
/// Packs up to four ASCII characters into a `u32`, most significant byte
/// first, so `"fra"` and `PopId::from_code("fra")` render identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PopId(u32);

impl PopId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Pack a short location code; returns `None` for empty, non-ASCII or
    /// codes longer than four characters
    pub fn from_code(code: &str) -> Option<Self> {
        let bytes = code.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !code.is_ascii() {
            return None;
        }
        let packed = bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Some(Self(packed))
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Render the packed code back to text
    pub fn code(&self) -> String {
        self.0
            .to_be_bytes()
            .iter()
            .filter(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect()
    }
}

impl fmt::Display for PopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Opaque locality token produced by the relay network
///
/// The textual form is a comma separated list of `pop=ms` entries, e.g.
/// `"fra=12,ams=20"`. Only the provider interprets it; the runtime passes it
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PingLocation(String);

impl PingLocation {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the token into `(pop, milliseconds)` pairs, skipping malformed entries
    pub fn entries(&self) -> Vec<(PopId, u32)> {
        self.0
            .split(',')
            .filter_map(|entry| {
                let (code, ms) = entry.trim().split_once('=')?;
                let pop = PopId::from_code(code.trim())?;
                let ms = ms.trim().parse::<u32>().ok()?;
                Some((pop, ms))
            })
            .collect()
    }
}

impl fmt::Display for PingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for timeouts and audit entries
///
/// Injected so tests can drive bootstrap timeouts without sleeping.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall clock implementation of [`TimeSource`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_serialize_as_plain_integers() {
        let handle = ConnectionHandle::new(42);
        assert_eq!(serde_json::to_string(&handle).unwrap(), "42");
        let back: ConnectionHandle = serde_json::from_str("42").unwrap();
        assert_eq!(back, handle);
        assert_eq!(handle.to_string(), "42");
        assert_eq!(ConnectionHandle::kind(), HandleKind::Connection);
    }

    #[test]
    fn test_pop_id_codes() {
        let pop = PopId::from_code("fra").unwrap();
        assert_eq!(pop.code(), "fra");
        assert_eq!(pop.to_string(), "fra");
        assert_eq!(pop.raw(), 0x0066_7261);

        assert!(PopId::from_code("").is_none());
        assert!(PopId::from_code("toolong").is_none());
    }

    #[test]
    fn test_ping_location_entries() {
        let location = PingLocation::new("fra=12, ams=20,bogus,=4,iad=x");
        let entries = location.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], (PopId::from_code("fra").unwrap(), 12));
        assert_eq!(entries[1], (PopId::from_code("ams").unwrap(), 20));
    }

    #[test]
    fn test_identity_parse() {
        let identity: Identity = " peerX ".parse().unwrap();
        assert_eq!(identity.as_str(), "peerX");
        assert!("   ".parse::<Identity>().is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let start = Timestamp::new(1_000);
        let later = start + 500;
        assert_eq!(later - start, 500);
        assert_eq!(start - later, 0);
        assert_eq!(later.duration_since(start).as_millis(), 500);
    }
}
