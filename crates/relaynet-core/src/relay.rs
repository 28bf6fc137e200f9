//! Relay network availability

use core::fmt;
use serde::{Deserialize, Serialize};

/// Coarse availability of the relay network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayAvailability {
    /// Bootstrap has not reported anything yet
    Unknown,
    /// Relay configuration and pings are being fetched
    Attempting,
    /// Bootstrap gave up
    Failed(String),
    /// Relay network usable
    Current,
}

impl RelayAvailability {
    /// Whether bootstrap reached an end state
    pub fn is_settled(&self) -> bool {
        matches!(self, RelayAvailability::Current | RelayAvailability::Failed(_))
    }

    pub fn is_current(&self) -> bool {
        matches!(self, RelayAvailability::Current)
    }

    fn rank(&self) -> u8 {
        match self {
            RelayAvailability::Unknown => 0,
            RelayAvailability::Attempting => 1,
            RelayAvailability::Failed(_) | RelayAvailability::Current => 2,
        }
    }

    /// Availability only moves toward `Current` or a terminal `Failed`
    pub fn can_progress_to(&self, next: &RelayAvailability) -> bool {
        !self.is_settled() && next.rank() > self.rank()
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayAvailability::Unknown => "Unknown",
            RelayAvailability::Attempting => "Attempting",
            RelayAvailability::Failed(_) => "Failed",
            RelayAvailability::Current => "Current",
        }
    }
}

impl Default for RelayAvailability {
    fn default() -> Self {
        RelayAvailability::Unknown
    }
}

impl fmt::Display for RelayAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayAvailability::Failed(reason) => write!(f, "Failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}
