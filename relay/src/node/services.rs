use std::{fmt, ops};

use serde::{Deserialize, Serialize};

/// Services advertised by a node of the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Services(u64);

impl Services {
    /// `NONE` means no services are offered.
    pub const NONE: Services = Services(0);

    /// `MESSAGE_RELAY` is set by nodes that store and forward messages.
    pub const MESSAGE_RELAY: Services = Services(1 << 10);

    /// Returns [`Services`] with the other services added.
    #[must_use]
    pub fn with(self, other: Services) -> Services {
        Self(self.0 | other.0)
    }

    /// Check whether [`Services`] are included.
    pub fn has(self, flags: Services) -> bool {
        (self.0 | flags.0) == self.0
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::NONE
    }
}

impl ops::Deref for Services {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::LowerHex for Services {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for Services {
    fn from(other: u64) -> Self {
        Self(other)
    }
}
