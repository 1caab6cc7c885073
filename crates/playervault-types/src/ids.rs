//! Type-safe identifier wrapper around [`Uuid`].
//!
//! Player identity comes from the host server (a 128-bit UUID assigned by
//! the game's account service). The wrapper keeps player keys from being
//! mixed up with other UUIDs at compile time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable unique identifier for a player record.
///
/// The identity key is immutable once a record has been created. It is the
/// primary key of the persisted table and the routing key for ordering
/// lanes in the task bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Create a new random identifier (UUID v4).
    ///
    /// Real player keys are handed to the plugin by the host; this exists
    /// for tests and tooling.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }

    /// Return the 16 big-endian bytes of the identifier.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for PlayerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<PlayerId> for Uuid {
    fn from(id: PlayerId) -> Self {
        id.0
    }
}
