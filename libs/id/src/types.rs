//! Typed ID definitions for everything that takes part in a negotiation.
//!
//! Each ID type has a unique prefix that identifies what it names.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Negotiation
// =============================================================================

define_id!(ApplicationId, "app");
define_id!(SystemId, "sys");
define_id!(LeaseId, "lease");

// =============================================================================
// Container
// =============================================================================

define_id!(ContainerId, "ctr");
define_id!(ProviderId, "prov");
define_id!(ElementId, "elem");

// =============================================================================
// Phase
// =============================================================================

/// Per-application negotiation epoch.
///
/// Incremented whenever membership shrinks or a fresh root resolve is issued.
/// A message tagged with a phase other than the receiver's current phase is
/// stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Phase(u64);

impl Phase {
    /// The phase every application starts in.
    pub const INITIAL: Self = Self(0);

    /// Creates a phase from its raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying counter value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following phase.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Phase {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl serde::Serialize for Phase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = u64::deserialize(deserializer)?;
        Ok(Self(value))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Sequence number of a lifecycle notification, monotonic per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
