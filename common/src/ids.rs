use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-opaque identifier for a resource (e.g. a room or a table).
///
/// The engine never interprets this value; it only groups allocations by it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Opaque group key tying several allocations so one reservation can
/// target any of them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupKey(pub Uuid);

impl GroupKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token shared across reservation lines created in a single cart.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReservationToken(pub Uuid);

impl ReservationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes the three row kinds stored in the schema. Source ORM entities
/// were made hashable by object identity for cross-layer caching; here entities
/// are compared by value on `(kind, id)` instead.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Allocation,
    ReservedSlot,
    Reservation,
}

/// Value-equal reference to a stored row, usable as a cache/set key without
/// pulling in the ORM-identity trick the source relied on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_equality_is_value_based() {
        let id = Uuid::new_v4();
        let a = EntityRef::new(EntityKind::Allocation, id);
        let b = EntityRef::new(EntityKind::Allocation, id);
        assert_eq!(a, b);

        let c = EntityRef::new(EntityKind::ReservedSlot, id);
        assert_ne!(a, c, "same id but different kind must not compare equal");
    }

    #[test]
    fn resource_id_from_str_round_trips() {
        let r: ResourceId = "room-42".into();
        assert_eq!(r.as_str(), "room-42");
        assert_eq!(r.to_string(), "room-42");
    }
}
