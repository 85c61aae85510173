use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Minimal snapshot of a reservation attached to errors that arise while
/// acting on one (`AlreadyReserved`, cart duplicates). Lives here rather
/// than in `store` so `common::error` doesn't need a dependency on the
/// persistence crate.
#[derive(Clone, Debug, PartialEq)]
pub struct ReservationInfo {
    pub id: Uuid,
    pub token: Uuid,
    pub target: Uuid,
    pub resource: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub quota: i32,
    pub email: String,
}
