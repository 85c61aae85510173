use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

/// A window of time on a resource within which reservations may be created.
///
/// `mirror_of == id` marks a master row; `quota > 1` masters additionally own
/// `quota - 1` mirror rows sharing temporal bounds so each claimed unit of
/// quota gets a distinct `ReservedSlot` primary key.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    pub id: Uuid,
    pub resource: String,
    pub mirror_of: Uuid,
    pub group: Option<Uuid>,
    pub timezone: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub quota: i32,
    pub quota_limit: i32,
    pub partly_available: bool,
    pub approve_manually: bool,
    pub waitinglist_spots: Option<i32>,
    pub raster: i32,
    pub data: Option<Json>,
}

impl Allocation {
    pub fn is_master(&self) -> bool {
        self.mirror_of == self.id
    }
}

/// A confirmed atomic unit of consumed capacity. Primary key
/// `(resource, allocation_id, start)` is the race-prevention primitive.
#[derive(Clone, Debug, PartialEq)]
pub struct ReservedSlot {
    pub resource: String,
    pub allocation_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reservation_token: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Denied,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "approved" => Some(ReservationStatus::Approved),
            "denied" => Some(ReservationStatus::Denied),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetType {
    Allocation,
    Group,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Allocation => "allocation",
            TargetType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allocation" => Some(TargetType::Allocation),
            "group" => Some(TargetType::Group),
            _ => None,
        }
    }
}

/// A caller's claim against one or more allocations, pending or approved.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub token: Uuid,
    pub target: Uuid,
    pub target_type: TargetType,
    pub resource: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub quota: i32,
    pub status: ReservationStatus,
    pub email: String,
    pub session_id: Option<Uuid>,
    pub data: Option<Json>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}
