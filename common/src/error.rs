use uuid::Uuid;

/// The full error taxonomy raised by the session and scheduler layers.
/// Kept in one enum (rather than per-crate enums) since callers need to
/// match across session-guard errors and scheduler-validation errors
/// uniformly.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("allocation overlaps an existing master allocation on resource {resource}: [{start}, {end})")]
    OverlappingAllocation {
        resource: String,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    #[error("operation would affect {count} confirmed reserved slot(s) on allocation {allocation_id}")]
    AffectedReservation { allocation_id: Uuid, count: i64 },

    #[error("operation would discard {count} pending reservation(s) the caller did not acknowledge")]
    AffectedPendingReservation { count: i64 },

    #[error("reservation already exists for this slot or cart line")]
    AlreadyReserved { reservation: Box<crate::reservation_info::ReservationInfo> },

    #[error("reservation span exceeds the maximum allowed duration")]
    ReservationTooLong,

    #[error("reservation [{start}, {end}) falls outside any covering allocation")]
    ReservationOutOfBounds {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    #[error("reservation parameters are invalid: {reason}")]
    ReservationParametersInvalid { reason: String },

    #[error("requested quota {requested} exceeds allocation's quota_limit {limit}")]
    QuotaOverLimit { requested: i32, limit: i32 },

    #[error("requested quota {requested} exceeds allocation's quota {quota}")]
    QuotaImpossible { requested: i32, quota: i32 },

    #[error("quota value {0} is invalid")]
    InvalidQuota(i32),

    #[error("no allocation on resource {resource} covers [{start}, {end})")]
    NotReservable {
        resource: String,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    #[error("read attempted against a read-only session while the write session holds uncommitted changes")]
    DirtyReadOnlySession,

    #[error("write attempted on a read-only session")]
    ModifiedReadOnlySession,

    #[error("serializable transaction retry budget exhausted after {attempts} attempt(s)")]
    TransactionRollback { attempts: u32 },

    #[error("allocation is invalid: {reason}")]
    InvalidAllocation { reason: String },

    #[error("email address is invalid: {0}")]
    InvalidEmailAddress(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
