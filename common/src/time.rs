use chrono::{DateTime, Utc};

/// Current instant, as a single indirection point so callers never reach
/// for `Utc::now()` directly in code under test.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
