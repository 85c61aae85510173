use std::time::Duration;

/// Runtime configuration for the reservations engine binary, loaded from
/// the environment. Values here are the ones `main.rs` needs to wire a
/// `Registry`; scheduler-internal tuning (retry budget, backoff bounds)
/// lives alongside it so it's visible in one place rather than scattered
/// across crates as hardcoded constants.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string handed to `store::Db::connect`.
    pub database_url: String,

    /// Default IANA timezone new contexts resolve naive timestamps
    /// against when the caller doesn't supply one of their own.
    pub default_timezone: String,

    // =========================
    // Write-session retry tuning
    // =========================
    /// Maximum attempts for a serializable write transaction before giving
    /// up with `TransactionRollback`.
    ///
    /// Purpose:
    /// - bound worst-case latency under contention
    /// - avoid retrying forever against a genuinely conflicting workload
    pub write_retry_max_attempts: u32,

    /// Initial backoff between retry attempts.
    pub write_retry_base_backoff: Duration,

    /// Upper bound the exponential backoff is capped at.
    pub write_retry_max_backoff: Duration,

    // =========================
    // Session/runtime sizing
    // =========================
    /// Raster (minutes) used for allocations created by the bootstrap demo
    /// when the caller doesn't specify one explicitly.
    pub default_raster_minutes: i32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://reservations_dev.db".to_string());
        let default_timezone = std::env::var("SCHEDULER_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());

        Self {
            database_url,
            default_timezone,

            write_retry_max_attempts: env_u32("SCHEDULER_WRITE_RETRY_MAX_ATTEMPTS", 5),
            write_retry_base_backoff: Duration::from_millis(env_u64("SCHEDULER_WRITE_RETRY_BASE_BACKOFF_MS", 10)),
            write_retry_max_backoff: Duration::from_millis(env_u64("SCHEDULER_WRITE_RETRY_MAX_BACKOFF_MS", 160)),

            default_raster_minutes: env_u32("SCHEDULER_DEFAULT_RASTER_MINUTES", 5) as i32,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
