use backend::config::AppConfig;
use backend::error::AppError;
use chrono::{NaiveDate, Utc};
use common::logger::init_tracing;
use scheduler::calendar::LocalTime;
use scheduler::{AllocateDates, AllocateOptions, ContextSettings, Registry, RetryConfig, ReserveInput, ReserveTarget, Scheduler};

/// Wires an `AppConfig` to a `Registry`, runs store migrations, and
/// demonstrates the engine end-to-end (allocate -> reserve -> approve)
/// before waiting on a shutdown signal. There is no market feed or
/// executor router here: this domain has no counterpart for either.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("starting reservations engine");

    let cfg = AppConfig::from_env();
    let timezone: chrono_tz::Tz = cfg
        .default_timezone
        .parse()
        .map_err(|_| AppError::Configuration(format!("invalid SCHEDULER_TIMEZONE: {}", cfg.default_timezone)))?;

    let registry = Registry::new();
    let context = registry.add_context(
        "default",
        ContextSettings {
            timezone,
            dsn: cfg.database_url.clone(),
            retry: RetryConfig {
                max_attempts: cfg.write_retry_max_attempts,
                base_backoff: cfg.write_retry_base_backoff,
                max_backoff: cfg.write_retry_max_backoff,
            },
        },
    );

    // Force the lazy connection + migration now rather than on first call.
    context
        .sessions()
        .await
        .map_err(|e| AppError::StoreConnection(e.to_string()))?;

    let scheduler = Scheduler::new(context.clone(), "demo-room");

    let today = Utc::now().date_naive();
    let tomorrow = today.succ_opt().unwrap_or(today);

    let allocations = scheduler
        .allocate(
            AllocateDates::WholeDays { start_date: today, end_date: tomorrow },
            AllocateOptions { quota: 1, raster: cfg.default_raster_minutes, ..AllocateOptions::default() },
        )
        .await?;
    tracing::info!(count = allocations.len(), "demo allocations created");

    if let Some(first) = allocations.first() {
        let reservations = scheduler
            .reserve(ReserveInput {
                email: "demo@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(first.start), LocalTime::Aware(first.end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await?;

        if let Some(reservation) = reservations.first() {
            let approved = scheduler.approve_reservation(reservation.token).await?;
            tracing::info!(count = approved.len(), "demo reservation approved");
        }
    }

    tracing::info!("reservations engine started; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    Ok(())
}
