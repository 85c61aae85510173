use chrono::{NaiveDate, Utc};
use scheduler::calendar::LocalTime;
use scheduler::{AllocateDates, AllocateOptions, ContextSettings, Registry, RetryConfig, ReserveInput, ReserveTarget, Scheduler};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn scheduler_for(resource: &str) -> Scheduler {
    sqlx::any::install_default_drivers();
    let registry = Registry::new();
    let context = registry.add_context(
        "default",
        ContextSettings { timezone: chrono_tz::UTC, dsn: "sqlite::memory:".to_string(), retry: RetryConfig::default() },
    );
    context.sessions().await.expect("connect and migrate");
    Scheduler::new(context, resource)
}

#[tokio::test]
async fn allocate_reserve_approve_round_trip() {
    let scheduler = scheduler_for("demo-room").await;

    let today = day(2026, 1, 12);
    let tomorrow = today.succ_opt().unwrap();

    let allocations = scheduler
        .allocate(AllocateDates::WholeDays { start_date: today, end_date: tomorrow }, AllocateOptions { quota: 1, raster: 5, ..AllocateOptions::default() })
        .await
        .expect("allocate");
    assert_eq!(allocations.len(), 2);

    let first = allocations.first().expect("at least one allocation");

    let reservations = scheduler
        .reserve(ReserveInput {
            email: "demo@example.com".to_string(),
            target: ReserveTarget::Dates(vec![(LocalTime::Aware(first.start), LocalTime::Aware(first.end))]),
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        })
        .await
        .expect("reserve");
    assert_eq!(reservations.len(), 1);

    let approved = scheduler.approve_reservation(reservations[0].token).await.expect("approve");
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].status, store::ReservationStatus::Approved);
}

#[tokio::test]
async fn second_reservation_on_an_already_approved_window_is_rejected() {
    let scheduler = scheduler_for("demo-room-2").await;
    let today = Utc::now().date_naive();

    let allocations = scheduler
        .allocate(AllocateDates::WholeDays { start_date: today, end_date: today }, AllocateOptions::default())
        .await
        .expect("allocate");
    let allocation = &allocations[0];

    let first = scheduler
        .reserve(ReserveInput {
            email: "one@example.com".to_string(),
            target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        })
        .await
        .expect("first reserve");
    scheduler.approve_reservation(first[0].token).await.expect("first approve");

    let second = scheduler
        .reserve(ReserveInput {
            email: "two@example.com".to_string(),
            target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        })
        .await
        .expect("second reserve is allowed to queue as pending");

    let err = scheduler.approve_reservation(second[0].token).await.unwrap_err();
    assert!(matches!(err, common::SchedulerError::AlreadyReserved { .. }));
}
