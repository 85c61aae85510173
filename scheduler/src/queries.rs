//! Read-only operations: availability reporting and search. Bound to a
//! context's read session, so these never observe a concurrent write
//! session's uncommitted state.

use chrono::{DateTime, Datelike, Utc, Weekday};
use common::SchedulerError;
use store::Allocation;
use uuid::Uuid;

use crate::calendar;
use crate::registry::Context;

pub struct Queries<'a> {
    context: &'a Context,
    resource: String,
}

impl<'a> Queries<'a> {
    pub fn new(context: &'a Context, resource: impl Into<String>) -> Self {
        Self { context, resource: resource.into() }
    }

    /// Percentage of capacity free on `allocation_id` over `[start, end)`,
    /// DST-normalized so a 23h/25h local day reads the same as a 24h one
    /// for identical usage.
    pub async fn availability(&self, allocation_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>, normalize: bool) -> Result<f64, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;

        let allocation = store::queries::get_allocation(pool, allocation_id)
            .await
            .map_err(SchedulerError::Store)?
            .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {allocation_id} not found") })?;

        let window_start = start.max(allocation.start);
        let window_end = end.min(allocation.end);
        if window_start >= window_end {
            return Ok(0.0);
        }

        let total_seconds = (window_end - window_start).num_seconds();
        let slots = store::queries::reserved_slots_for_family(pool, allocation.id).await.map_err(SchedulerError::Store)?;

        let occupied_seconds: i64 = slots
            .iter()
            .filter(|s| calendar::overlaps(s.start, s.end, window_start, window_end))
            .map(|s| (s.end.min(window_end) - s.start.max(window_start)).num_seconds())
            .sum();

        let day_hours = total_seconds as f64 / 3600.0;
        let free_seconds = (total_seconds - occupied_seconds).max(0);

        Ok(calendar::normalized_availability(free_seconds, total_seconds, day_hours, normalize))
    }

    /// Master allocations on the resource overlapping `[start, end)`,
    /// narrowed by weekday (compared in the allocation's own timezone),
    /// minimum free mirror-family spots, group membership, and occupancy.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_allocations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        weekdays: Option<&[Weekday]>,
        minspots: i32,
        available_only: bool,
        groups: Option<&[Uuid]>,
    ) -> Result<Vec<Allocation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;

        let candidates = store::queries::search_allocations(pool, &self.resource, start, end)
            .await
            .map_err(SchedulerError::Store)?;

        let mut out = Vec::new();
        for allocation in candidates {
            if let Some(weekdays) = weekdays {
                let tz: chrono_tz::Tz = allocation.timezone.parse().unwrap_or(chrono_tz::UTC);
                let local_weekday = allocation.start.with_timezone(&tz).weekday();
                if !weekdays.contains(&local_weekday) {
                    continue;
                }
            }

            if let Some(groups) = groups {
                match allocation.group {
                    Some(g) if groups.contains(&g) => {}
                    _ => continue,
                }
            }

            if minspots > 0 || available_only {
                let free = store::queries::free_capacity(pool, allocation.id).await.map_err(SchedulerError::Store)?;
                if free < minspots as i64 {
                    continue;
                }
                if available_only && free < 1 {
                    continue;
                }
            }

            out.push(allocation);
        }

        Ok(out)
    }

    /// Free capacity across `master`'s mirror family, without loading slot
    /// rows individually.
    pub async fn free_allocations_count(&self, master: Uuid) -> Result<i64, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;
        store::queries::free_capacity(pool, master).await.map_err(SchedulerError::Store)
    }

    pub async fn reservations_by_session(&self, session_id: Uuid) -> Result<Vec<store::Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;
        store::queries::reservations_by_session(pool, session_id).await.map_err(SchedulerError::Store)
    }

    pub async fn reservations_by_token(&self, token: Uuid) -> Result<Vec<store::Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;
        store::queries::reservations_by_token(pool, token).await.map_err(SchedulerError::Store)
    }

    pub async fn reservations_by_allocation(&self, allocation_id: Uuid) -> Result<Vec<store::Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;
        store::queries::reservations_by_allocation(pool, allocation_id).await.map_err(SchedulerError::Store)
    }

    pub async fn reservations_by_group(&self, group: Uuid) -> Result<Vec<store::Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let pool = sessions.read.pool()?;
        store::queries::reservations_by_group(pool, group).await.map_err(SchedulerError::Store)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::registry::{ContextSettings, Registry};
    use crate::scheduler::Scheduler;
    use crate::types::{AllocateDates, AllocateOptions, ReserveInput, ReserveTarget};

    async fn context() -> std::sync::Arc<Context> {
        sqlx::any::install_default_drivers();
        let registry = Registry::new();
        let context = registry.add_context(
            "test",
            ContextSettings { timezone: chrono_tz::UTC, dsn: "sqlite::memory:".to_string(), retry: crate::registry::RetryConfig::default() },
        );
        context.sessions().await.unwrap();
        context
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn availability_reflects_approved_slots() {
        let context = context().await;
        let scheduler = Scheduler::new(context.clone(), "room-1");

        let allocations = scheduler
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        let allocation = allocations[0].clone();

        let queries = Queries::new(&context, "room-1");
        let before = queries.availability(allocation.id, allocation.start, allocation.end, true).await.unwrap();
        assert!((before - 100.0).abs() < 0.01);

        let reservations = scheduler
            .reserve(ReserveInput {
                email: "irene@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(
                    crate::calendar::LocalTime::Aware(allocation.start),
                    crate::calendar::LocalTime::Aware(allocation.end),
                )]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        scheduler.approve_reservation(reservations[0].token).await.unwrap();

        let after = queries.availability(allocation.id, allocation.start, allocation.end, true).await.unwrap();
        assert!((after - 0.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn search_allocations_filters_by_minspots_and_availability() {
        let context = context().await;
        let scheduler = Scheduler::new(context.clone(), "room-2");

        let allocations = scheduler
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { quota: 2, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        let master = allocations.iter().find(|a| a.is_master()).unwrap().clone();

        let queries = Queries::new(&context, "room-2");
        let start = master.start - chrono::Duration::days(1);
        let end = master.end + chrono::Duration::days(1);

        let found = queries.search_allocations(start, end, None, 2, false, None).await.unwrap();
        assert_eq!(found.len(), 1);

        let too_many = queries.search_allocations(start, end, None, 3, false, None).await.unwrap();
        assert!(too_many.is_empty());

        for _ in 0..2 {
            let reservations = scheduler
                .reserve(ReserveInput {
                    email: "jack@example.com".to_string(),
                    target: ReserveTarget::Dates(vec![(
                        crate::calendar::LocalTime::Aware(master.start),
                        crate::calendar::LocalTime::Aware(master.end),
                    )]),
                    data: None,
                    session_id: None,
                    quota: 1,
                    single_token_per_session: false,
                })
                .await
                .unwrap();
            scheduler.approve_reservation(reservations[0].token).await.unwrap();
        }

        let none_left = queries.search_allocations(start, end, None, 0, true, None).await.unwrap();
        assert!(none_left.is_empty());
    }

    #[tokio::test]
    async fn free_allocations_count_tracks_family_occupancy() {
        let context = context().await;
        let scheduler = Scheduler::new(context.clone(), "room-3");

        let allocations = scheduler
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { quota: 2, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        let master = allocations.iter().find(|a| a.is_master()).unwrap().clone();

        let queries = Queries::new(&context, "room-3");
        assert_eq!(queries.free_allocations_count(master.id).await.unwrap(), 2);

        let reservations = scheduler
            .reserve(ReserveInput {
                email: "karen@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(
                    crate::calendar::LocalTime::Aware(master.start),
                    crate::calendar::LocalTime::Aware(master.end),
                )]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        scheduler.approve_reservation(reservations[0].token).await.unwrap();

        assert_eq!(queries.free_allocations_count(master.id).await.unwrap(), 1);
    }
}
