use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use common::ids::ResourceId;
use common::{ReservationInfo, SchedulerError};
use futures::future::BoxFuture;
use store::model::TargetType;
use store::repository::{self, NewAllocation, NewReservation, SlotInsertOutcome};
use store::{Allocation, Reservation, ReservationStatus, ReservedSlot};
use tracing::instrument;
use uuid::Uuid;

use crate::calendar::{self, LocalTime};
use crate::registry::Context;
use crate::types::{
    AllocateDates, AllocateOptions, ChangeAllocationAttrs, RemoveAllocationTarget, RemoveUnusedFilter, ReserveInput,
    ReserveTarget,
};

/// A single `reserve()` call batches its date lines into one token; this
/// caps how many lines one call may submit so a bulk request can't stall a
/// transaction indefinitely.
const MAX_RESERVATION_LINES: usize = 366;

/// Public API bound to one `(context, resource)` pair. Every mutating
/// method runs inside exactly one serializable transaction; read-only
/// methods (in `queries.rs`) use the context's read session instead.
pub struct Scheduler {
    context: Arc<Context>,
    resource: ResourceId,
}

impl Scheduler {
    pub fn new(context: Arc<Context>, resource: impl Into<ResourceId>) -> Self {
        Self { context, resource: resource.into() }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    fn timezone(&self) -> Tz {
        self.context.settings.timezone
    }

    fn normalize_dates(&self, dates: AllocateDates) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, SchedulerError> {
        let tz = self.timezone();
        match dates {
            AllocateDates::Ranges(pairs) => pairs
                .into_iter()
                .map(|(s, e)| Ok((calendar::to_utc(s, tz)?, calendar::to_utc(e, tz)?)))
                .collect(),
            AllocateDates::WholeDays { start_date, end_date } => {
                calendar::expand_daily_dates(start_date, end_date, NaiveTime::MIN, None, tz)
            }
        }
    }

    // ---------------------------------------------------------------
    // allocate
    // ---------------------------------------------------------------

    #[instrument(skip(self, dates, opts), fields(resource = %self.resource))]
    pub async fn allocate(&self, dates: AllocateDates, opts: AllocateOptions) -> Result<Vec<Allocation>, SchedulerError> {
        if opts.quota < 1 {
            return Err(SchedulerError::InvalidQuota(opts.quota));
        }

        let pairs = self.normalize_dates(dates)?;
        if pairs.is_empty() {
            return Err(SchedulerError::OverlappingAllocation {
                resource: self.resource.to_string(),
                start: common::time::now_utc(),
                end: common::time::now_utc(),
            });
        }
        for (start, end) in &pairs {
            if start >= end {
                return Err(SchedulerError::OverlappingAllocation { resource: self.resource.to_string(), start: *start, end: *end });
            }
        }

        let min_start = pairs.iter().map(|(s, _)| *s).min().unwrap();
        let max_end = pairs.iter().map(|(_, e)| *e).max().unwrap();
        let group_key = if opts.grouped || pairs.len() > 1 { Some(Uuid::new_v4()) } else { None };

        let resource = self.resource.to_string();
        let tz_name = self.timezone().to_string();
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        let created = sessions
            .write
            .run("allocate", {
                let resource = resource.clone();
                let tz_name = tz_name.clone();
                let pairs = pairs.clone();
                let opts = opts.clone();
                move |tx| -> BoxFuture<'_, Result<Vec<Allocation>, SchedulerError>> {
                    let resource = resource.clone();
                    let tz_name = tz_name.clone();
                    let pairs = pairs.clone();
                    let opts = opts.clone();
                    Box::pin(async move {
                        let existing = repository::fetch_masters_in_envelope(tx, &resource, min_start, max_end)
                            .await
                            .map_err(SchedulerError::Store)?;

                        let mut accepted: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::new();
                        for (start, end) in &pairs {
                            for m in &existing {
                                if calendar::overlaps(*start, *end, m.start, m.end) {
                                    return Err(SchedulerError::OverlappingAllocation { resource: resource.clone(), start: *start, end: *end });
                                }
                            }
                            for (as_, ae) in &accepted {
                                if calendar::overlaps(*start, *end, *as_, *ae) {
                                    return Err(SchedulerError::OverlappingAllocation { resource: resource.clone(), start: *start, end: *end });
                                }
                            }
                            accepted.push((*start, *end));
                        }

                        let mut created = Vec::new();
                        for (start, end) in pairs {
                            let master_id = Uuid::new_v4();
                            let base = NewAllocation {
                                id: master_id,
                                resource: resource.clone(),
                                mirror_of: master_id,
                                group: group_key,
                                timezone: tz_name.clone(),
                                start,
                                end,
                                quota: opts.quota,
                                quota_limit: opts.quota_limit,
                                partly_available: opts.partly_available,
                                approve_manually: opts.approve_manually,
                                waitinglist_spots: opts.waitinglist_spots,
                                raster: opts.raster,
                                data: opts.data.clone(),
                            };

                            let master = repository::insert_allocation(tx, &base).await.map_err(SchedulerError::Store)?;
                            created.push(master);

                            for _ in 1..opts.quota {
                                let mut mirror = base.clone();
                                mirror.id = Uuid::new_v4();
                                let mirror = repository::insert_allocation(tx, &mirror).await.map_err(SchedulerError::Store)?;
                                created.push(mirror);
                            }
                        }

                        Ok(created)
                    })
                }
            })
            .await?;

        self.context.hooks.on_allocations_added(&created);
        Ok(created)
    }

    // ---------------------------------------------------------------
    // change / move / remove allocation
    // ---------------------------------------------------------------

    #[instrument(skip(self, attrs), fields(resource = %self.resource, allocation_id = %id))]
    pub async fn change_allocation(&self, id: Uuid, attrs: ChangeAllocationAttrs) -> Result<Allocation, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        sessions
            .write
            .run("change_allocation", {
                let attrs = attrs.clone();
                move |tx| -> BoxFuture<'_, Result<Allocation, SchedulerError>> {
                    let attrs = attrs.clone();
                    Box::pin(async move {
                        let master = repository::get_allocation(tx, id)
                            .await
                            .map_err(SchedulerError::Store)?
                            .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {id} not found") })?;

                        if !master.is_master() {
                            return Err(SchedulerError::InvalidAllocation { reason: "change_allocation requires a master id".into() });
                        }

                        if let Some(new_quota) = attrs.quota {
                            apply_quota_change(tx, &master, new_quota).await?;
                        }

                        let quota_limit = attrs.quota_limit.unwrap_or(master.quota_limit);
                        let partly_available = attrs.partly_available.unwrap_or(master.partly_available);
                        let approve_manually = attrs.approve_manually.unwrap_or(master.approve_manually);
                        let waitinglist_spots = attrs.waitinglist_spots.unwrap_or(master.waitinglist_spots);
                        let raster = attrs.raster.unwrap_or(master.raster);
                        let data = attrs.data.clone().unwrap_or_else(|| master.data.clone());

                        repository::update_allocation_attrs(tx, id, quota_limit, partly_available, approve_manually, waitinglist_spots, raster, data)
                            .await
                            .map_err(SchedulerError::Store)?;

                        repository::get_allocation(tx, id)
                            .await
                            .map_err(SchedulerError::Store)?
                            .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {id} vanished mid-transaction") })
                    })
                }
            })
            .await
    }

    #[instrument(skip(self), fields(resource = %self.resource, allocation_id = %id))]
    pub async fn move_allocation(
        &self,
        id: Uuid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_quota: Option<i32>,
    ) -> Result<Allocation, SchedulerError> {
        if new_start >= new_end {
            return Err(SchedulerError::InvalidAllocation { reason: "start must precede end".into() });
        }

        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        sessions
            .write
            .run("move_allocation", move |tx| -> BoxFuture<'_, Result<Allocation, SchedulerError>> {
                Box::pin(async move {
                    let master = repository::get_allocation(tx, id)
                        .await
                        .map_err(SchedulerError::Store)?
                        .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {id} not found") })?;

                    if !master.is_master() {
                        return Err(SchedulerError::InvalidAllocation { reason: "move_allocation requires a master id".into() });
                    }

                    let slots = repository::reserved_slots_for_family(tx, id).await.map_err(SchedulerError::Store)?;

                    let mut affected = 0i64;
                    for s in &slots {
                        let contained = s.start >= new_start && s.end <= new_end;
                        let aligned = !master.partly_available
                            || (calendar::align_to_raster(s.start, master.raster, calendar::RasterDirection::Down) == s.start);
                        if !contained || !aligned {
                            affected += 1;
                        }
                    }
                    if affected > 0 {
                        return Err(SchedulerError::AffectedReservation { allocation_id: id, count: affected });
                    }

                    let occupied: HashSet<Uuid> = slots.iter().map(|s| s.allocation_id).collect();
                    if let Some(nq) = new_quota {
                        if (occupied.len() as i32) > nq {
                            return Err(SchedulerError::QuotaImpossible { requested: nq, quota: occupied.len() as i32 });
                        }
                        apply_quota_change(tx, &master, nq).await?;
                    }

                    repository::update_allocation_span(tx, id, new_start, new_end).await.map_err(SchedulerError::Store)?;

                    repository::get_allocation(tx, id)
                        .await
                        .map_err(SchedulerError::Store)?
                        .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {id} vanished mid-transaction") })
                })
            })
            .await
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    pub async fn remove_allocation(&self, target: RemoveAllocationTarget) -> Result<u64, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        sessions
            .write
            .run("remove_allocation", move |tx| -> BoxFuture<'_, Result<u64, SchedulerError>> {
                let target = target.clone();
                Box::pin(async move {
                    let masters = match target {
                        RemoveAllocationTarget::Id(id) => vec![repository::get_allocation(tx, id)
                            .await
                            .map_err(SchedulerError::Store)?
                            .ok_or_else(|| SchedulerError::InvalidAllocation { reason: format!("allocation {id} not found") })?],
                        RemoveAllocationTarget::Group(group) => repository::masters_by_group(tx, group).await.map_err(SchedulerError::Store)?,
                    };

                    for m in &masters {
                        let count = repository::count_reserved_slots_for_family(tx, m.id).await.map_err(SchedulerError::Store)?;
                        if count > 0 {
                            return Err(SchedulerError::AffectedReservation { allocation_id: m.id, count });
                        }

                        let pending = repository::count_pending_reservations_for_family(tx, m.id, m.group)
                            .await
                            .map_err(SchedulerError::Store)?;
                        if pending > 0 {
                            return Err(SchedulerError::AffectedPendingReservation { count: pending });
                        }
                    }

                    let mut total = 0u64;
                    for m in &masters {
                        total += repository::delete_allocation_family(tx, m.id).await.map_err(SchedulerError::Store)?;
                    }
                    Ok(total)
                })
            })
            .await
    }

    #[instrument(skip(self, filter), fields(resource = %self.resource))]
    pub async fn remove_unused_allocations(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: RemoveUnusedFilter,
    ) -> Result<u64, SchedulerError> {
        let resource = self.resource.to_string();
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        sessions
            .write
            .run("remove_unused_allocations", {
                let resource = resource.clone();
                let filter = filter.clone();
                move |tx| -> BoxFuture<'_, Result<u64, SchedulerError>> {
                    let resource = resource.clone();
                    let filter = filter.clone();
                    Box::pin(async move {
                        let candidates = repository::fetch_masters_in_envelope(tx, &resource, start, end).await.map_err(SchedulerError::Store)?;

                        let mut removed = 0u64;
                        for m in candidates {
                            if m.start < start || m.end > end {
                                continue;
                            }

                            let slot_count = repository::count_reserved_slots_for_family(tx, m.id).await.map_err(SchedulerError::Store)?;
                            if slot_count > 0 {
                                continue;
                            }

                            let pending = repository::count_pending_reservations_for_family(tx, m.id, m.group)
                                .await
                                .map_err(SchedulerError::Store)?;
                            if pending > 0 {
                                continue;
                            }

                            if let Some(group) = filter.group {
                                let in_group = m.group == Some(group);
                                if filter.exclude_groups {
                                    if in_group {
                                        continue;
                                    }
                                } else if !in_group {
                                    continue;
                                }
                            }

                            if let Some(weekdays) = &filter.weekdays {
                                let tz = Tz::from_str(&m.timezone).unwrap_or(chrono_tz::UTC);
                                let local_weekday = m.start.with_timezone(&tz).weekday();
                                if !weekdays.contains(&local_weekday) {
                                    continue;
                                }
                            }

                            removed += repository::delete_allocation_family(tx, m.id).await.map_err(SchedulerError::Store)?;
                        }

                        Ok(removed)
                    })
                }
            })
            .await
    }

    // ---------------------------------------------------------------
    // reserve
    // ---------------------------------------------------------------

    #[instrument(skip(self, input), fields(resource = %self.resource))]
    pub async fn reserve(&self, input: ReserveInput) -> Result<Vec<Reservation>, SchedulerError> {
        validate_email(&input.email)?;
        if input.quota < 1 {
            return Err(SchedulerError::InvalidQuota(input.quota));
        }
        if let ReserveTarget::Dates(pairs) = &input.target {
            if pairs.len() > MAX_RESERVATION_LINES {
                return Err(SchedulerError::ReservationTooLong);
            }
        }

        let resource = self.resource.to_string();
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        sessions
            .write
            .run("reserve", {
                let resource = resource.clone();
                let input = input.clone();
                move |tx| -> BoxFuture<'_, Result<Vec<Reservation>, SchedulerError>> {
                    let resource = resource.clone();
                    let input = input.clone();
                    Box::pin(async move { reserve_tx(tx, &resource, &input).await })
                }
            })
            .await
            .inspect(|created| self.context.hooks.on_reservations_made(created))
    }

    // ---------------------------------------------------------------
    // approve / deny / remove reservation
    // ---------------------------------------------------------------

    #[instrument(skip(self), fields(resource = %self.resource, token = %token))]
    pub async fn approve_reservation(&self, token: Uuid) -> Result<Vec<Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;
        let hooks = self.context.hooks.clone();

        let (approved, slots) = common::logger::warn_if_slow(
            "approve_reservation",
            std::time::Duration::from_millis(100),
            sessions
                .write
                .run("approve_reservation", move |tx| -> BoxFuture<'_, Result<(Vec<Reservation>, Vec<ReservedSlot>), SchedulerError>> {
                    Box::pin(async move { approve_tx(tx, token).await })
                }),
        )
        .await?;

        hooks.on_reserved_slots_reserved(&slots);
        hooks.on_reservations_approved(&approved);
        Ok(approved)
    }

    #[instrument(skip(self), fields(resource = %self.resource, token = %token))]
    pub async fn deny_reservation(&self, token: Uuid) -> Result<Vec<Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        let denied = sessions
            .write
            .run("deny_reservation", move |tx| -> BoxFuture<'_, Result<Vec<Reservation>, SchedulerError>> {
                Box::pin(async move {
                    let pending = repository::pending_reservations_by_token(tx, token).await.map_err(SchedulerError::Store)?;
                    repository::delete_pending_reservations_by_token(tx, token).await.map_err(SchedulerError::Store)?;
                    Ok(pending)
                })
            })
            .await?;

        self.context.hooks.on_reservations_denied(&denied);
        Ok(denied)
    }

    #[instrument(skip(self), fields(resource = %self.resource, token = %token))]
    pub async fn remove_reservation(&self, token: Uuid, id: Option<Uuid>) -> Result<Vec<Reservation>, SchedulerError> {
        let sessions = self.context.sessions().await.map_err(SchedulerError::Store)?;

        let (removed, slots) = sessions
            .write
            .run("remove_reservation", move |tx| -> BoxFuture<'_, Result<(Vec<Reservation>, Vec<ReservedSlot>), SchedulerError>> {
                Box::pin(async move {
                    let all = repository::reservations_by_token_tx(tx, token).await.map_err(SchedulerError::Store)?;
                    let targeted: Vec<Reservation> = match id {
                        Some(rid) => all.into_iter().filter(|r| r.id == rid).collect(),
                        None => all,
                    };
                    let slots = repository::slots_by_token(tx, token).await.map_err(SchedulerError::Store)?;
                    repository::delete_reservation_and_slots(tx, token, id).await.map_err(SchedulerError::Store)?;
                    Ok((targeted, slots))
                })
            })
            .await?;

        self.context.hooks.on_reserved_slots_released(&slots);
        self.context.hooks.on_reservations_removed(&removed);
        Ok(removed)
    }
}

async fn apply_quota_change(tx: &mut sqlx::Transaction<'static, sqlx::Any>, master: &Allocation, new_quota: i32) -> Result<(), SchedulerError> {
    if new_quota < 1 {
        return Err(SchedulerError::InvalidQuota(new_quota));
    }

    let mirrors = repository::mirrors_of(tx, master.id).await.map_err(SchedulerError::Store)?;
    let family_size = 1 + mirrors.len() as i32;

    if new_quota < family_size {
        let to_remove = family_size - new_quota;
        let slots = repository::reserved_slots_for_family(tx, master.id).await.map_err(SchedulerError::Store)?;
        let occupied: HashSet<Uuid> = slots.iter().map(|s| s.allocation_id).collect();

        let mut removable: Vec<&Allocation> = mirrors.iter().filter(|m| !occupied.contains(&m.id)).collect();
        if (removable.len() as i32) < to_remove {
            return Err(SchedulerError::QuotaImpossible { requested: new_quota, quota: family_size });
        }
        removable.sort_by_key(|m| m.id);
        for m in removable.into_iter().take(to_remove as usize) {
            repository::delete_single_allocation(tx, m.id).await.map_err(SchedulerError::Store)?;
        }
    } else if new_quota > family_size {
        for _ in 0..(new_quota - family_size) {
            let mirror = NewAllocation {
                id: Uuid::new_v4(),
                resource: master.resource.clone(),
                mirror_of: master.id,
                group: master.group,
                timezone: master.timezone.clone(),
                start: master.start,
                end: master.end,
                quota: new_quota,
                quota_limit: master.quota_limit,
                partly_available: master.partly_available,
                approve_manually: master.approve_manually,
                waitinglist_spots: master.waitinglist_spots,
                raster: master.raster,
                data: master.data.clone(),
            };
            repository::insert_allocation(tx, &mirror).await.map_err(SchedulerError::Store)?;
        }
    }

    repository::update_allocation_quota(tx, master.id, new_quota).await.map_err(SchedulerError::Store)?;
    Ok(())
}

async fn reserve_tx(tx: &mut sqlx::Transaction<'static, sqlx::Any>, resource: &str, input: &ReserveInput) -> Result<Vec<Reservation>, SchedulerError> {
    let lines: Vec<(Uuid, TargetType, DateTime<Utc>, DateTime<Utc>)> = match &input.target {
        ReserveTarget::Dates(pairs) => {
            let mut out = Vec::new();
            for (s, e) in pairs {
                let (start, end) = (as_utc(*s), as_utc(*e));
                let master = resolve_covering_allocation(tx, resource, start, end, input.quota).await?;
                out.push((master.id, TargetType::Allocation, start, end));
            }
            out
        }
        ReserveTarget::Group(group) => {
            let masters = repository::masters_by_group(tx, *group).await.map_err(SchedulerError::Store)?;
            let first = masters
                .first()
                .ok_or_else(|| SchedulerError::NotReservable { resource: resource.to_string(), start: common::time::now_utc(), end: common::time::now_utc() })?;
            vec![(*group, TargetType::Group, first.start, first.end)]
        }
    };

    let token = if input.single_token_per_session {
        match input.session_id {
            Some(session_id) => find_session_token(tx, resource, session_id).await?.unwrap_or_else(Uuid::new_v4),
            None => Uuid::new_v4(),
        }
    } else {
        Uuid::new_v4()
    };

    let mut created = Vec::new();
    for (target, target_type, start, end) in lines {
        if let Some(session_id) = input.session_id {
            if let Some(dup) = repository::find_cart_duplicate(tx, session_id, resource, target, start, end, input.quota)
                .await
                .map_err(SchedulerError::Store)?
            {
                return Err(SchedulerError::AlreadyReserved { reservation: Box::new(to_info(&dup)) });
            }
        }

        let new_reservation = NewReservation {
            id: Uuid::new_v4(),
            token,
            target,
            target_type,
            resource: resource.to_string(),
            start,
            end,
            quota: input.quota,
            status: ReservationStatus::Pending,
            email: input.email.clone(),
            session_id: input.session_id,
            data: input.data.clone(),
        };

        let reservation = repository::insert_reservation(tx, &new_reservation).await.map_err(SchedulerError::Store)?;
        created.push(reservation);
    }

    Ok(created)
}

async fn find_session_token(tx: &mut sqlx::Transaction<'static, sqlx::Any>, resource: &str, session_id: Uuid) -> Result<Option<Uuid>, SchedulerError> {
    let pending = sqlx::query("SELECT token FROM reservations WHERE session_id = ? AND resource = ? AND status = 'pending' LIMIT 1;")
        .bind(session_id.to_string())
        .bind(resource)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| SchedulerError::Store(anyhow::anyhow!(e)))?;

    use sqlx::Row;
    Ok(match pending {
        Some(row) => {
            let s: String = row.get("token");
            Some(Uuid::parse_str(&s).map_err(|e| SchedulerError::Store(anyhow::anyhow!(e)))?)
        }
        None => None,
    })
}

async fn resolve_covering_allocation(
    tx: &mut sqlx::Transaction<'static, sqlx::Any>,
    resource: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    quota: i32,
) -> Result<Allocation, SchedulerError> {
    let masters = repository::fetch_masters_in_envelope(tx, resource, start, end).await.map_err(SchedulerError::Store)?;

    let covering = match masters.iter().find(|m| m.start <= start && m.end >= end) {
        Some(m) => m.clone(),
        None => {
            let overlaps_any = masters.iter().any(|m| calendar::overlaps(start, end, m.start, m.end));
            if overlaps_any {
                return Err(SchedulerError::ReservationOutOfBounds { start, end });
            }
            return Err(SchedulerError::NotReservable { resource: resource.to_string(), start, end });
        }
    };

    if !covering.partly_available {
        if start != covering.start || end != covering.end {
            return Err(SchedulerError::ReservationParametersInvalid { reason: "allocation is not partly available; reservation must span the full window".into() });
        }
    } else {
        let aligned_start = calendar::align_to_raster(start, covering.raster, calendar::RasterDirection::Down) == start;
        let aligned_end = calendar::align_to_raster(end, covering.raster, calendar::RasterDirection::Down) == end;
        if !aligned_start || !aligned_end {
            return Err(SchedulerError::ReservationParametersInvalid { reason: format!("reservation bounds must align to {}-minute raster", covering.raster) });
        }
    }

    if covering.quota_limit != 0 && quota > covering.quota_limit {
        return Err(SchedulerError::QuotaOverLimit { requested: quota, limit: covering.quota_limit });
    }
    if quota > covering.quota {
        return Err(SchedulerError::QuotaImpossible { requested: quota, quota: covering.quota });
    }

    Ok(covering)
}

fn as_utc(t: LocalTime) -> DateTime<Utc> {
    match t {
        LocalTime::Aware(dt) => dt,
        LocalTime::Naive(naive) => naive.and_utc(),
    }
}

fn to_info(r: &Reservation) -> ReservationInfo {
    ReservationInfo {
        id: r.id,
        token: r.token,
        target: r.target,
        resource: r.resource.clone(),
        start: r.start,
        end: r.end,
        quota: r.quota,
        email: r.email.clone(),
    }
}

async fn approve_tx(tx: &mut sqlx::Transaction<'static, sqlx::Any>, token: Uuid) -> Result<(Vec<Reservation>, Vec<ReservedSlot>), SchedulerError> {
    let pending = repository::pending_reservations_by_token(tx, token).await.map_err(SchedulerError::Store)?;

    let mut approved = Vec::new();
    let mut all_slots = Vec::new();

    for r in pending {
        let master = match r.target_type {
            TargetType::Allocation => repository::get_allocation(tx, r.target)
                .await
                .map_err(SchedulerError::Store)?
                .ok_or_else(|| SchedulerError::NotReservable { resource: r.resource.clone(), start: r.start, end: r.end })?,
            TargetType::Group => {
                let masters = repository::masters_by_group(tx, r.target).await.map_err(SchedulerError::Store)?;
                let mut chosen = None;
                for m in masters {
                    let free = repository::family_members_free_at(tx, m.id, m.start).await.map_err(SchedulerError::Store)?;
                    if !free.is_empty() {
                        chosen = Some(m);
                        break;
                    }
                }
                chosen.ok_or_else(|| SchedulerError::AlreadyReserved { reservation: Box::new(to_info(&r)) })?
            }
        };

        // A group-targeted reservation's recorded start/end is only the
        // first group member's bounds (stamped at reserve time, before the
        // actual placement is known); once resolved to `master`, the real
        // span to fill is that master's own window, not the recorded one.
        let (span_start, span_end) = match r.target_type {
            TargetType::Allocation => (r.start, r.end),
            TargetType::Group => (master.start, master.end),
        };
        let ticks = atomic_ticks(&master, span_start, span_end);

        for (tick_start, tick_end) in ticks {
            let free = repository::family_members_free_at(tx, master.id, tick_start).await.map_err(SchedulerError::Store)?;
            let placement = free.first().ok_or_else(|| SchedulerError::AlreadyReserved { reservation: Box::new(to_info(&r)) })?;

            let slot = ReservedSlot {
                resource: r.resource.clone(),
                allocation_id: placement.id,
                start: tick_start,
                end: tick_end,
                reservation_token: token,
            };

            match repository::insert_reserved_slot(tx, &slot).await.map_err(SchedulerError::Store)? {
                SlotInsertOutcome::Inserted(s) => all_slots.push(s),
                SlotInsertOutcome::Conflict => return Err(SchedulerError::AlreadyReserved { reservation: Box::new(to_info(&r)) }),
            }
        }

        repository::mark_reservation_approved(tx, r.id).await.map_err(SchedulerError::Store)?;
        let mut r = r;
        r.status = ReservationStatus::Approved;
        approved.push(r);
    }

    Ok((approved, all_slots))
}

fn atomic_ticks(alloc: &Allocation, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    if !alloc.partly_available {
        return vec![(start, end)];
    }

    let step = Duration::minutes(alloc.raster as i64);
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        out.push((cursor, next));
        cursor = next;
    }
    out
}

fn validate_email(email: &str) -> Result<(), SchedulerError> {
    if email.len() < 3 || !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(SchedulerError::InvalidEmailAddress(email.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone};

    use super::*;
    use crate::registry::{ContextSettings, Registry};

    async fn scheduler(resource: &str) -> Scheduler {
        sqlx::any::install_default_drivers();
        let registry = Registry::new();
        let context = registry.add_context(
            "test",
            ContextSettings { timezone: chrono_tz::UTC, dsn: "sqlite::memory:".to_string(), retry: crate::registry::RetryConfig::default() },
        );
        context.sessions().await.unwrap();
        Scheduler::new(context, resource)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // S1: single whole-day reservation, quota 1.
    #[tokio::test]
    async fn whole_day_reservation_approves_end_to_end() {
        let s = scheduler("room-1").await;

        let allocations = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        assert_eq!(allocations.len(), 1);
        let allocation = &allocations[0];

        let reservations = s
            .reserve(ReserveInput {
                email: "alice@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].status, ReservationStatus::Pending);

        let approved = s.approve_reservation(reservations[0].token).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].status, ReservationStatus::Approved);
    }

    // S2: quota mirror. Three concurrent-capacity reservations succeed, a
    // fourth over the same window fails once the whole family is occupied.
    #[tokio::test]
    async fn quota_mirror_rejects_the_fourth_reservation() {
        let s = scheduler("room-2").await;

        let allocations = s
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { quota: 3, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        assert_eq!(allocations.len(), 3);
        let master = allocations.iter().find(|a| a.is_master()).unwrap().clone();

        let mut tokens = Vec::new();
        for _ in 0..4 {
            let reservations = s
                .reserve(ReserveInput {
                    email: "bob@example.com".to_string(),
                    target: ReserveTarget::Dates(vec![(LocalTime::Aware(master.start), LocalTime::Aware(master.end))]),
                    data: None,
                    session_id: None,
                    quota: 1,
                    single_token_per_session: false,
                })
                .await
                .unwrap();
            tokens.push(reservations[0].token);
        }

        for token in &tokens[..3] {
            let approved = s.approve_reservation(*token).await.unwrap();
            assert_eq!(approved.len(), 1);
        }

        let err = s.approve_reservation(tokens[3]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyReserved { .. }));
    }

    // S3: partly-available raster. A reservation misaligned to the raster
    // is rejected; an aligned one succeeds.
    #[tokio::test]
    async fn raster_alignment_is_enforced_when_partly_available() {
        let s = scheduler("room-3").await;

        let allocations = s
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { partly_available: true, raster: 30, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        let allocation = &allocations[0];

        let misaligned_start = allocation.start + Duration::minutes(5);
        let misaligned_end = misaligned_start + Duration::minutes(30);
        let err = s
            .reserve(ReserveInput {
                email: "carol@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(misaligned_start), LocalTime::Aware(misaligned_end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ReservationParametersInvalid { .. }));

        let aligned_start = allocation.start + Duration::minutes(60);
        let aligned_end = aligned_start + Duration::minutes(30);
        let reservations = s
            .reserve(ReserveInput {
                email: "carol@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(aligned_start), LocalTime::Aware(aligned_end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        assert_eq!(reservations.len(), 1);
    }

    // S5: group target. Two grouped windows on the same resource; sequential
    // reservations bind to each in turn, a third fails once both are full.
    #[tokio::test]
    async fn group_target_binds_to_each_member_then_rejects() {
        let s = scheduler("room-4").await;

        let morning_start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let morning_end = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let afternoon_start = Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap();
        let afternoon_end = Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap();

        let allocations = s
            .allocate(
                AllocateDates::Ranges(vec![
                    (LocalTime::Aware(morning_start), LocalTime::Aware(morning_end)),
                    (LocalTime::Aware(afternoon_start), LocalTime::Aware(afternoon_end)),
                ]),
                AllocateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(allocations.len(), 2);
        let group = allocations[0].group.expect("grouped allocations share a group key");

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let reservations = s
                .reserve(ReserveInput {
                    email: "dave@example.com".to_string(),
                    target: ReserveTarget::Group(group),
                    data: None,
                    session_id: None,
                    quota: 1,
                    single_token_per_session: false,
                })
                .await
                .unwrap();
            tokens.push(reservations[0].token);
        }

        let first = s.approve_reservation(tokens[0]).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = s.approve_reservation(tokens[1]).await.unwrap();
        assert_eq!(second.len(), 1);

        let err = s.approve_reservation(tokens[2]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyReserved { .. }));
    }

    #[tokio::test]
    async fn overlapping_allocations_on_same_resource_are_rejected() {
        let s = scheduler("room-5").await;

        s.allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();

        let err = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 2) }, AllocateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::OverlappingAllocation { .. }));
    }

    #[tokio::test]
    async fn invalid_email_is_rejected_before_any_write() {
        let s = scheduler("room-6").await;

        let allocations = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        let allocation = &allocations[0];

        let err = s
            .reserve(ReserveInput {
                email: "not-an-email".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidEmailAddress(_)));
    }

    #[tokio::test]
    async fn deny_reservation_frees_the_slot_for_reuse() {
        let s = scheduler("room-7").await;

        let allocations = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        let allocation = &allocations[0];

        let reservations = s
            .reserve(ReserveInput {
                email: "erin@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();

        let denied = s.deny_reservation(reservations[0].token).await.unwrap();
        assert_eq!(denied.len(), 1);

        // The slot was never approved, so the window is free again.
        let again = s
            .reserve(ReserveInput {
                email: "frank@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocation.start), LocalTime::Aware(allocation.end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn remove_allocation_refuses_when_slots_are_reserved() {
        let s = scheduler("room-8").await;

        let allocations = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        let allocation_id = allocations[0].id;

        let reservations = s
            .reserve(ReserveInput {
                email: "gina@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocations[0].start), LocalTime::Aware(allocations[0].end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap();
        s.approve_reservation(reservations[0].token).await.unwrap();

        let err = s.remove_allocation(RemoveAllocationTarget::Id(allocation_id)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AffectedReservation { .. }));
    }

    #[tokio::test]
    async fn remove_allocation_refuses_when_a_pending_reservation_is_unacknowledged() {
        let s = scheduler("room-13").await;

        let allocations = s
            .allocate(AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) }, AllocateOptions::default())
            .await
            .unwrap();
        let allocation_id = allocations[0].id;

        // Pending only, approved by nobody: no reserved slot exists yet, so
        // this must not be silently orphaned by a removal.
        s.reserve(ReserveInput {
            email: "harry@example.com".to_string(),
            target: ReserveTarget::Dates(vec![(LocalTime::Aware(allocations[0].start), LocalTime::Aware(allocations[0].end))]),
            data: None,
            session_id: None,
            quota: 1,
            single_token_per_session: false,
        })
        .await
        .unwrap();

        let err = s.remove_allocation(RemoveAllocationTarget::Id(allocation_id)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AffectedPendingReservation { .. }));
    }

    #[tokio::test]
    async fn change_allocation_grows_and_shrinks_quota() {
        let s = scheduler("room-9").await;

        let allocations = s
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { quota: 1, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        let master_id = allocations[0].id;

        let grown = s
            .change_allocation(master_id, ChangeAllocationAttrs { quota: Some(3), ..ChangeAllocationAttrs::default() })
            .await
            .unwrap();
        assert_eq!(grown.quota, 3);

        let shrunk = s
            .change_allocation(master_id, ChangeAllocationAttrs { quota: Some(1), ..ChangeAllocationAttrs::default() })
            .await
            .unwrap();
        assert_eq!(shrunk.quota, 1);
    }

    #[tokio::test]
    async fn change_allocation_shrink_fails_when_occupied_mirrors_exceed_target() {
        let s = scheduler("room-10").await;

        let allocations = s
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
                AllocateOptions { quota: 2, ..AllocateOptions::default() },
            )
            .await
            .unwrap();
        let master = allocations.iter().find(|a| a.is_master()).unwrap().clone();

        for _ in 0..2 {
            let reservations = s
                .reserve(ReserveInput {
                    email: "hank@example.com".to_string(),
                    target: ReserveTarget::Dates(vec![(LocalTime::Aware(master.start), LocalTime::Aware(master.end))]),
                    data: None,
                    session_id: None,
                    quota: 1,
                    single_token_per_session: false,
                })
                .await
                .unwrap();
            s.approve_reservation(reservations[0].token).await.unwrap();
        }

        let err = s
            .change_allocation(master.id, ChangeAllocationAttrs { quota: Some(1), ..ChangeAllocationAttrs::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QuotaImpossible { .. }));
    }

    #[tokio::test]
    async fn reserve_window_that_straddles_two_allocations_is_out_of_bounds() {
        let s = scheduler("room-11").await;

        s.allocate(
            AllocateDates::WholeDays { start_date: day(2024, 6, 1), end_date: day(2024, 6, 1) },
            AllocateOptions::default(),
        )
        .await
        .unwrap();
        let day_two = s
            .allocate(
                AllocateDates::WholeDays { start_date: day(2024, 6, 2), end_date: day(2024, 6, 2) },
                AllocateOptions::default(),
            )
            .await
            .unwrap();

        // Straddles the boundary between the two days' masters: overlaps
        // both but is fully contained by neither.
        let straddle_start = day_two[0].start - Duration::hours(1);
        let straddle_end = day_two[0].start + Duration::hours(1);

        let err = s
            .reserve(ReserveInput {
                email: "iris@example.com".to_string(),
                target: ReserveTarget::Dates(vec![(LocalTime::Aware(straddle_start), LocalTime::Aware(straddle_end))]),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ReservationOutOfBounds { .. }));
    }

    #[tokio::test]
    async fn reserve_call_with_too_many_lines_is_rejected_before_any_write() {
        let s = scheduler("room-12").await;

        let window = (Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(), Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
        let lines = vec![(LocalTime::Aware(window.0), LocalTime::Aware(window.1)); MAX_RESERVATION_LINES + 1];

        let err = s
            .reserve(ReserveInput {
                email: "jack@example.com".to_string(),
                target: ReserveTarget::Dates(lines),
                data: None,
                session_id: None,
                quota: 1,
                single_token_per_session: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ReservationTooLong));
    }
}
