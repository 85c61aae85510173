//! Read-only lookups against the pool directly, for the read session and
//! the availability/search/lookup operations in the queries component.
//! These never see uncommitted writes from a concurrent write session,
//! which is the point: the read session is explicitly not allowed to
//! observe or perform writes.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::model::{Allocation, ReservedSlot};
use crate::repository::{row_to_allocation, row_to_reservation, row_to_slot};
use crate::{Reservation, rfc3339};

pub async fn get_allocation(pool: &AnyPool, id: Uuid) -> anyhow::Result<Option<Allocation>> {
    let row = sqlx::query("SELECT * FROM allocations WHERE id = ?;")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
        .context("get_allocation failed")?;

    row.as_ref().map(row_to_allocation).transpose()
}

pub async fn mirrors_of(pool: &AnyPool, master_id: Uuid) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query("SELECT * FROM allocations WHERE mirror_of = ? AND id != ? ORDER BY id;")
        .bind(master_id.to_string())
        .bind(master_id.to_string())
        .fetch_all(pool)
        .await
        .context("mirrors_of failed")?;

    rows.iter().map(row_to_allocation).collect()
}

pub async fn reserved_slots_for_family(pool: &AnyPool, master_id: Uuid) -> anyhow::Result<Vec<ReservedSlot>> {
    let rows = sqlx::query(
        r#"
SELECT rs.* FROM reserved_slots rs
JOIN allocations a ON a.id = rs.allocation_id
WHERE a.id = ? OR a.mirror_of = ?;
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .fetch_all(pool)
    .await
    .context("reserved_slots_for_family failed")?;

    rows.iter().map(row_to_slot).collect()
}

/// Master allocations on `resource` whose bounds could intersect
/// `[min_start, max_end)`. Callers narrow further in memory (weekday masks,
/// group filters, free-spot thresholds) since those aren't representable
/// as a single portable SQL predicate across backends.
pub async fn search_allocations(
    pool: &AnyPool,
    resource: &str,
    min_start: DateTime<Utc>,
    max_end: DateTime<Utc>,
) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query(
        r#"
SELECT * FROM allocations
WHERE resource = ? AND mirror_of = id AND start_ts < ? AND end_ts > ?
ORDER BY start_ts;
"#,
    )
    .bind(resource)
    .bind(rfc3339::to_string(max_end))
    .bind(rfc3339::to_string(min_start))
    .fetch_all(pool)
    .await
    .context("search_allocations failed")?;

    rows.iter().map(row_to_allocation).collect()
}

/// Free mirror-family members (master plus mirrors) that currently hold no
/// reserved slot at all. Exact for whole-span (non partly-available)
/// allocations, where a mirror can hold at most one slot ever; callers
/// dealing with partly-available allocations must still check per-raster
/// occupancy themselves.
pub async fn free_capacity(pool: &AnyPool, master_id: Uuid) -> anyhow::Result<i64> {
    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS n
FROM allocations a
WHERE (a.id = ? OR a.mirror_of = ?)
  AND NOT EXISTS (SELECT 1 FROM reserved_slots rs WHERE rs.allocation_id = a.id);
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .fetch_one(pool)
    .await
    .context("free_capacity failed")?;

    Ok(row.get::<i64, _>("n"))
}

pub async fn reservations_by_session(pool: &AnyPool, session_id: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE session_id = ?;")
        .bind(session_id.to_string())
        .fetch_all(pool)
        .await
        .context("reservations_by_session failed")?;

    rows.iter().map(row_to_reservation).collect()
}

pub async fn reservations_by_token(pool: &AnyPool, token: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE token = ?;")
        .bind(token.to_string())
        .fetch_all(pool)
        .await
        .context("reservations_by_token failed")?;

    rows.iter().map(row_to_reservation).collect()
}

pub async fn reservations_by_allocation(pool: &AnyPool, allocation_id: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE target = ? AND target_type = 'allocation';")
        .bind(allocation_id.to_string())
        .fetch_all(pool)
        .await
        .context("reservations_by_allocation failed")?;

    rows.iter().map(row_to_reservation).collect()
}

pub async fn reservations_by_group(pool: &AnyPool, group: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE target = ? AND target_type = 'group';")
        .bind(group.to_string())
        .fetch_all(pool)
        .await
        .context("reservations_by_group failed")?;

    rows.iter().map(row_to_reservation).collect()
}
