//! Write-path persistence. Every function here takes an already-open
//! transaction: the session layer owns transaction lifetime (begin / retry /
//! commit), this module only issues statements against it so that nested
//! scheduler calls collapse into the caller's single serializable transaction.

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::any::AnyRow;
use sqlx::{Any, Row, Transaction};
use uuid::Uuid;

use crate::model::{Allocation, ReservationStatus, ReservedSlot, TargetType};
use crate::{Reservation, rfc3339};

type Tx<'a> = Transaction<'a, Any>;

/// Fields needed to insert one allocation row (master or mirror).
#[derive(Clone)]
pub struct NewAllocation {
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

pub async fn insert_allocation(tx: &mut Tx<'_>, a: &NewAllocation) -> anyhow::Result<Allocation> {
    sqlx::query(
        r#"
INSERT INTO allocations
  (id, resource, mirror_of, group_key, timezone, start_ts, end_ts, quota, quota_limit,
   partly_available, approve_manually, waitinglist_spots, raster, data)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
    )
    .bind(a.id.to_string())
    .bind(&a.resource)
    .bind(a.mirror_of.to_string())
    .bind(a.group.map(|g| g.to_string()))
    .bind(&a.timezone)
    .bind(rfc3339::to_string(a.start))
    .bind(rfc3339::to_string(a.end))
    .bind(a.quota)
    .bind(a.quota_limit)
    .bind(a.partly_available as i32)
    .bind(a.approve_manually as i32)
    .bind(a.waitinglist_spots)
    .bind(a.raster)
    .bind(a.data.as_ref().map(|d| d.to_string()))
    .execute(&mut **tx)
    .await
    .context("insert_allocation failed")?;

    Ok(Allocation {
        id: a.id,
        resource: a.resource.clone(),
        mirror_of: a.mirror_of,
        group: a.group,
        timezone: a.timezone.clone(),
        start: a.start,
        end: a.end,
        quota: a.quota,
        quota_limit: a.quota_limit,
        partly_available: a.partly_available,
        approve_manually: a.approve_manually,
        waitinglist_spots: a.waitinglist_spots,
        raster: a.raster,
        data: a.data.clone(),
    })
}

/// Fetches master allocations on `resource` whose span could possibly
/// overlap something in `[min_start, max_end)`. The caller still has to
/// check exact overlap in memory; this only bounds the candidate set with
/// a single query (no per-pair round trip).
pub async fn fetch_masters_in_envelope(
    tx: &mut Tx<'_>,
    resource: &str,
    min_start: DateTime<Utc>,
    max_end: DateTime<Utc>,
) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query(
        r#"
SELECT * FROM allocations
WHERE resource = ? AND mirror_of = id AND start_ts < ? AND end_ts > ?;
"#,
    )
    .bind(resource)
    .bind(rfc3339::to_string(max_end))
    .bind(rfc3339::to_string(min_start))
    .fetch_all(&mut **tx)
    .await
    .context("fetch_masters_in_envelope failed")?;

    rows.iter().map(row_to_allocation).collect()
}

pub async fn get_allocation(tx: &mut Tx<'_>, id: Uuid) -> anyhow::Result<Option<Allocation>> {
    let row = sqlx::query("SELECT * FROM allocations WHERE id = ?;")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .context("get_allocation failed")?;

    row.as_ref().map(row_to_allocation).transpose()
}

pub async fn mirrors_of(tx: &mut Tx<'_>, master_id: Uuid) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query("SELECT * FROM allocations WHERE mirror_of = ? AND id != ? ORDER BY id;")
        .bind(master_id.to_string())
        .bind(master_id.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("mirrors_of failed")?;

    rows.iter().map(row_to_allocation).collect()
}

/// Updates the attributes `change_allocation` is allowed to touch, across
/// the whole mirror family (master + mirrors share these). Temporal bounds
/// go through `update_allocation_span` instead.
#[allow(clippy::too_many_arguments)]
pub async fn update_allocation_attrs(
    tx: &mut Tx<'_>,
    master_id: Uuid,
    quota_limit: i32,
    partly_available: bool,
    approve_manually: bool,
    waitinglist_spots: Option<i32>,
    raster: i32,
    data: Option<Json>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
UPDATE allocations
SET quota_limit = ?, partly_available = ?, approve_manually = ?,
    waitinglist_spots = ?, raster = ?, data = ?
WHERE id = ? OR mirror_of = ?;
"#,
    )
    .bind(quota_limit)
    .bind(partly_available as i32)
    .bind(approve_manually as i32)
    .bind(waitinglist_spots)
    .bind(raster)
    .bind(data.as_ref().map(|d| d.to_string()))
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .execute(&mut **tx)
    .await
    .context("update_allocation_attrs failed")?;

    Ok(())
}

/// Sets `quota` across the whole mirror family after mirror rows have
/// been added or removed to match.
pub async fn update_allocation_quota(tx: &mut Tx<'_>, master_id: Uuid, quota: i32) -> anyhow::Result<()> {
    sqlx::query("UPDATE allocations SET quota = ? WHERE id = ? OR mirror_of = ?;")
        .bind(quota)
        .bind(master_id.to_string())
        .bind(master_id.to_string())
        .execute(&mut **tx)
        .await
        .context("update_allocation_quota failed")?;

    Ok(())
}

/// Deletes one allocation row (a single mirror, never the master — callers
/// shrinking quota only ever remove mirrors).
pub async fn delete_single_allocation(tx: &mut Tx<'_>, id: Uuid) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM allocations WHERE id = ?;")
        .bind(id.to_string())
        .execute(&mut **tx)
        .await
        .context("delete_single_allocation failed")?;

    Ok(())
}

pub async fn update_allocation_span(
    tx: &mut Tx<'_>,
    id: Uuid,
    new_start: DateTime<Utc>,
    new_end: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE allocations SET start_ts = ?, end_ts = ? WHERE id = ? OR mirror_of = ?;")
        .bind(rfc3339::to_string(new_start))
        .bind(rfc3339::to_string(new_end))
        .bind(id.to_string())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await
        .context("update_allocation_span failed")?;

    Ok(())
}

/// Deletes a master and all its mirrors. Returns the number of allocation
/// rows removed.
pub async fn delete_allocation_family(tx: &mut Tx<'_>, master_id: Uuid) -> anyhow::Result<u64> {
    let res = sqlx::query("DELETE FROM allocations WHERE id = ? OR mirror_of = ?;")
        .bind(master_id.to_string())
        .bind(master_id.to_string())
        .execute(&mut **tx)
        .await
        .context("delete_allocation_family failed")?;

    Ok(res.rows_affected())
}

pub async fn count_reserved_slots_for_family(tx: &mut Tx<'_>, master_id: Uuid) -> anyhow::Result<i64> {
    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS n
FROM reserved_slots rs
JOIN allocations a ON a.id = rs.allocation_id
WHERE a.id = ? OR a.mirror_of = ?;
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .fetch_one(&mut **tx)
    .await
    .context("count_reserved_slots_for_family failed")?;

    Ok(row.get::<i64, _>("n"))
}

/// Counts pending reservations that target any member of `master_id`'s
/// mirror family directly, or its group (if it has one). A pending
/// reservation holds no `ReservedSlot`, so `count_reserved_slots_for_family`
/// alone misses it; removal paths check both before deleting.
pub async fn count_pending_reservations_for_family(tx: &mut Tx<'_>, master_id: Uuid, group: Option<Uuid>) -> anyhow::Result<i64> {
    let row = sqlx::query(
        r#"
SELECT COUNT(*) AS n
FROM reservations r
WHERE r.status = 'pending'
  AND (
    (r.target_type = 'allocation' AND EXISTS (
      SELECT 1 FROM allocations a WHERE a.id = r.target AND (a.id = ? OR a.mirror_of = ?)
    ))
    OR (r.target_type = 'group' AND ? IS NOT NULL AND r.target = ?)
  );
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .bind(group.map(|g| g.to_string()))
    .bind(group.map(|g| g.to_string()))
    .fetch_one(&mut **tx)
    .await
    .context("count_pending_reservations_for_family failed")?;

    Ok(row.get::<i64, _>("n"))
}

pub async fn reserved_slots_for_family(tx: &mut Tx<'_>, master_id: Uuid) -> anyhow::Result<Vec<ReservedSlot>> {
    let rows = sqlx::query(
        r#"
SELECT rs.* FROM reserved_slots rs
JOIN allocations a ON a.id = rs.allocation_id
WHERE a.id = ? OR a.mirror_of = ?;
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .fetch_all(&mut **tx)
    .await
    .context("reserved_slots_for_family failed")?;

    rows.iter().map(row_to_slot).collect()
}

#[derive(Clone)]
pub struct NewReservation {
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
}

pub async fn insert_reservation(tx: &mut Tx<'_>, r: &NewReservation) -> anyhow::Result<Reservation> {
    let now = common::time::now_utc();

    sqlx::query(
        r#"
INSERT INTO reservations
  (id, token, target, target_type, resource, start_ts, end_ts, quota, status,
   email, session_id, data, created_ts, modified_ts)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
    )
    .bind(r.id.to_string())
    .bind(r.token.to_string())
    .bind(r.target.to_string())
    .bind(r.target_type.as_str())
    .bind(&r.resource)
    .bind(rfc3339::to_string(r.start))
    .bind(rfc3339::to_string(r.end))
    .bind(r.quota)
    .bind(r.status.as_str())
    .bind(&r.email)
    .bind(r.session_id.map(|s| s.to_string()))
    .bind(r.data.as_ref().map(|d| d.to_string()))
    .bind(rfc3339::to_string(now))
    .bind(rfc3339::to_string(now))
    .execute(&mut **tx)
    .await
    .context("insert_reservation failed")?;

    Ok(Reservation {
        id: r.id,
        token: r.token,
        target: r.target,
        target_type: r.target_type,
        resource: r.resource.clone(),
        start: r.start,
        end: r.end,
        quota: r.quota,
        status: r.status,
        email: r.email.clone(),
        session_id: r.session_id,
        data: r.data.clone(),
        created: now,
        modified: now,
    })
}

/// Looks up a pre-existing cart line with the same
/// `(session_id, resource, target, start, end, quota)` so `reserve` can
/// reject it as `AlreadyReservedError` instead of creating a duplicate.
pub async fn find_cart_duplicate(
    tx: &mut Tx<'_>,
    session_id: Uuid,
    resource: &str,
    target: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    quota: i32,
) -> anyhow::Result<Option<Reservation>> {
    let row = sqlx::query(
        r#"
SELECT * FROM reservations
WHERE session_id = ? AND resource = ? AND target = ? AND start_ts = ? AND end_ts = ? AND quota = ?
  AND status = 'pending';
"#,
    )
    .bind(session_id.to_string())
    .bind(resource)
    .bind(target.to_string())
    .bind(rfc3339::to_string(start))
    .bind(rfc3339::to_string(end))
    .bind(quota)
    .fetch_optional(&mut **tx)
    .await
    .context("find_cart_duplicate failed")?;

    row.as_ref().map(row_to_reservation).transpose()
}

pub async fn pending_reservations_by_token(tx: &mut Tx<'_>, token: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE token = ? AND status = 'pending';")
        .bind(token.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("pending_reservations_by_token failed")?;

    rows.iter().map(row_to_reservation).collect()
}

pub async fn get_reservation(tx: &mut Tx<'_>, id: Uuid) -> anyhow::Result<Option<Reservation>> {
    let row = sqlx::query("SELECT * FROM reservations WHERE id = ?;")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .context("get_reservation failed")?;

    row.as_ref().map(row_to_reservation).transpose()
}

pub enum SlotInsertOutcome {
    Inserted(ReservedSlot),
    /// Primary-key collision: `(resource, allocation_id, start)` already taken.
    Conflict,
}

/// Inserts one reserved slot. A primary-key collision is reported as
/// `SlotInsertOutcome::Conflict` rather than an error, so the caller (the
/// approve path) can translate it into `AlreadyReservedError` and roll back.
pub async fn insert_reserved_slot(tx: &mut Tx<'_>, slot: &ReservedSlot) -> anyhow::Result<SlotInsertOutcome> {
    let res = sqlx::query(
        r#"
INSERT INTO reserved_slots (resource, allocation_id, start_ts, end_ts, reservation_token)
VALUES (?, ?, ?, ?, ?);
"#,
    )
    .bind(&slot.resource)
    .bind(slot.allocation_id.to_string())
    .bind(rfc3339::to_string(slot.start))
    .bind(rfc3339::to_string(slot.end))
    .bind(slot.reservation_token.to_string())
    .execute(&mut **tx)
    .await;

    match res {
        Ok(_) => Ok(SlotInsertOutcome::Inserted(slot.clone())),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(SlotInsertOutcome::Conflict),
        Err(e) => Err(anyhow!(e).context("insert_reserved_slot failed")),
    }
}

pub async fn mark_reservation_approved(tx: &mut Tx<'_>, id: Uuid) -> anyhow::Result<()> {
    sqlx::query("UPDATE reservations SET status = 'approved', modified_ts = ? WHERE id = ?;")
        .bind(rfc3339::to_string(common::time::now_utc()))
        .bind(id.to_string())
        .execute(&mut **tx)
        .await
        .context("mark_reservation_approved failed")?;

    Ok(())
}

pub async fn delete_pending_reservations_by_token(tx: &mut Tx<'_>, token: Uuid) -> anyhow::Result<u64> {
    let res = sqlx::query("DELETE FROM reservations WHERE token = ? AND status = 'pending';")
        .bind(token.to_string())
        .execute(&mut **tx)
        .await
        .context("delete_pending_reservations_by_token failed")?;

    Ok(res.rows_affected())
}

/// Deletes reservation(s) with `token` (optionally narrowed to one `id`) and
/// cascades to their reserved slots.
pub async fn delete_reservation_and_slots(tx: &mut Tx<'_>, token: Uuid, id: Option<Uuid>) -> anyhow::Result<u64> {
    sqlx::query("DELETE FROM reserved_slots WHERE reservation_token = ?;")
        .bind(token.to_string())
        .execute(&mut **tx)
        .await
        .context("delete_reservation_and_slots: slot cascade failed")?;

    let res = if let Some(id) = id {
        sqlx::query("DELETE FROM reservations WHERE token = ? AND id = ?;")
            .bind(token.to_string())
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
    } else {
        sqlx::query("DELETE FROM reservations WHERE token = ?;")
            .bind(token.to_string())
            .execute(&mut **tx)
            .await
    }
    .context("delete_reservation_and_slots: reservation delete failed")?;

    Ok(res.rows_affected())
}

pub async fn slots_by_token(tx: &mut Tx<'_>, token: Uuid) -> anyhow::Result<Vec<ReservedSlot>> {
    let rows = sqlx::query("SELECT * FROM reserved_slots WHERE reservation_token = ?;")
        .bind(token.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("slots_by_token failed")?;

    rows.iter().map(row_to_slot).collect()
}

pub async fn reservations_by_token_tx(tx: &mut Tx<'_>, token: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE token = ?;")
        .bind(token.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("reservations_by_token_tx failed")?;

    rows.iter().map(row_to_reservation).collect()
}

pub async fn masters_by_group(tx: &mut Tx<'_>, group: Uuid) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query("SELECT * FROM allocations WHERE group_key = ? AND mirror_of = id ORDER BY id;")
        .bind(group.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("masters_by_group failed")?;

    rows.iter().map(row_to_allocation).collect()
}

/// Family members (master + mirrors) holding no slot at exactly
/// `tick_start`, lowest id first — the mirror-placement order used when
/// approving a reservation.
pub async fn family_members_free_at(tx: &mut Tx<'_>, master_id: Uuid, tick_start: DateTime<Utc>) -> anyhow::Result<Vec<Allocation>> {
    let rows = sqlx::query(
        r#"
SELECT a.* FROM allocations a
WHERE (a.id = ? OR a.mirror_of = ?)
  AND NOT EXISTS (
    SELECT 1 FROM reserved_slots rs WHERE rs.allocation_id = a.id AND rs.start_ts = ?
  )
ORDER BY a.id;
"#,
    )
    .bind(master_id.to_string())
    .bind(master_id.to_string())
    .bind(rfc3339::to_string(tick_start))
    .fetch_all(&mut **tx)
    .await
    .context("family_members_free_at failed")?;

    rows.iter().map(row_to_allocation).collect()
}

pub async fn reservations_by_group(tx: &mut Tx<'_>, group: Uuid) -> anyhow::Result<Vec<Reservation>> {
    let rows = sqlx::query("SELECT * FROM reservations WHERE target = ? AND target_type = 'group';")
        .bind(group.to_string())
        .fetch_all(&mut **tx)
        .await
        .context("reservations_by_group failed")?;

    rows.iter().map(row_to_reservation).collect()
}

/* =========================
 * Row mapping
 * ========================= */

pub(crate) fn row_to_allocation(r: &AnyRow) -> anyhow::Result<Allocation> {
    Ok(Allocation {
        id: parse_uuid(r, "id")?,
        resource: r.get::<String, _>("resource"),
        mirror_of: parse_uuid(r, "mirror_of")?,
        group: parse_opt_uuid(r, "group_key")?,
        timezone: r.get::<String, _>("timezone"),
        start: rfc3339::parse(&r.get::<String, _>("start_ts"))?,
        end: rfc3339::parse(&r.get::<String, _>("end_ts"))?,
        quota: r.get::<i32, _>("quota"),
        quota_limit: r.get::<i32, _>("quota_limit"),
        partly_available: r.get::<i32, _>("partly_available") != 0,
        approve_manually: r.get::<i32, _>("approve_manually") != 0,
        waitinglist_spots: r.try_get::<i32, _>("waitinglist_spots").ok(),
        raster: r.get::<i32, _>("raster"),
        data: r
            .try_get::<String, _>("data")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

pub(crate) fn row_to_slot(r: &AnyRow) -> anyhow::Result<ReservedSlot> {
    Ok(ReservedSlot {
        resource: r.get::<String, _>("resource"),
        allocation_id: parse_uuid(r, "allocation_id")?,
        start: rfc3339::parse(&r.get::<String, _>("start_ts"))?,
        end: rfc3339::parse(&r.get::<String, _>("end_ts"))?,
        reservation_token: parse_uuid(r, "reservation_token")?,
    })
}

pub(crate) fn row_to_reservation(r: &AnyRow) -> anyhow::Result<Reservation> {
    let status_str = r.get::<String, _>("status");
    let target_type_str = r.get::<String, _>("target_type");

    Ok(Reservation {
        id: parse_uuid(r, "id")?,
        token: parse_uuid(r, "token")?,
        target: parse_uuid(r, "target")?,
        target_type: TargetType::parse(&target_type_str)
            .ok_or_else(|| anyhow!("unknown target_type: {target_type_str}"))?,
        resource: r.get::<String, _>("resource"),
        start: rfc3339::parse(&r.get::<String, _>("start_ts"))?,
        end: rfc3339::parse(&r.get::<String, _>("end_ts"))?,
        quota: r.get::<i32, _>("quota"),
        status: ReservationStatus::parse(&status_str).ok_or_else(|| anyhow!("unknown status: {status_str}"))?,
        email: r.get::<String, _>("email"),
        session_id: r
            .try_get::<String, _>("session_id")
            .ok()
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .context("invalid session_id")?,
        data: r
            .try_get::<String, _>("data")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
        created: rfc3339::parse(&r.get::<String, _>("created_ts"))?,
        modified: rfc3339::parse(&r.get::<String, _>("modified_ts"))?,
    })
}

fn parse_uuid(r: &AnyRow, col: &str) -> anyhow::Result<Uuid> {
    let s: String = r.get(col);
    Uuid::parse_str(&s).with_context(|| format!("invalid uuid in column {col}"))
}

fn parse_opt_uuid(r: &AnyRow, col: &str) -> anyhow::Result<Option<Uuid>> {
    match r.try_get::<String, _>(col) {
        Ok(s) => Ok(Some(Uuid::parse_str(&s).with_context(|| format!("invalid uuid in column {col}"))?)),
        Err(_) => Ok(None),
    }
}
