use sqlx::AnyPool;

/// Creates the three tables from the data model if they do not already
/// exist. Idempotent, so it is safe to call on every startup.
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS allocations (
  id                 TEXT PRIMARY KEY,
  resource           TEXT NOT NULL,
  mirror_of          TEXT NOT NULL,
  group_key          TEXT,
  timezone           TEXT NOT NULL,
  start_ts           TEXT NOT NULL,
  end_ts             TEXT NOT NULL,
  quota              INTEGER NOT NULL,
  quota_limit        INTEGER NOT NULL,
  partly_available   INTEGER NOT NULL,
  approve_manually   INTEGER NOT NULL,
  waitinglist_spots  INTEGER,
  raster             INTEGER NOT NULL,
  data               TEXT
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS reserved_slots (
  resource           TEXT NOT NULL,
  allocation_id      TEXT NOT NULL,
  start_ts           TEXT NOT NULL,
  end_ts             TEXT NOT NULL,
  reservation_token  TEXT NOT NULL,
  PRIMARY KEY (resource, allocation_id, start_ts)
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS reservations (
  id           TEXT PRIMARY KEY,
  token        TEXT NOT NULL,
  target       TEXT NOT NULL,
  target_type  TEXT NOT NULL,
  resource     TEXT NOT NULL,
  start_ts     TEXT NOT NULL,
  end_ts       TEXT NOT NULL,
  quota        INTEGER NOT NULL,
  status       TEXT NOT NULL,
  email        TEXT NOT NULL,
  session_id   TEXT,
  data         TEXT,
  created_ts   TEXT NOT NULL,
  modified_ts  TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_allocations_resource_span ON allocations(resource, start_ts, end_ts);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_allocations_mirror_of ON allocations(mirror_of);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_reserved_slots_allocation ON reserved_slots(allocation_id);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_reservations_token ON reservations(token);"#)
        .execute(pool)
        .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_reservations_session ON reservations(session_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
