use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

use crate::schema;

/// Owns the connection pool shared by the write and read sessions.
#[derive(Clone)]
pub struct Db {
    pub pool: Arc<AnyPool>,
    /// Sqlite has no `SET TRANSACTION ISOLATION LEVEL` statement (every
    /// transaction is already serialized by its single-writer model), so
    /// the write session skips issuing one against this backend.
    pub is_sqlite: bool,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // An in-memory sqlite database is private to the connection that
        // created it; pooling more than one connection against it would
        // have each see a different, empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let is_sqlite = database_url.starts_with("sqlite:") || database_url.starts_with("sqlite::");

        Ok(Self { pool: Arc::new(pool), is_sqlite })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}
