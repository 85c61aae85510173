use std::time::Duration;

use common::SchedulerError;
use futures::future::BoxFuture;
use sqlx::{Any, Transaction};
use store::Db;

use crate::guard::SessionGuard;

/// Retry budget for the serializable-write loop. Mirrors `AppConfig`'s
/// `write_retry_*` fields so a caller that tunes those in the environment
/// actually changes this behavior instead of it being shadowed by
/// hardcoded constants.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(160),
        }
    }
}

/// The serializable-write session bound to a context. Every mutating
/// scheduler entry point calls `run` exactly once; helpers it calls take
/// the same `&mut Transaction` rather than going through `WriteSession`
/// again, so a nested declaration never opens a second transaction and the
/// outermost call is always the one that commits.
#[derive(Clone)]
pub struct WriteSession {
    db: Db,
    guard: SessionGuard,
    retry: RetryConfig,
}

impl WriteSession {
    pub fn new(db: Db, guard: SessionGuard, retry: RetryConfig) -> Self {
        Self { db, guard, retry }
    }

    /// Runs `f` inside one serializable transaction. On a serialization
    /// failure at commit time, retries with a low, capped exponential
    /// backoff; once the budget is exhausted, returns
    /// `TransactionRollback`. Any other error from `f` rolls the
    /// transaction back and propagates unchanged, per the error policy.
    pub async fn run<F, T>(&self, label: &'static str, f: F) -> Result<T, SchedulerError>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Any>) -> BoxFuture<'t, Result<T, SchedulerError>>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.retry.base_backoff;

        loop {
            attempt += 1;
            self.guard.mark_dirty();

            let mut tx = self
                .db
                .pool
                .begin()
                .await
                .map_err(|e| SchedulerError::Store(anyhow::anyhow!(e)))?;

            if !self.db.is_sqlite {
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE;")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| SchedulerError::Store(anyhow::anyhow!(e)))?;
            }

            let outcome = f(&mut tx).await;

            let result = match outcome {
                Ok(value) => match tx.commit().await {
                    Ok(()) => Ok(value),
                    Err(e) if is_serialization_failure(&e) && attempt < self.retry.max_attempts => {
                        tracing::warn!(label, attempt, "serialization conflict on commit, retrying");
                        self.guard.mark_clean();
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.retry.max_backoff);
                        continue;
                    }
                    Err(e) if is_serialization_failure(&e) => Err(SchedulerError::TransactionRollback { attempts: attempt }),
                    Err(e) => Err(SchedulerError::Store(anyhow::anyhow!(e))),
                },
                Err(err) => {
                    let _ = tx.rollback().await;
                    Err(err)
                }
            };

            self.guard.mark_clean();
            return result;
        }
    }
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err.as_database_error() {
        // Postgres SQLSTATE 40001 (serialization_failure) / 40P01 (deadlock_detected).
        Some(db_err) => matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")),
        None => false,
    }
}
