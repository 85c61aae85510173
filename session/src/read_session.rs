use common::SchedulerError;
use futures::future::BoxFuture;
use sqlx::{Any, AnyPool, Transaction};
use store::Db;

use crate::guard::SessionGuard;

/// The read-only session bound to a context. Exposes only the pool, never
/// a transaction handle, so there is no mutating entry point to guard in
/// the first place; `check` is the runtime half of the guard, rejecting
/// reads while the paired write session has uncommitted work.
#[derive(Clone)]
pub struct ReadSession {
    db: Db,
    guard: SessionGuard,
}

impl ReadSession {
    pub fn new(db: Db, guard: SessionGuard) -> Self {
        Self { db, guard }
    }

    pub fn check(&self) -> Result<(), SchedulerError> {
        if self.guard.is_dirty() {
            return Err(SchedulerError::DirtyReadOnlySession);
        }
        Ok(())
    }

    pub fn pool(&self) -> Result<&AnyPool, SchedulerError> {
        self.check()?;
        Ok(self.db.pool.as_ref())
    }

    /// Same call shape as `WriteSession::run`, so a caller who mistakenly
    /// routes a mutating closure through `sessions.read` instead of
    /// `sessions.write` (a copy-paste away, since both sessions hang off
    /// the same `Sessions` struct) hits `ModifiedReadOnlySession` instead
    /// of the closure never running with no explanation.
    pub async fn run<F, T>(&self, _label: &'static str, _f: F) -> Result<T, SchedulerError>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Any>) -> BoxFuture<'t, Result<T, SchedulerError>>,
    {
        Err(Self::reject_write())
    }

    /// A caller that mistakenly routes a write through a read session
    /// handle gets this instead of the pool silently accepting it.
    pub fn reject_write() -> SchedulerError {
        SchedulerError::ModifiedReadOnlySession
    }
}
