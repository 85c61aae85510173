mod guard;
mod read_session;
mod write_session;

pub use guard::SessionGuard;
pub use read_session::ReadSession;
pub use write_session::{RetryConfig, WriteSession};

use store::Db;

/// The two logical sessions bound to one context's connection pool,
/// sharing a guard.
#[derive(Clone)]
pub struct Sessions {
    pub write: WriteSession,
    pub read: ReadSession,
}

impl Sessions {
    pub fn new(db: Db, retry: RetryConfig) -> Self {
        let guard = SessionGuard::new();
        Self {
            write: WriteSession::new(db.clone(), guard.clone(), retry),
            read: ReadSession::new(db, guard),
        }
    }
}
