use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared between a write session and its paired read session. Tracks
/// whether the write session currently holds an open, uncommitted
/// transaction, so the read session can refuse to serve a dirty read
/// instead of silently observing half-finished state.
#[derive(Clone, Default)]
pub struct SessionGuard {
    dirty: Arc<AtomicBool>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clean() {
        assert!(!SessionGuard::new().is_dirty());
    }

    #[test]
    fn dirty_then_clean_round_trips() {
        let g = SessionGuard::new();
        g.mark_dirty();
        assert!(g.is_dirty());
        g.mark_clean();
        assert!(!g.is_dirty());
    }

    #[test]
    fn clone_shares_state() {
        let a = SessionGuard::new();
        let b = a.clone();
        a.mark_dirty();
        assert!(b.is_dirty());
    }
}
