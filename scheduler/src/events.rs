//! Named publish points fired after a state transition, while the
//! mutating transaction is still open. Listeners run synchronously and
//! must not block indefinitely, since they share the caller's transaction
//! budget.

use store::{Allocation, Reservation, ReservedSlot};

pub trait SchedulerHooks: Send + Sync {
    fn on_allocations_added(&self, _allocations: &[Allocation]) {}
    fn on_reservations_made(&self, _reservations: &[Reservation]) {}
    fn on_reservations_approved(&self, _reservations: &[Reservation]) {}
    fn on_reservations_denied(&self, _reservations: &[Reservation]) {}
    fn on_reservations_removed(&self, _reservations: &[Reservation]) {}
    fn on_reserved_slots_reserved(&self, _slots: &[ReservedSlot]) {}
    fn on_reserved_slots_released(&self, _slots: &[ReservedSlot]) {}
}

/// Default hook set: logs at debug level and otherwise does nothing.
/// Contexts that don't register a custom `SchedulerHooks` get this.
#[derive(Default)]
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {
    fn on_allocations_added(&self, allocations: &[Allocation]) {
        tracing::debug!(count = allocations.len(), "allocations_added");
    }

    fn on_reservations_made(&self, reservations: &[Reservation]) {
        tracing::debug!(count = reservations.len(), "reservations_made");
    }

    fn on_reservations_approved(&self, reservations: &[Reservation]) {
        tracing::debug!(count = reservations.len(), "reservations_approved");
    }

    fn on_reservations_denied(&self, reservations: &[Reservation]) {
        tracing::debug!(count = reservations.len(), "reservations_denied");
    }

    fn on_reservations_removed(&self, reservations: &[Reservation]) {
        tracing::debug!(count = reservations.len(), "reservations_removed");
    }

    fn on_reserved_slots_reserved(&self, slots: &[ReservedSlot]) {
        tracing::debug!(count = slots.len(), "reserved_slots_reserved");
    }

    fn on_reserved_slots_released(&self, slots: &[ReservedSlot]) {
        tracing::debug!(count = slots.len(), "reserved_slots_released");
    }
}
