//! Parking capacity: admission tickets and physical slot bookkeeping.
//!
//! A vehicle moves through the pool in a fixed order:
//! - `admit()` → `Ticket` (waits while the lot is full)
//! - `claim_slot(&mut ticket)` → lowest free `SlotIndex`
//! - `release_slot(&mut ticket)` → slot marked free
//! - `release(ticket)` → permit returned, next waiter admitted

mod pool;
mod slot;

pub use pool::{LotStatus, PoolError, PoolSnapshot, SlotPool, Ticket};
pub use slot::SlotIndex;
