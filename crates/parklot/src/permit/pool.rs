//! Slot pool: a counting admission semaphore coupled to a lock-guarded slot table.
//!
//! Admission (how many vehicles are inside) and slot identity (which slot each
//! one occupies) are separate primitives. Callers only ever see them through
//! [`SlotPool`] operations and [`Ticket`], which keeps the two consistent: a
//! ticket's permit is never returned while the slot it fronts is still marked
//! occupied.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::slot::{Occupancy, SlotIndex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Admitted vehicle found no free slot. Admission and the table disagree.
    #[error("no free slot for an admitted ticket (capacity {capacity})")]
    Exhausted { capacity: usize },
    #[error("ticket already holds slot {slot}")]
    SlotAlreadyClaimed { slot: SlotIndex },
    #[error("ticket {ticket} holds no slot to release")]
    NoSlotClaimed { ticket: u64 },
    #[error("slot {slot} is not marked occupied")]
    SlotNotOccupied { slot: SlotIndex },
    #[error("ticket released while still holding slot {slot}")]
    SlotStillClaimed { slot: SlotIndex },
    #[error("ticket {ticket} was issued by a different pool")]
    ForeignTicket { ticket: u64 },
    #[error("pool is closed to new admissions")]
    Closed,
    #[error("occupancy lock poisoned")]
    Poisoned,
}

/// Admission ticket. Holding one is the right to occupy exactly one slot.
///
/// Only [`SlotPool::admit`] and [`SlotPool::try_admit`] create tickets. Dropping
/// a ticket returns its permit; if it still fronts a slot, that slot is freed
/// first.
#[must_use = "dropping a ticket immediately gives the admission back"]
pub struct Ticket {
    serial: u64,
    slot: Option<SlotIndex>,
    occupancy: Arc<StdMutex<Occupancy>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Slot this ticket currently fronts, if any.
    pub fn slot(&self) -> Option<SlotIndex> {
        self.slot
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("serial", &self.serial)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::error!(ticket = self.serial, %slot, "Ticket dropped while still holding a slot");
            let mut occupancy = self
                .occupancy
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            occupancy.free(slot);
        }
        // Permit goes back only after the slot is free.
        drop(self.permit.take());
    }
}

/// Whether the lot can admit another vehicle right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Open,
    Full,
}

/// Point-in-time view of the pool, taken under the occupancy lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub available: usize,
    pub occupancy: Vec<bool>,
    pub peak: usize,
}

impl PoolSnapshot {
    pub fn occupied(&self) -> usize {
        self.occupancy.iter().filter(|o| **o).count()
    }

    /// Tickets currently held.
    pub fn held(&self) -> usize {
        self.capacity.saturating_sub(self.available)
    }

    pub fn is_full(&self) -> bool {
        self.available == 0
    }

    pub fn status(&self) -> LotStatus {
        if self.is_full() {
            LotStatus::Full
        } else {
            LotStatus::Open
        }
    }
}

/// Bounded pool of parking slots.
pub struct SlotPool {
    capacity: NonZeroUsize,
    admission: Arc<Semaphore>,
    occupancy: Arc<StdMutex<Occupancy>>,
    next_serial: AtomicU64,
}

impl SlotPool {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            admission: Arc::new(Semaphore::new(capacity.get())),
            occupancy: Arc::new(StdMutex::new(Occupancy::new(capacity.get()))),
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Admission permits not currently held.
    pub fn available(&self) -> usize {
        self.admission.available_permits()
    }

    /// Wait for admission. Waiters are served in arrival order.
    ///
    /// Only fails after [`SlotPool::close`].
    pub async fn admit(&self) -> Result<Ticket, PoolError> {
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.issue(permit))
    }

    /// Admit without waiting. `None` if the lot is full or closed.
    pub fn try_admit(&self) -> Option<Ticket> {
        let permit = Arc::clone(&self.admission).try_acquire_owned().ok()?;
        Some(self.issue(permit))
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> Ticket {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(ticket = serial, available = self.available(), "Admission granted");
        Ticket {
            serial,
            slot: None,
            occupancy: Arc::clone(&self.occupancy),
            permit: Some(permit),
        }
    }

    /// Claim the lowest free slot for an admitted ticket.
    pub fn claim_slot(&self, ticket: &mut Ticket) -> Result<SlotIndex, PoolError> {
        self.check_owner(ticket)?;
        if let Some(slot) = ticket.slot {
            return Err(PoolError::SlotAlreadyClaimed { slot });
        }

        let mut occupancy = self.lock()?;
        let Some(slot) = occupancy.claim_lowest() else {
            tracing::error!(
                ticket = ticket.serial,
                capacity = self.capacity(),
                "Admitted ticket found no free slot"
            );
            return Err(PoolError::Exhausted {
                capacity: self.capacity(),
            });
        };
        ticket.slot = Some(slot);
        tracing::debug!(ticket = ticket.serial, %slot, occupied = occupancy.occupied(), "Slot claimed");
        Ok(slot)
    }

    /// Free the slot a ticket fronts. The ticket stays admitted.
    pub fn release_slot(&self, ticket: &mut Ticket) -> Result<SlotIndex, PoolError> {
        self.check_owner(ticket)?;
        let slot = ticket.slot.ok_or(PoolError::NoSlotClaimed {
            ticket: ticket.serial,
        })?;

        let mut occupancy = self.lock()?;
        ticket.slot = None;
        if !occupancy.free(slot) {
            tracing::error!(ticket = ticket.serial, %slot, "Released slot was not occupied");
            return Err(PoolError::SlotNotOccupied { slot });
        }
        tracing::debug!(ticket = ticket.serial, %slot, occupied = occupancy.occupied(), "Slot released");
        Ok(slot)
    }

    /// Return an admission ticket. Its slot must already be released.
    pub fn release(&self, ticket: Ticket) -> Result<(), PoolError> {
        self.check_owner(&ticket)?;
        let serial = ticket.serial;
        if let Some(slot) = ticket.slot {
            // Drop frees the slot before the permit goes back.
            drop(ticket);
            return Err(PoolError::SlotStillClaimed { slot });
        }
        drop(ticket);
        tracing::debug!(ticket = serial, available = self.available(), "Admission returned");
        Ok(())
    }

    /// Stop admitting. Waiting and future `admit` calls fail with [`PoolError::Closed`].
    pub fn close(&self) {
        if !self.admission.is_closed() {
            tracing::warn!(available = self.available(), "Slot pool closed");
            self.admission.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.admission.is_closed()
    }

    pub fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        let occupancy = self.lock()?;
        // Read while holding the lock: no slot can be freed (and no permit
        // returned behind it) until we let go.
        Ok(PoolSnapshot {
            capacity: self.capacity(),
            available: self.available(),
            occupancy: occupancy.as_slice().to_vec(),
            peak: occupancy.peak(),
        })
    }

    fn check_owner(&self, ticket: &Ticket) -> Result<(), PoolError> {
        if Arc::ptr_eq(&self.occupancy, &ticket.occupancy) {
            Ok(())
        } else {
            Err(PoolError::ForeignTicket {
                ticket: ticket.serial,
            })
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Occupancy>, PoolError> {
        self.occupancy.lock().map_err(|_| {
            tracing::error!("Occupancy lock poisoned");
            PoolError::Poisoned
        })
    }
}
