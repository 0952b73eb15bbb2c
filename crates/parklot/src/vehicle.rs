//! Vehicle lifecycle.
//!
//! One task per vehicle. Each walks the same path through the lot:
//! approach, wait for admission, claim a slot, hold it, queue to depart,
//! release, depart. No step is retried; pool errors end the run.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::HoldRange;
use crate::permit::{PoolError, SlotIndex, SlotPool};
use crate::sink::{SinkEvent, SinkHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VehicleId(u64);

impl VehicleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleState {
    Created,
    Approaching,
    WaitingForAdmission,
    Occupying,
    QueuedToDepart,
    Departed,
    /// Left before being admitted because the run was cancelled.
    Abandoned,
}

impl VehicleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Departed | Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approaching => "approaching",
            Self::WaitingForAdmission => "waiting_for_admission",
            Self::Occupying => "occupying",
            Self::QueuedToDepart => "queued_to_depart",
            Self::Departed => "departed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Transitions only move forward, one state at a time.
    pub fn can_advance_to(&self, next: VehicleState) -> bool {
        use VehicleState::*;
        matches!(
            (self, next),
            (Created, Approaching)
                | (Approaching, WaitingForAdmission)
                | (WaitingForAdmission, Occupying)
                | (Occupying, QueuedToDepart)
                | (QueuedToDepart, Departed)
                | (Approaching | WaitingForAdmission, Abandoned)
        )
    }
}

impl std::fmt::Display for VehicleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    #[error("vehicle {vehicle}: {source}")]
    Pool {
        vehicle: VehicleId,
        #[source]
        source: PoolError,
    },
    #[error("vehicle {vehicle}: illegal transition {from} -> {to}")]
    Transition {
        vehicle: VehicleId,
        from: VehicleState,
        to: VehicleState,
    },
}

impl VehicleError {
    pub fn vehicle(&self) -> VehicleId {
        match self {
            VehicleError::Pool { vehicle, .. } | VehicleError::Transition { vehicle, .. } => {
                *vehicle
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleOutcome {
    /// Held the slot for the full duration.
    Departed,
    /// Hold cut short by cancellation.
    DepartedEarly,
    /// Never admitted.
    Abandoned,
}

/// What happened to one vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleReport {
    pub id: VehicleId,
    pub slot: Option<SlotIndex>,
    pub outcome: VehicleOutcome,
    #[serde(rename = "hold_ms", serialize_with = "as_millis")]
    pub hold: Duration,
    /// Time from approach until admission.
    #[serde(rename = "waited_ms", serialize_with = "as_millis")]
    pub waited: Duration,
    /// Time actually spent in the slot.
    #[serde(rename = "held_ms", serialize_with = "as_millis")]
    pub held: Duration,
}

pub(crate) fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// A simulated vehicle, not yet started.
#[derive(Debug)]
pub struct Vehicle {
    id: VehicleId,
    hold: Duration,
    assigned_slot: Option<SlotIndex>,
    state: VehicleState,
}

impl Vehicle {
    pub fn new(id: VehicleId, hold: Duration) -> Self {
        Self {
            id,
            hold,
            assigned_slot: None,
            state: VehicleState::Created,
        }
    }

    pub fn with_random_hold<R: Rng + ?Sized>(id: VehicleId, range: &HoldRange, rng: &mut R) -> Self {
        Self::new(id, range.sample(rng))
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    pub fn assigned_slot(&self) -> Option<SlotIndex> {
        self.assigned_slot
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    /// Drive the vehicle through the lot. Returns once it has departed
    /// (or abandoned the queue after `cancel` fired).
    pub async fn run(
        mut self,
        pool: Arc<SlotPool>,
        sink: SinkHandle,
        cancel: CancellationToken,
    ) -> Result<VehicleReport, VehicleError> {
        let id = self.id;
        let pool_err = |source: PoolError| VehicleError::Pool { vehicle: id, source };
        let arrived = Instant::now();

        self.advance(VehicleState::Approaching)?;
        sink.notify(SinkEvent::Approach { vehicle: id });

        self.advance(VehicleState::WaitingForAdmission)?;
        let admission = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            ticket = pool.admit() => Some(ticket),
        };
        let Some(admission) = admission else {
            self.advance(VehicleState::Abandoned)?;
            tracing::warn!(vehicle = %id, "Cancelled while waiting for admission");
            sink.notify(SinkEvent::Abandoned { vehicle: id });
            return Ok(self.report(VehicleOutcome::Abandoned, arrived.elapsed(), Duration::ZERO));
        };
        let mut ticket = admission.map_err(pool_err)?;
        let waited = arrived.elapsed();

        let slot = pool.claim_slot(&mut ticket).map_err(pool_err)?;
        self.assigned_slot = Some(slot);
        self.advance(VehicleState::Occupying)?;
        sink.notify(SinkEvent::Entered { vehicle: id, slot });

        // No lock is held while parked.
        let parked = Instant::now();
        let interrupted = tokio::select! {
            () = tokio::time::sleep(self.hold) => false,
            () = cancel.cancelled() => true,
        };
        let held = parked.elapsed();
        if interrupted {
            tracing::warn!(vehicle = %id, %slot, ?held, "Hold cut short by cancellation");
        }

        self.advance(VehicleState::QueuedToDepart)?;
        sink.notify(SinkEvent::QueuedToDepart { vehicle: id });

        pool.release_slot(&mut ticket).map_err(pool_err)?;
        pool.release(ticket).map_err(pool_err)?;
        self.advance(VehicleState::Departed)?;
        sink.notify(SinkEvent::Departed { vehicle: id });

        let outcome = if interrupted {
            VehicleOutcome::DepartedEarly
        } else {
            VehicleOutcome::Departed
        };
        Ok(self.report(outcome, waited, held))
    }

    fn advance(&mut self, next: VehicleState) -> Result<(), VehicleError> {
        if !self.state.can_advance_to(next) {
            return Err(VehicleError::Transition {
                vehicle: self.id,
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(vehicle = %self.id, from = %self.state, to = %next, "Vehicle state change");
        self.state = next;
        Ok(())
    }

    fn report(&self, outcome: VehicleOutcome, waited: Duration, held: Duration) -> VehicleReport {
        VehicleReport {
            id: self.id,
            slot: self.assigned_slot,
            outcome,
            hold: self.hold,
            waited,
            held,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordingSink, spawn_dispatcher};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::num::NonZeroUsize;

    fn pool(capacity: usize) -> Arc<SlotPool> {
        Arc::new(SlotPool::new(NonZeroUsize::new(capacity).unwrap()))
    }

    fn vehicle(id: u64, hold_secs: u64) -> Vehicle {
        Vehicle::new(VehicleId::new(id), Duration::from_secs(hold_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn vehicle_walks_the_full_lifecycle() {
        let pool = pool(2);
        let (sink, dispatcher) = spawn_dispatcher(RecordingSink::new()).unwrap();

        let report = vehicle(1, 75)
            .run(Arc::clone(&pool), sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, VehicleOutcome::Departed);
        assert_eq!(report.slot, Some(SlotIndex::new(0)));
        assert_eq!(report.waited, Duration::ZERO);
        assert_eq!(report.held, Duration::from_secs(75));

        let v = VehicleId::new(1);
        let recorded = dispatcher.finish().await.unwrap();
        assert_eq!(
            recorded.events(),
            &[
                SinkEvent::Approach { vehicle: v },
                SinkEvent::Entered {
                    vehicle: v,
                    slot: SlotIndex::new(0)
                },
                SinkEvent::QueuedToDepart { vehicle: v },
                SinkEvent::Departed { vehicle: v },
            ]
        );

        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.occupied(), 0);
        assert_eq!(snapshot.available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vehicle_waits_while_lot_is_full() {
        let pool = pool(1);
        let occupant = pool.admit().await.unwrap();

        let task = tokio::spawn(vehicle(2, 10).run(
            Arc::clone(&pool),
            SinkHandle::detached(),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!task.is_finished());
        pool.release(occupant).unwrap();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.waited, Duration::from_secs(30));
        assert_eq!(report.slot, Some(SlotIndex::new(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting_abandons() {
        let pool = pool(1);
        let _occupant = pool.admit().await.unwrap();
        let cancel = CancellationToken::new();
        let (sink, dispatcher) = spawn_dispatcher(RecordingSink::new()).unwrap();

        let task = tokio::spawn(vehicle(3, 60).run(Arc::clone(&pool), sink, cancel.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.outcome, VehicleOutcome::Abandoned);
        assert_eq!(report.slot, None);

        let v = VehicleId::new(3);
        let recorded = dispatcher.finish().await.unwrap();
        assert_eq!(
            recorded.events(),
            &[
                SinkEvent::Approach { vehicle: v },
                SinkEvent::Abandoned { vehicle: v },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_parked_departs_early() {
        let pool = pool(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(vehicle(4, 90).run(
            Arc::clone(&pool),
            SinkHandle::detached(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.outcome, VehicleOutcome::DepartedEarly);
        assert_eq!(report.held, Duration::from_secs(20));
        assert_eq!(pool.snapshot().unwrap().occupied(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn closed_pool_is_fatal() {
        let pool = pool(1);
        pool.close();

        let err = vehicle(5, 1)
            .run(pool, SinkHandle::detached(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VehicleError::Pool {
                source: PoolError::Closed,
                ..
            }
        ));
        assert_eq!(err.vehicle(), VehicleId::new(5));
        assert_eq!(err.to_string(), "vehicle 5: pool is closed to new admissions");
    }

    #[test]
    fn new_vehicle_is_unassigned() {
        let v = vehicle(6, 50);
        assert_eq!(v.state(), VehicleState::Created);
        assert_eq!(v.assigned_slot(), None);
        assert_eq!(v.hold(), Duration::from_secs(50));
    }

    #[test]
    fn random_hold_is_drawn_from_range() {
        let range = HoldRange::default();
        let mut rng = StdRng::seed_from_u64(11);
        let v = Vehicle::with_random_hold(VehicleId::new(7), &range, &mut rng);
        assert!(v.hold() >= range.min() && v.hold() <= range.max());
    }

    #[test]
    fn states_advance_one_step_at_a_time() {
        use VehicleState::*;
        let path = [Created, Approaching, WaitingForAdmission, Occupying, QueuedToDepart, Departed];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(!Created.can_advance_to(Occupying));
        assert!(!Occupying.can_advance_to(Departed));
        assert!(!Departed.can_advance_to(Approaching));
        assert!(!Occupying.can_advance_to(Abandoned));
        assert!(WaitingForAdmission.can_advance_to(Abandoned));
        assert!(Departed.is_terminal() && Abandoned.is_terminal());
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut v = vehicle(8, 1);
        let err = v.advance(VehicleState::Occupying).unwrap_err();
        assert_eq!(
            err.to_string(),
            "vehicle 8: illegal transition created -> occupying"
        );
        assert_eq!(v.state(), VehicleState::Created);
    }

    #[test]
    fn report_serializes_durations_as_millis() {
        let report = VehicleReport {
            id: VehicleId::new(9),
            slot: Some(SlotIndex::new(3)),
            outcome: VehicleOutcome::Departed,
            hold: Duration::from_secs(52),
            waited: Duration::from_millis(1500),
            held: Duration::from_secs(52),
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "id": 9,
          "slot": 3,
          "outcome": "departed",
          "hold_ms": 52000,
          "waited_ms": 1500,
          "held_ms": 52000
        }
        "#);
    }
}
