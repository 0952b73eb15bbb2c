//! Lot supervisor - creates every vehicle task and waits for all of them.
//!
//! The supervisor owns the pool and the sink dispatcher for the duration of a
//! run. Vehicle tasks signal completion by returning into a `JoinSet`; the run
//! ends when the set is empty. A fatal error in any vehicle cancels the rest
//! and closes the pool.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::SimulationConfig;
use crate::permit::{PoolError, SlotPool};
use crate::sink::{PresentationSink, SinkError, spawn_dispatcher};
use crate::vehicle::{Vehicle, VehicleError, VehicleId, VehicleOutcome, VehicleReport, as_millis};

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Vehicle(#[from] VehicleError),
    #[error("vehicle task failed to complete: {0}")]
    Join(String),
    #[error("slots leaked after run: {occupied} occupied, {available}/{capacity} admissions free")]
    LeakedSlots {
        occupied: usize,
        available: usize,
        capacity: usize,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub run_id: uuid::Uuid,
    /// RFC 3339.
    pub started_at: String,
    /// RFC 3339.
    pub completed_at: String,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub capacity: usize,
    pub peak_occupancy: usize,
    pub cancelled: bool,
    /// Sorted by vehicle id.
    pub vehicles: Vec<VehicleReport>,
}

impl SimulationReport {
    pub fn count(&self, outcome: VehicleOutcome) -> usize {
        self.vehicles.iter().filter(|v| v.outcome == outcome).count()
    }
}

/// Report plus the sink, handed back once its queue drained.
pub struct SimulationOutcome<S> {
    pub report: SimulationReport,
    pub sink: S,
}

pub struct LotSupervisor {
    config: SimulationConfig,
    cancel: CancellationToken,
}

impl LotSupervisor {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Cancelling stops new arrivals, turns away waiting vehicles and cuts
    /// holds short. Parked vehicles still depart through the normal path.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run<S: PresentationSink>(
        &self,
        sink: S,
    ) -> Result<SimulationOutcome<S>, SimulationError> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.run_inner(run_id, sink).instrument(span).await
    }

    async fn run_inner<S: PresentationSink>(
        &self,
        run_id: uuid::Uuid,
        sink: S,
    ) -> Result<SimulationOutcome<S>, SimulationError> {
        let config = &self.config;
        let started_at = chrono::Utc::now().to_rfc3339();
        let clock = Instant::now();

        let pool = Arc::new(SlotPool::new(config.capacity));
        let (handle, dispatcher) = spawn_dispatcher(sink)?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        tracing::info!(
            capacity = config.capacity.get(),
            vehicles = config.vehicles,
            hold_min = ?config.hold.min(),
            hold_max = ?config.hold.max(),
            "Simulation starting"
        );

        let mut tasks = JoinSet::new();
        for n in 0..config.vehicles {
            if n > 0 && !config.arrival_interval.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(config.arrival_interval) => {}
                    () = self.cancel.cancelled() => {}
                }
            }
            if self.cancel.is_cancelled() {
                tracing::warn!(spawned = n, "Cancelled before all vehicles arrived");
                break;
            }

            let vehicle = Vehicle::with_random_hold(VehicleId::new(n as u64), &config.hold, &mut rng);
            let span = tracing::info_span!("vehicle", id = %vehicle.id());
            tasks.spawn(
                vehicle
                    .run(Arc::clone(&pool), handle.clone(), self.cancel.child_token())
                    .instrument(span),
            );
        }
        // Dispatcher drains once the vehicles drop their clones.
        drop(handle);

        let mut reports = Vec::with_capacity(config.vehicles);
        let mut failure: Option<SimulationError> = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok(Ok(report)) => {
                    reports.push(report);
                    continue;
                }
                Ok(Err(e)) => SimulationError::Vehicle(e),
                Err(e) => SimulationError::Join(e.to_string()),
            };
            tracing::error!(error = %error, "Vehicle failed - aborting run");
            if failure.is_none() {
                self.cancel.cancel();
                pool.close();
                failure = Some(error);
            }
        }

        let sink = dispatcher.finish().await?;
        if let Some(error) = failure {
            return Err(error);
        }

        let snapshot = pool.snapshot()?;
        if snapshot.occupied() != 0 || snapshot.available != snapshot.capacity {
            tracing::error!(
                occupied = snapshot.occupied(),
                available = snapshot.available,
                "Pool not empty after every vehicle finished"
            );
            return Err(SimulationError::LeakedSlots {
                occupied: snapshot.occupied(),
                available: snapshot.available,
                capacity: snapshot.capacity,
            });
        }

        reports.sort_by_key(|r| r.id);
        let report = SimulationReport {
            run_id,
            started_at,
            completed_at: chrono::Utc::now().to_rfc3339(),
            elapsed: clock.elapsed(),
            capacity: snapshot.capacity,
            peak_occupancy: snapshot.peak,
            cancelled: self.cancel.is_cancelled(),
            vehicles: reports,
        };
        tracing::info!(
            departed = report.count(VehicleOutcome::Departed),
            departed_early = report.count(VehicleOutcome::DepartedEarly),
            abandoned = report.count(VehicleOutcome::Abandoned),
            peak = report.peak_occupancy,
            elapsed = ?report.elapsed,
            "Simulation finished"
        );

        Ok(SimulationOutcome { report, sink })
    }
}
