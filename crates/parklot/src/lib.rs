//! parklot: a bounded parking lot shared by concurrent vehicle tasks.
//!
//! The core is [`SlotPool`]: a counting admission semaphore plus a
//! lock-guarded occupancy table that hands each admitted vehicle the lowest
//! free slot. [`Vehicle`] drives one car through the lot, [`LotSupervisor`]
//! runs a whole simulation, and rendering happens behind a
//! [`PresentationSink`].

pub mod config;
pub mod permit;
pub mod sink;
pub mod supervisor;
pub mod vehicle;

pub use config::{ConfigError, HoldRange, SimulationConfig};
pub use permit::{LotStatus, PoolError, PoolSnapshot, SlotIndex, SlotPool, Ticket};
pub use sink::{
    JsonLinesSink, PresentationSink, RecordingSink, SinkDispatcher, SinkError, SinkEvent,
    SinkHandle, TracingSink, spawn_dispatcher,
};
pub use supervisor::{LotSupervisor, SimulationError, SimulationOutcome, SimulationReport};
pub use tokio_util::sync::CancellationToken;
pub use vehicle::{
    Vehicle, VehicleError, VehicleId, VehicleOutcome, VehicleReport, VehicleState,
};
