//! Simulation configuration.
//!
//! Defaults reproduce the reference lot: 20 slots, 20 vehicles, holds of 50–99 s.
//! Every field can be overridden from `PARKLOT_*` environment variables.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 20;
pub const DEFAULT_VEHICLES: usize = 20;
pub const DEFAULT_HOLD_MIN: Duration = Duration::from_secs(50);
pub const DEFAULT_HOLD_MAX: Duration = Duration::from_secs(99);

pub const ENV_CAPACITY: &str = "PARKLOT_CAPACITY";
pub const ENV_VEHICLES: &str = "PARKLOT_VEHICLES";
pub const ENV_HOLD_MIN_MS: &str = "PARKLOT_HOLD_MIN_MS";
pub const ENV_HOLD_MAX_MS: &str = "PARKLOT_HOLD_MAX_MS";
pub const ENV_ARRIVAL_MS: &str = "PARKLOT_ARRIVAL_MS";
pub const ENV_SEED: &str = "PARKLOT_SEED";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("lot capacity must be at least 1")]
    ZeroCapacity,
    #[error("minimum hold {min:?} exceeds maximum hold {max:?}")]
    InvertedHoldRange { min: Duration, max: Duration },
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

/// Inclusive range a vehicle's hold duration is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoldRange {
    min: Duration,
    max: Duration,
}

impl HoldRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedHoldRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Every vehicle holds for exactly `hold`.
    pub fn fixed(hold: Duration) -> Self {
        Self {
            min: hold,
            max: hold,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draw a hold duration with millisecond resolution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min = millis(self.min);
        let max = millis(self.max);
        Duration::from_millis(rng.random_range(min..=max))
    }
}

impl Default for HoldRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_HOLD_MIN,
            max: DEFAULT_HOLD_MAX,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parameters for one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationConfig {
    /// Number of physical slots.
    pub capacity: NonZeroUsize,
    /// Number of vehicles created by the supervisor.
    pub vehicles: usize,
    pub hold: HoldRange,
    /// Delay between consecutive vehicle spawns. Zero spawns all at once.
    pub arrival_interval: Duration,
    /// Seed for hold durations; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            vehicles: DEFAULT_VEHICLES,
            hold: HoldRange::default(),
            arrival_interval: Duration::ZERO,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Result<Self, ConfigError> {
        self.capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::ZeroCapacity)?;
        Ok(self)
    }

    pub fn with_vehicles(mut self, vehicles: usize) -> Self {
        self.vehicles = vehicles;
        self
    }

    pub fn with_hold(mut self, hold: HoldRange) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_arrival_interval(mut self, interval: Duration) -> Self {
        self.arrival_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Defaults overridden by `PARKLOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `PARKLOT_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_var::<usize, _>(&lookup, ENV_CAPACITY)? {
            config = config.with_capacity(capacity)?;
        }
        if let Some(vehicles) = parse_var::<usize, _>(&lookup, ENV_VEHICLES)? {
            config.vehicles = vehicles;
        }

        let min = parse_var::<u64, _>(&lookup, ENV_HOLD_MIN_MS)?.map(Duration::from_millis);
        let max = parse_var::<u64, _>(&lookup, ENV_HOLD_MAX_MS)?.map(Duration::from_millis);
        if min.is_some() || max.is_some() {
            config.hold = HoldRange::new(
                min.unwrap_or(config.hold.min),
                max.unwrap_or(config.hold.max),
            )?;
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_ARRIVAL_MS)? {
            config.arrival_interval = Duration::from_millis(ms);
        }
        config.seed = parse_var::<u64, _>(&lookup, ENV_SEED)?;

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
