use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Source of "now" for every time decision in the scheduler.
pub trait SystemClock: std::fmt::Debug + Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn SystemClock>;

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl SystemClock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated time: a fixed base timestamp advanced by the time elapsed on the
/// tokio clock since construction.
///
/// Under a paused tokio runtime this clock moves exactly as far as the
/// runtime's virtual time does.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    simulation_base: DateTime<Utc>,
    real_time_base: Instant,
}

impl SimulatedClock {
    pub fn starting_at(simulation_base: DateTime<Utc>) -> Self {
        Self { simulation_base, real_time_base: Instant::now() }
    }
}

impl SystemClock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.real_time_base.elapsed()).unwrap_or(chrono::Duration::zero());
        self.simulation_base + elapsed
    }
}

/// `max(0, target - now)` as a std duration.
pub fn duration_until(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
