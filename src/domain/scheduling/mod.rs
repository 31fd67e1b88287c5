use rand::Rng;
use std::time::Duration;

pub mod completion_tracker;
pub mod scheduling_engine;
pub mod tracker_factory;

/// `base` plus up to half of it again, so retrying loops do not hit a
/// recovering store in lockstep.
pub(crate) fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 2) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}
