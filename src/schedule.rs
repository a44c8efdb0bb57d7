//! Inter-message delay distributions

use crate::config::Schedule;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use std::time::Duration;

enum Sampler {
    Zero,
    Flat(Duration),
    Normal(Normal<f64>),
    Random(Uniform<f64>),
}

/// Samples the wait between two publishes for a configured mean interval.
///
/// A zero interval short-circuits every schedule kind to a zero wait
/// without touching the random source.
pub struct DelaySchedule {
    schedule: Schedule,
    mean: Duration,
    sampler: Sampler,
}

impl DelaySchedule {
    pub fn new(interval: Duration, schedule: Schedule) -> Self {
        let mean_ms = interval.as_secs_f64() * 1_000.0;

        let sampler = if interval.is_zero() {
            Sampler::Zero
        } else {
            match schedule {
                Schedule::Flat => Sampler::Flat(interval),
                Schedule::Normal => match Normal::new(mean_ms, mean_ms / 2.0) {
                    Ok(normal) => Sampler::Normal(normal),
                    Err(_) => Sampler::Flat(interval),
                },
                Schedule::Random => Sampler::Random(Uniform::new_inclusive(0.0, 2.0 * mean_ms)),
            }
        };

        Self {
            schedule,
            mean: interval,
            sampler,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn mean(&self) -> Duration {
        self.mean
    }

    /// Whether sampling can be skipped entirely
    pub fn is_zero(&self) -> bool {
        matches!(self.sampler, Sampler::Zero)
    }

    /// Draw the next wait. Never negative.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match &self.sampler {
            Sampler::Zero => Duration::ZERO,
            Sampler::Flat(interval) => *interval,
            Sampler::Normal(normal) => millis(normal.sample(rng)),
            Sampler::Random(uniform) => millis(uniform.sample(rng)),
        }
    }
}

fn millis(ms: f64) -> Duration {
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1_000.0)
    } else {
        Duration::ZERO
    }
}
