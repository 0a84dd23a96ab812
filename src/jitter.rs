//! Jitter strategies to prevent synchronized retry storms.

use rand::Rng;
use std::time::Duration;

/// Jitter applied on top of a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Uniform spread of `±spread × delay` around the delay. The dispatch
    /// default is `spread = 0.25`.
    Proportional { spread: f64 },
}

impl Jitter {
    pub fn proportional() -> Self {
        Jitter::Proportional { spread: 0.25 }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// RNG-injectable variant for deterministic tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional { spread } => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                let spread = spread.clamp(0.0, 1.0);
                let half_range = (millis as f64 * spread) as i64;
                if half_range == 0 {
                    return delay;
                }
                let offset = rng.random_range(-half_range..=half_range);
                Duration::from_millis(millis.saturating_add_signed(offset))
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::proportional()
    }
}
