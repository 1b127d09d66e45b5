//! Exponential backoff with proportional jitter.
//!
//! Pure timing math; sleeping is the supervisor's business.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    /// Upper bound of the random fraction added on top of the nominal delay.
    jitter: f64,
    /// Caps the nominal delay.
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, jitter: f64, max: Duration) -> Self {
        Self {
            base,
            jitter: if jitter.is_finite() { jitter.max(0.0) } else { 0.0 },
            max: max.max(base),
        }
    }

    pub const fn base(&self) -> Duration {
        self.base
    }

    pub const fn jitter(&self) -> f64 {
        self.jitter
    }

    /// `base × 2^(attempt−1)`, capped. Attempt numbers start at 1.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        match 1u32.checked_shl(exponent) {
            Some(factor) => self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max)),
            None => self.max,
        }
    }

    /// Inclusive range [`delay`](Self::delay) draws from.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal(attempt);
        (nominal, nominal.mul_f64(1.0 + self.jitter))
    }

    /// `nominal + uniform(0, jitter × nominal)`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let fraction = rng.gen_range(0.0..=self.jitter);
        nominal.mul_f64(1.0 + fraction)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 0.5, Duration::from_secs(60))
    }
}
