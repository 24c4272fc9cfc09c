//! Randomized pacing that makes browser sessions look less scripted.
//!
//! Pauses are drawn from a normal distribution squeezed into `[min, max]`
//! instead of a flat uniform range: people hesitate around a typical
//! duration, and uniform sleeps are easy to fingerprint.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Pacer;

pub const DELAY_MIN_MS: u64 = 3000;
pub const DELAY_MAX_MS: u64 = 8000;

/// One Box-Muller sample mapped from roughly [-3σ, 3σ] onto `[min, max]`,
/// clamped at the ends.
pub fn gaussian_between<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    // gen::<f64>() is in [0, 1); ln(0) must be avoided.
    let mut u: f64 = 0.0;
    while u == 0.0 {
        u = rng.r#gen();
    }
    let v: f64 = rng.r#gen();
    let z = (-2.0 * u.ln()).sqrt() * (2.0 * std::f64::consts::PI * v).cos();
    let unit = ((z + 3.0) / 6.0).clamp(0.0, 1.0);
    min + unit * (max - min)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

pub struct HumanDelay {
    min: Duration,
    max: Duration,
    rng: Mutex<StdRng>,
    pacer: Arc<dyn Pacer>,
}

impl HumanDelay {
    pub fn new(pacer: Arc<dyn Pacer>) -> Self {
        Self::with_rng(pacer, StdRng::from_entropy())
    }

    pub fn with_rng(pacer: Arc<dyn Pacer>, rng: StdRng) -> Self {
        Self {
            min: Duration::from_millis(DELAY_MIN_MS),
            max: Duration::from_millis(DELAY_MAX_MS),
            rng: Mutex::new(rng),
            pacer,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let ms = self.with_rng_mut(|rng| {
            gaussian_between(rng, self.min.as_millis() as f64, self.max.as_millis() as f64)
        });
        Duration::from_millis(ms.round() as u64)
    }

    /// Sleeps for one human-like pause.
    pub async fn pause(&self) {
        let delay = self.next_delay();
        tracing::trace!(delay_ms = delay.as_millis() as u64, "human delay");
        self.pacer.pause(delay).await;
    }

    /// Fixed wait through the same pacer, e.g. while a page settles.
    pub async fn hold(&self, duration: Duration) {
        self.pacer.pause(duration).await;
    }

    /// Slightly off-standard laptop resolution, different per session.
    pub fn viewport(&self) -> Viewport {
        self.with_rng_mut(|rng| Viewport {
            width: 1366 + rng.gen_range(0..200),
            height: 768 + rng.gen_range(0..100),
        })
    }

    /// Pixels for a short natural scroll: `base` plus up to `spread` extra.
    pub fn scroll_distance(&self, base: i64, spread: i64) -> i64 {
        self.with_rng_mut(|rng| base + rng.gen_range(0..spread.max(1)))
    }

    fn with_rng_mut<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut guard = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
