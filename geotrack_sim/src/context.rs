//! Simulation context implementing TrackerContext for deterministic testing.

use async_trait::async_trait;
use geotrack_env::TrackerContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Simulation context backed by the paused tokio clock and a seeded RNG.
///
/// This implements `TrackerContext` using:
/// - The tokio clock, paused by the runner, as the virtual clock
/// - A seeded ChaCha8 RNG for simulation bearings
/// - A fixed epoch so generated timestamps are reproducible
///
/// Must be created inside a runtime whose clock is paused.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    origin: Instant,

    /// Deterministic RNG
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            origin: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances the virtual clock, firing due timers.
    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            origin: self.origin,
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl TrackerContext for SimContext {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, at_ms = self.now().as_millis() as u64, "spawn");
        tokio::spawn(future);
    }

    fn random_bearing(&self) -> f64 {
        // A poisoned lock only follows a panic elsewhere in the run
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(0.0..TAU)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
