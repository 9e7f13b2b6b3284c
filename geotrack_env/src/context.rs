//! Core environment context trait for GeoTrack sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so the synchronization core can run
/// in both production (tokio wall clock) and simulation (paused tokio clock,
/// seeded RNG) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, thread RNG
/// - **Simulation**: `SimContext` - paused clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Every source of non-determinism the core touches (time, randomness)
/// goes through this trait.
#[async_trait]
pub trait TrackerContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time, used for notification timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: waits on the paused virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Draws a bearing uniformly from `[0, 2π)` radians.
    ///
    /// Used by the movement simulator; the simulation context derives it
    /// from the master seed so runs are reproducible.
    fn random_bearing(&self) -> f64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
