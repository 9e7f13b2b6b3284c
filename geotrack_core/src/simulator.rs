//! Movement Simulator - synthetic, paced movement for one object.
//!
//! A run walks `total_steps` steps of `step_meters` along a single random
//! bearing, one step per pacing interval. It is independent of the push
//! channels: each step is a [`LocationUpdate`] the controller submits to the
//! backend like any other relocation.
//!
//! ```text
//!  Δlat = step / 111000 · cos θ
//!  Δlng = step / 111000 · sin θ / cos(lat' · π / 180)     (lat' = advanced lat)
//! ```

use crate::config::SimulationConfig;
use crate::model::{Geofence, LatLng, LocationUpdate, ObjectId, TrackedObject};
use geotrack_env::TrackerContext;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, info};

/// Flat-earth conversion used for the step geometry.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Object {0} has no position yet")]
    MissingPosition(ObjectId),

    #[error("No geofence configured")]
    MissingGeofence,
}

/// Advances `from` by `step_meters` along `bearing` (radians, 0 = north).
pub fn advance(from: LatLng, bearing: f64, step_meters: f64) -> LatLng {
    let lat = from.lat + step_meters / METERS_PER_DEGREE * bearing.cos();
    let lng = from.lng
        + step_meters / METERS_PER_DEGREE * bearing.sin() / (lat * std::f64::consts::PI / 180.0).cos();
    LatLng::new(lat, lng)
}

/// One emitted step of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedStep {
    pub object_id: ObjectId,

    /// 1-based
    pub step_index: u32,

    pub position: LatLng,
}

impl SimulatedStep {
    pub fn update(&self) -> LocationUpdate {
        LocationUpdate {
            object_id: self.object_id,
            latitude: self.position.lat,
            longitude: self.position.lng,
        }
    }
}

/// The pure path of a run, without pacing.
#[derive(Debug, Clone)]
pub struct MovementPath {
    object_id: ObjectId,
    current: LatLng,
    bearing: f64,
    step_meters: f64,
    step_index: u32,
    total_steps: u32,
}

impl MovementPath {
    pub fn new(
        object_id: ObjectId,
        origin: LatLng,
        bearing: f64,
        step_meters: f64,
        total_steps: u32,
    ) -> Self {
        Self {
            object_id,
            current: origin,
            bearing,
            step_meters,
            step_index: 0,
            total_steps,
        }
    }
}

impl Iterator for MovementPath {
    type Item = SimulatedStep;

    fn next(&mut self) -> Option<SimulatedStep> {
        if self.step_index >= self.total_steps {
            return None;
        }
        self.current = advance(self.current, self.bearing, self.step_meters);
        self.step_index += 1;
        Some(SimulatedStep {
            object_id: self.object_id,
            step_index: self.step_index,
            position: self.current,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total_steps - self.step_index) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for MovementPath {}

/// Starts paced movement runs.
pub struct MovementSimulator<Ctx: TrackerContext> {
    ctx: Arc<Ctx>,
    config: SimulationConfig,
}

impl<Ctx: TrackerContext> MovementSimulator<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: SimulationConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Starts a run along a bearing drawn from the context.
    ///
    /// # Errors
    /// * `MissingPosition` - the object was never placed
    /// * `MissingGeofence` - no geofence is configured
    pub fn start(
        &self,
        object: &TrackedObject,
        geofence: Option<&Geofence>,
    ) -> Result<SimulationRun, SimulationError> {
        check_preconditions(object, geofence)?;
        let bearing = self.ctx.random_bearing();
        self.start_with_bearing(object, geofence, bearing)
    }

    /// Starts a run along a fixed bearing.
    pub fn start_with_bearing(
        &self,
        object: &TrackedObject,
        geofence: Option<&Geofence>,
        bearing: f64,
    ) -> Result<SimulationRun, SimulationError> {
        let origin = check_preconditions(object, geofence)?;
        let path = MovementPath::new(
            object.id,
            origin,
            bearing,
            self.config.step_meters,
            self.config.total_steps,
        );

        // Capacity 1: a step is produced only once the previous one is taken
        let (tx, rx) = mpsc::channel(1);
        let ctx = self.ctx.clone();
        let interval = self.config.interval();
        let object_id = object.id;

        info!(
            object = %object_id,
            bearing_deg = bearing.to_degrees(),
            steps = self.config.total_steps,
            "simulation started"
        );

        self.ctx.spawn(&format!("simulation-{object_id}"), async move {
            for step in path {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(object = %object_id, step = step.step_index, "simulation cancelled");
                        return;
                    }
                    _ = ctx.sleep(interval) => {}
                }
                if tx.send(step).await.is_err() {
                    return;
                }
            }
            debug!(object = %object_id, "simulation finished");
        });

        Ok(SimulationRun {
            object_id,
            bearing,
            origin,
            last: None,
            rx,
            cancelled: false,
        })
    }
}

fn check_preconditions(
    object: &TrackedObject,
    geofence: Option<&Geofence>,
) -> Result<LatLng, SimulationError> {
    let origin = object
        .position()
        .ok_or(SimulationError::MissingPosition(object.id))?;
    if geofence.is_none() {
        return Err(SimulationError::MissingGeofence);
    }
    Ok(origin)
}

/// Handle to one running simulation.
///
/// Yields steps as a [`Stream`]; ends after the last step or on cancel.
#[derive(Debug)]
pub struct SimulationRun {
    object_id: ObjectId,
    bearing: f64,
    origin: LatLng,
    last: Option<SimulatedStep>,
    rx: mpsc::Receiver<SimulatedStep>,
    cancelled: bool,
}

impl SimulationRun {
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn bearing(&self) -> f64 {
        self.bearing
    }

    /// Index of the last observed step (0 before the first).
    pub fn step_index(&self) -> u32 {
        self.last.map_or(0, |s| s.step_index)
    }

    /// Position of the last observed step, or the origin.
    pub fn position(&self) -> LatLng {
        self.last.map_or(self.origin, |s| s.position)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Stops the run. Buffered steps are discarded; nothing is yielded after
    /// this returns.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!(object = %self.object_id, at_step = self.step_index(), "simulation run cancelled");
    }

    pub async fn next(&mut self) -> Option<SimulatedStep> {
        std::future::poll_fn(|cx| self.poll_step(cx)).await
    }

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<SimulatedStep>> {
        if self.cancelled {
            return Poll::Ready(None);
        }
        let step = std::task::ready!(self.rx.poll_recv(cx));
        if let Some(step) = step {
            self.last = Some(step);
        }
        Poll::Ready(step)
    }
}

impl Stream for SimulationRun {
    type Item = SimulatedStep;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SimulatedStep>> {
        self.get_mut().poll_step(cx)
    }
}

impl Drop for SimulationRun {
    fn drop(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;
    use approx::assert_relative_eq;
    use geotrack_env::TokioContext;
    use std::time::Duration;

    fn placed(lat: f64, lng: f64) -> TrackedObject {
        TrackedObject {
            id: ObjectId(1),
            name: "Bike".into(),
            kind: ObjectKind::Bicycle,
            icon: None,
            latitude: Some(lat),
            longitude: Some(lng),
            outside_geofence: false,
        }
    }

    fn fence() -> Geofence {
        Geofence::new(LatLng::new(46.77, 23.59), 500.0)
    }

    #[test]
    fn test_north_step_geometry() {
        let next = advance(LatLng::new(46.77, 23.59), 0.0, 10.0);
        assert_relative_eq!(next.lat, 46.77 + 10.0 / 111_000.0, epsilon = 1e-12);
        assert_relative_eq!(next.lng, 23.59, epsilon = 1e-12);
    }

    #[test]
    fn test_east_step_uses_advanced_latitude() {
        let origin = LatLng::new(60.0, 10.0);
        let next = advance(origin, std::f64::consts::FRAC_PI_2, 111.0);
        assert_relative_eq!(next.lat, 60.0, epsilon = 1e-9);
        assert_relative_eq!(next.lng, 10.0 + 0.001 / 60f64.to_radians().cos(), epsilon = 1e-9);
    }

    #[test]
    fn test_path_is_bounded() {
        let path = MovementPath::new(ObjectId(1), LatLng::new(46.77, 23.59), 1.0, 10.0, 30);
        assert_eq!(path.len(), 30);
        let steps: Vec<_> = path.collect();
        assert_eq!(steps.last().unwrap().step_index, 30);
    }

    #[test]
    fn test_preconditions_fail_fast() {
        let ctx = TokioContext::shared();
        let sim = MovementSimulator::new(ctx, SimulationConfig::default());

        let mut unplaced = placed(0.0, 0.0);
        unplaced.latitude = None;
        assert_eq!(
            sim.start(&unplaced, Some(&fence())).unwrap_err(),
            SimulationError::MissingPosition(ObjectId(1))
        );
        assert_eq!(
            sim.start(&placed(46.77, 23.59), None).unwrap_err(),
            SimulationError::MissingGeofence
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_paced_and_bounded() {
        let ctx = TokioContext::shared();
        let config = SimulationConfig {
            total_steps: 3,
            ..SimulationConfig::default()
        };
        let sim = MovementSimulator::new(ctx, config);
        let started = tokio::time::Instant::now();

        let mut run = sim
            .start_with_bearing(&placed(46.77, 23.59), Some(&fence()), 0.0)
            .unwrap();

        let mut seen = Vec::new();
        while let Some(step) = run.next().await {
            seen.push((step.step_index, started.elapsed()));
        }

        assert_eq!(
            seen,
            vec![
                (1, Duration::from_millis(200)),
                (2, Duration::from_millis(400)),
                (3, Duration::from_millis(600)),
            ]
        );
        assert_eq!(run.step_index(), 3);
        assert_relative_eq!(run.position().lat, 46.77 + 30.0 / 111_000.0, epsilon = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_emission() {
        let ctx = TokioContext::shared();
        let sim = MovementSimulator::new(ctx, SimulationConfig::default());

        let mut run = sim
            .start_with_bearing(&placed(46.77, 23.59), Some(&fence()), 1.0)
            .unwrap();

        assert_eq!(run.next().await.unwrap().step_index, 1);
        // Let the producer buffer the next step
        tokio::time::sleep(Duration::from_millis(250)).await;

        run.cancel();
        assert!(run.is_cancelled());
        assert!(run.next().await.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(run.next().await.is_none());
        assert_eq!(run.step_index(), 1);
    }
}
