//! Simulated location source for development and testing.
//!
//! Produces a random-walk GPS track around a configurable origin, emitting one
//! fix per tick on a background tokio task. Fix accuracy varies per tick and
//! the provider can be made to drop out occasionally, so the streamer sees the
//! same kinds of events a real device would deliver.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sample::{RawLocation, SourceKind};
use crate::sampler::SamplingThresholds;
use crate::source::{
    CapabilityGrant, CapabilityKind, LocationSink, LocationSource, SourceError, SourceStatus,
    SourceStatusKind,
};

/// Meters per degree of latitude, close enough for a short walk.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Largest bearing change between consecutive fixes, in degrees.
const MAX_TURN_DEGREES: f64 = 30.0;

/// Configuration for the simulated source.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Starting latitude in degrees
    pub origin_latitude: f64,

    /// Starting longitude in degrees
    pub origin_longitude: f64,

    /// Time between fixes
    pub tick: Duration,

    /// Largest displacement per tick in meters
    pub max_step_meters: f64,

    /// Range of reported accuracy radii in meters
    pub accuracy_range: (f64, f64),

    /// Probability (0.0 - 1.0) that a tick has no fix
    pub dropout_rate: f64,

    /// Answer given to capability requests
    pub grant: CapabilityGrant,

    /// Whether the provider can be started at all
    pub available: bool,

    /// Seed for a reproducible track
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            origin_latitude: 41.0082,
            origin_longitude: 28.9784,
            tick: Duration::from_millis(500),
            max_step_meters: 15.0,
            accuracy_range: (3.0, 25.0),
            dropout_rate: 0.02,
            grant: CapabilityGrant::Granted,
            available: true,
            seed: None,
        }
    }
}

/// Random-walk track generator.
///
/// Each step turns by up to `MAX_TURN_DEGREES` and moves up to
/// `max_step_meters`, so consecutive fixes trace a plausible path.
#[derive(Debug)]
pub struct RandomWalk {
    latitude: f64,
    longitude: f64,
    bearing: f64,
    max_step_meters: f64,
    accuracy_range: (f64, f64),
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(config: &SimulatorConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let bearing = rng.gen_range(0.0..360.0);

        Self {
            latitude: config.origin_latitude,
            longitude: config.origin_longitude,
            bearing,
            max_step_meters: config.max_step_meters.max(0.0),
            accuracy_range: config.accuracy_range,
            rng,
        }
    }

    /// Advance one tick and return the new fix.
    pub fn step(&mut self, tick: Duration) -> RawLocation {
        let turn = self.rng.gen_range(-MAX_TURN_DEGREES..=MAX_TURN_DEGREES);
        self.bearing = (self.bearing + turn).rem_euclid(360.0);

        let distance = if self.max_step_meters > 0.0 {
            self.rng.gen_range(0.0..=self.max_step_meters)
        } else {
            0.0
        };

        let radians = self.bearing.to_radians();
        let north = distance * radians.cos();
        let east = distance * radians.sin();

        self.latitude = (self.latitude + north / METERS_PER_DEGREE).clamp(-90.0, 90.0);
        let meters_per_degree_lon = METERS_PER_DEGREE * self.latitude.to_radians().cos().max(1e-6);
        self.longitude = wrap_longitude(self.longitude + east / meters_per_degree_lon);

        let (low, high) = self.accuracy_range;
        let accuracy = if high > low {
            self.rng.gen_range(low..high)
        } else {
            low.max(0.0)
        };

        let seconds = tick.as_secs_f64();
        let speed = if seconds > 0.0 {
            Some(distance / seconds)
        } else {
            None
        };

        RawLocation::new(
            self.latitude,
            self.longitude,
            accuracy,
            Utc::now(),
            SourceKind::Simulated,
        )
        .with_motion(speed, Some(self.bearing))
    }

    fn dropout(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate.min(1.0))
    }
}

fn wrap_longitude(longitude: f64) -> f64 {
    (longitude + 180.0).rem_euclid(360.0) - 180.0
}

/// Location source backed by `RandomWalk`.
///
/// The walk outlives individual start/stop cycles, so a restarted source
/// continues from its last position.
pub struct SimulatedSource {
    config: SimulatorConfig,
    walk: Arc<Mutex<RandomWalk>>,
    running: Mutex<Option<CancellationToken>>,
}

impl SimulatedSource {
    pub fn new(config: SimulatorConfig) -> Self {
        let walk = Arc::new(Mutex::new(RandomWalk::new(&config)));
        Self {
            config,
            walk,
            running: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl LocationSource for SimulatedSource {
    async fn request_capability(&self, kind: CapabilityKind) -> CapabilityGrant {
        debug!(kind = ?kind, grant = ?self.config.grant, "Capability requested");
        self.config.grant
    }

    fn start(&self, thresholds: SamplingThresholds, sink: LocationSink) -> Result<(), SourceError> {
        if !self.config.available {
            return Err(SourceError::Unavailable(
                "simulated provider is disabled".to_string(),
            ));
        }

        let mut running = self.running.lock();
        if let Some(previous) = running.take() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());

        tokio::spawn(run_walk(
            self.walk.clone(),
            self.config.tick,
            self.config.dropout_rate,
            sink,
            cancel,
        ));

        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            min_interval_ms = thresholds.min_interval.as_millis() as u64,
            min_distance_m = thresholds.min_distance,
            "Simulated location source started"
        );
        Ok(())
    }

    fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
            info!("Simulated location source stopped");
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        if let Some(cancel) = self.running.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// Emit fixes on every tick until cancelled.
async fn run_walk(
    walk: Arc<Mutex<RandomWalk>>,
    tick: Duration,
    dropout_rate: f64,
    sink: LocationSink,
    cancel: CancellationToken,
) {
    let mut ticker = interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut unavailable = false;
    let mut fixes: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Guard released before the sink runs
        let fix = {
            let mut walk = walk.lock();
            if walk.dropout(dropout_rate) {
                None
            } else {
                Some(walk.step(tick))
            }
        };

        let Some(fix) = fix else {
            if !unavailable {
                unavailable = true;
                sink.on_status(SourceStatus::new(
                    SourceStatusKind::Unavailable,
                    "simulated fix lost",
                ));
            }
            continue;
        };

        if unavailable {
            unavailable = false;
            sink.on_status(SourceStatus::new(
                SourceStatusKind::Available,
                "simulated fix recovered",
            ));
        }

        sink.on_location(fix);
        fixes += 1;
    }

    debug!(fixes = fixes, "Random walk finished");
}
