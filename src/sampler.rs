//! Sampling policy for raw location events.
//!
//! The sampler admits a raw event only when both the configured minimum
//! interval and minimum distance have been covered since the last accepted
//! sample. The first event of a session is always admitted.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::sample::{LocationSample, RawLocation};

/// Thresholds a raw event must satisfy relative to the last accepted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingThresholds {
    /// Minimum wall time between accepted samples
    pub min_interval: Duration,

    /// Minimum great-circle displacement in meters; zero disables the check
    pub min_distance: f64,
}

impl SamplingThresholds {
    pub fn new(min_interval: Duration, min_distance: f64) -> Self {
        Self {
            min_interval,
            min_distance: min_distance.max(0.0),
        }
    }
}

impl Default for SamplingThresholds {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 0.0)
    }
}

/// Why a raw event was not turned into a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Coordinates or accuracy out of range
    Invalid,

    /// Timestamp earlier than the last accepted sample
    OutOfOrder,

    /// Same timestamp and position as the last accepted sample
    Duplicate,

    /// Not enough time has elapsed
    TooSoon,

    /// Not enough distance has been covered
    TooClose,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Invalid => write!(f, "invalid coordinates"),
            Rejection::OutOfOrder => write!(f, "timestamp before last accepted sample"),
            Rejection::Duplicate => write!(f, "duplicate of last accepted sample"),
            Rejection::TooSoon => write!(f, "minimum interval not reached"),
            Rejection::TooClose => write!(f, "minimum distance not reached"),
        }
    }
}

/// Decide whether `candidate` may follow `previous`.
///
/// This is the pure admission rule; `Sampler` wraps it with the per-session
/// memory of the last accepted sample.
pub fn admit(
    previous: Option<&LocationSample>,
    candidate: &RawLocation,
    thresholds: &SamplingThresholds,
) -> Result<(), Rejection> {
    if !candidate.is_valid() {
        return Err(Rejection::Invalid);
    }

    let Some(previous) = previous else {
        return Ok(());
    };

    let last_wall = previous.captured_at.wall;
    if candidate.timestamp < last_wall {
        return Err(Rejection::OutOfOrder);
    }

    if candidate.timestamp == last_wall
        && candidate.latitude == previous.latitude
        && candidate.longitude == previous.longitude
    {
        return Err(Rejection::Duplicate);
    }

    // Non-negative because of the ordering check above
    let elapsed = (candidate.timestamp - last_wall)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed < thresholds.min_interval {
        return Err(Rejection::TooSoon);
    }

    if thresholds.min_distance > 0.0
        && previous.distance_to(candidate.latitude, candidate.longitude) < thresholds.min_distance
    {
        return Err(Rejection::TooClose);
    }

    Ok(())
}

/// Per-session sampler holding the last accepted sample.
#[derive(Debug, Clone)]
pub struct Sampler {
    thresholds: SamplingThresholds,
    last: Option<LocationSample>,
    accepted: u64,
    filtered: u64,
}

impl Sampler {
    pub fn new(thresholds: SamplingThresholds) -> Self {
        Self {
            thresholds,
            last: None,
            accepted: 0,
            filtered: 0,
        }
    }

    /// Filter a raw event, stamping accepted samples with the current
    /// monotonic time.
    pub fn on_location(&mut self, raw: &RawLocation) -> Option<LocationSample> {
        self.on_location_at(raw, Instant::now())
    }

    /// Filter a raw event received at `received_at`.
    pub fn on_location_at(
        &mut self,
        raw: &RawLocation,
        received_at: Instant,
    ) -> Option<LocationSample> {
        match admit(self.last.as_ref(), raw, &self.thresholds) {
            Ok(()) => {
                let sample = LocationSample::from_raw(raw, received_at);
                self.last = Some(sample.clone());
                self.accepted += 1;
                Some(sample)
            }
            Err(reason) => {
                self.filtered += 1;
                debug!(
                    reason = %reason,
                    timestamp = %raw.timestamp,
                    "Location event filtered"
                );
                None
            }
        }
    }

    pub fn thresholds(&self) -> &SamplingThresholds {
        &self.thresholds
    }

    /// Last accepted sample, if any.
    pub fn last(&self) -> Option<&LocationSample> {
        self.last.as_ref()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn filtered(&self) -> u64 {
        self.filtered
    }
}
