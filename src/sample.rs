//! Location sample types for the telemetry stream.
//!
//! This module defines the raw event shape delivered by a location source,
//! the accepted `LocationSample` value, and the JSON payload sent to the
//! ingestion endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Kind of provider that produced a location fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Gps,
    Network,
    Fused,
    Simulated,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Gps => write!(f, "gps"),
            SourceKind::Network => write!(f, "network"),
            SourceKind::Fused => write!(f, "fused"),
            SourceKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// A raw location event as delivered by the location source callback.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLocation {
    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Horizontal accuracy radius in meters
    pub accuracy: f64,

    /// Ground speed in meters per second, if the provider reports it
    pub speed: Option<f64>,

    /// Bearing in degrees from true north, if the provider reports it
    pub bearing: Option<f64>,

    /// Wall-clock time at which the provider captured the fix
    pub timestamp: DateTime<Utc>,

    /// Provider that produced the fix
    pub source_kind: SourceKind,
}

impl RawLocation {
    /// Create a raw event with no speed or bearing.
    pub fn new(
        latitude: f64,
        longitude: f64,
        accuracy: f64,
        timestamp: DateTime<Utc>,
        source_kind: SourceKind,
    ) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            speed: None,
            bearing: None,
            timestamp,
            source_kind,
        }
    }

    /// Attach speed and bearing readings.
    pub fn with_motion(mut self, speed: Option<f64>, bearing: Option<f64>) -> Self {
        self.speed = speed;
        self.bearing = bearing;
        self
    }

    /// Whether coordinates and accuracy are physically plausible.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.accuracy.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
            && self.accuracy >= 0.0
    }
}

/// Capture time of a sample: the provider's wall clock plus the local
/// monotonic instant at which the event was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedAt {
    pub wall: DateTime<Utc>,
    pub monotonic: Instant,
}

impl CapturedAt {
    pub fn new(wall: DateTime<Utc>, monotonic: Instant) -> Self {
        Self { wall, monotonic }
    }
}

impl PartialOrd for CapturedAt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CapturedAt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wall
            .cmp(&other.wall)
            .then_with(|| self.monotonic.cmp(&other.monotonic))
    }
}

/// A filtered location reading accepted by the sampler.
///
/// Samples are immutable once created; the retry queue clones them into
/// publish attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub captured_at: CapturedAt,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub source_kind: SourceKind,
}

impl LocationSample {
    /// Build a sample from a raw event received at `received_at`.
    pub fn from_raw(raw: &RawLocation, received_at: Instant) -> Self {
        Self {
            captured_at: CapturedAt::new(raw.timestamp, received_at),
            latitude: raw.latitude,
            longitude: raw.longitude,
            accuracy: raw.accuracy,
            speed: raw.speed,
            bearing: raw.bearing,
            source_kind: raw.source_kind,
        }
    }

    /// Great-circle distance to another position, in meters.
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        haversine_distance(self.latitude, self.longitude, latitude, longitude)
    }

    /// Wire payload for the ingestion endpoint.
    pub fn payload(&self) -> SamplePayload {
        SamplePayload {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            speed: self.speed,
            bearing: self.bearing,
            timestamp: self.captured_at.wall,
        }
    }
}

/// JSON body posted to the ingestion endpoint for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePayload {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,

    pub timestamp: DateTime<Utc>,
}

/// Haversine great-circle distance between two coordinates, in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
