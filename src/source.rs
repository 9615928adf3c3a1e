//! Location source contract.
//!
//! The location hardware and the platform permission flow live outside this
//! crate. They are consumed through `LocationSource`: a one-shot capability
//! request, `start`/`stop` commands, and a listener that receives raw fixes
//! and provider status events from the source's own thread or task.

use std::future::Future;
use std::sync::Arc;

use crate::sample::RawLocation;
use crate::sampler::SamplingThresholds;
use crate::status::ErrorKind;

/// Capability a source may need the platform to grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Fine or coarse device location
    Location,
}

/// Answer to a capability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityGrant {
    Granted,
    Denied,
}

/// Provider-level status reported alongside fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatusKind {
    /// The provider was switched off or lost its fix
    Unavailable,

    /// The platform revoked access while running
    PermissionDenied,

    /// The provider is delivering fixes again
    Available,
}

/// Status event from a running source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub kind: SourceStatusKind,
    pub message: String,
}

impl SourceStatus {
    pub fn new(kind: SourceStatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Reasons a source refuses to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Access to location was not granted
    PermissionDenied(String),

    /// No provider is available on this device
    Unavailable(String),
}

impl SourceError {
    /// Taxonomy kind reported in status events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SourceError::Unavailable(_) => ErrorKind::LocationUnavailable,
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::PermissionDenied(msg) => write!(f, "Location permission denied: {}", msg),
            SourceError::Unavailable(msg) => write!(f, "Location provider unavailable: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// Receives events from a running source.
///
/// Implementations must return quickly; they are called on the source's
/// delivery path.
pub trait LocationListener: Send + Sync {
    fn on_location(&self, raw: RawLocation);

    fn on_status(&self, status: SourceStatus);
}

/// Shared handle a source delivers its events to.
pub type LocationSink = Arc<dyn LocationListener>;

/// A device location provider.
pub trait LocationSource: Send + Sync + 'static {
    /// Ask the platform for a capability. Resolves once with the answer.
    fn request_capability(
        &self,
        kind: CapabilityKind,
    ) -> impl Future<Output = CapabilityGrant> + Send;

    /// Begin delivering fixes to `sink` using the given provider hints.
    fn start(&self, thresholds: SamplingThresholds, sink: LocationSink) -> Result<(), SourceError>;

    /// Stop delivering fixes and release the hardware subscription.
    fn stop(&self);
}
