//! Location Streamer Library
//!
//! This library provides components for streaming device location telemetry
//! to an ingestion endpoint over mutual TLS:
//!
//! - **sample**: Raw location events, accepted samples and the wire payload
//! - **sampler**: Time and distance thresholds for admitting samples
//! - **queue**: Bounded retry queue with capped exponential backoff
//! - **publisher**: HTTPS publisher presenting a client certificate
//! - **certs**: Loading the client certificate bundle
//! - **controller**: Session state machine and background publish loop
//! - **source**: Contract for the device location provider
//! - **simulator**: Random-walk location source for development
//! - **status**: Status events for the presentation layer
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use location_streamer::config::Config;
//! use location_streamer::controller::{StartRequest, StreamController};
//! use location_streamer::publisher::HttpsPublisher;
//! use location_streamer::simulator::SimulatedSource;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Wire the source and publisher into a controller
//!     let controller = StreamController::new(
//!         Arc::new(SimulatedSource::with_defaults()),
//!         Arc::new(HttpsPublisher::new(&config)),
//!         config.queue_config(),
//!     );
//!
//!     // Watch status events
//!     let mut status = controller.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = status.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     // Stream until stopped
//!     let request = StartRequest::new(config.thresholds(), config.certificates.clone());
//!     controller.start(request).await.ok();
//!     controller.stop().await;
//! }
//! ```

// Module declarations
pub mod certs;
pub mod config;
pub mod controller;
pub mod publisher;
pub mod queue;
pub mod sample;
pub mod sampler;
pub mod simulator;
pub mod source;
pub mod status;

// Re-export commonly used types at crate root for convenience
pub use certs::{CertificateBundle, CertificateError, CertificatePaths};
pub use config::{Config, ConfigError};
pub use controller::{StartRequest, StreamController, StreamError, StreamStats};
pub use publisher::{HttpsPublisher, PublishOutcome, Publisher};
pub use queue::{QueueConfig, QueueStats, RetryPolicy, RetryQueue};
pub use sample::{LocationSample, RawLocation, SourceKind};
pub use sampler::{Sampler, SamplingThresholds};
pub use simulator::{SimulatedSource, SimulatorConfig};
pub use source::{LocationListener, LocationSource, SourceError, SourceStatus};
pub use status::{ErrorKind, StatusEvent, StreamState, TerminalOutcome};
