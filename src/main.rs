//! Location Streamer - device location telemetry over mutual TLS
//!
//! This service samples positions from a location source, queues them with
//! bounded retries, and publishes each sample to an HTTPS ingestion endpoint
//! presenting a client certificate.
//!
//! ## Features
//!
//! - Time and distance based sampling
//! - Retry queue with capped exponential backoff and drop-oldest overflow
//! - Mutual TLS with a pinned trusted root
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOCATION_STREAMER_ENDPOINT_URL`: Ingestion endpoint (required, https only)
//! - `LOCATION_STREAMER_CERT_PATH`: Client certificate (default: certs/client.pem.crt)
//! - `LOCATION_STREAMER_KEY_PATH`: Client private key (default: certs/client.pem.key)
//! - `LOCATION_STREAMER_ROOT_CA_PATH`: Trusted root (default: certs/root-ca.pem)
//! - `LOCATION_STREAMER_MIN_INTERVAL_MS`: Minimum time between samples (default: 1000)
//! - `LOCATION_STREAMER_MIN_DISTANCE_M`: Minimum displacement, 0 disables (default: 0)
//! - `LOCATION_STREAMER_RETRY_BUDGET`: Retries per sample (default: 5)
//! - `LOCATION_STREAMER_MAX_BACKOFF_SECS`: Backoff cap (default: 30)
//! - `LOCATION_STREAMER_QUEUE_CAPACITY`: Queued samples (default: 50)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use location_streamer::config::Config;
use location_streamer::controller::{StartRequest, StreamController};
use location_streamer::publisher::HttpsPublisher;
use location_streamer::simulator::SimulatedSource;
use location_streamer::status::StatusEvent;

/// Time allowed for the controller to stop before giving up
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Location Streamer...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint_url = %config.endpoint_url,
                min_interval_ms = config.min_interval.as_millis() as u64,
                min_distance_m = config.min_distance,
                retry_budget = config.retry_budget,
                queue_capacity = config.queue_capacity,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let publisher = Arc::new(HttpsPublisher::new(&config));
    let source = Arc::new(SimulatedSource::with_defaults());
    let controller = StreamController::new(source, publisher, config.queue_config());

    let status_handle = tokio::spawn(log_status(controller.subscribe()));

    let request = StartRequest::new(config.thresholds(), config.certificates.clone());
    match controller.start(request).await {
        Ok(session_id) => {
            info!(session_id = %session_id, "Streaming. Press Ctrl+C to stop.");
        }
        Err(e) => {
            error!(error = %e, "Failed to start location stream");
            controller.stop().await;
            status_handle.abort();
            std::process::exit(1);
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    match tokio::time::timeout(shutdown_timeout, controller.stop()).await {
        Ok(()) => {
            if let Some(stats) = controller.stats().await {
                info!(
                    accepted = stats.samples_accepted,
                    filtered = stats.samples_filtered,
                    delivered = stats.queue.delivered,
                    rejected = stats.queue.rejected,
                    failed = stats.queue.failed,
                    evicted = stats.queue.evicted,
                    discarded = stats.queue.discarded,
                    "Session summary"
                );
            }
        }
        Err(_) => {
            warn!("Stream shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    status_handle.abort();
    info!("Location Streamer stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Log status events until the channel closes.
async fn log_status(mut rx: broadcast::Receiver<StatusEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match (&event.last_outcome, &event.last_error) {
                (_, Some(err)) => {
                    warn!(
                        state = %event.state,
                        kind = %err.kind,
                        message = %err.message,
                        "Stream problem"
                    );
                }
                (Some(outcome), None) => {
                    info!(state = %event.state, outcome = ?outcome, "Sample settled");
                }
                (None, None) => {
                    info!(session_id = ?event.session_id, state = %event.state, "Stream state changed");
                }
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed = missed, "Status listener fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_timeout() {
        assert!(SHUTDOWN_TIMEOUT_SECS > 0);
        assert!(SHUTDOWN_TIMEOUT_SECS <= 60);
    }
}
