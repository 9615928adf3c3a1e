//! Stream controller: session state machine and background publish loop.
//!
//! The controller owns at most one `StreamSession` at a time. Starting a
//! session loads the certificate bundle, asks for the location capability,
//! spawns the publish loop and finally starts the location source. Events
//! from the source flow through the session's sampler into its retry queue;
//! the publish loop is the queue's only consumer and the publisher's only
//! caller, so at most one publish is in flight per session.
//!
//! ```text
//!   Idle ──start──▶ Active ──pause──▶ Paused
//!     │               ▲  │              │
//!     │               └──┼───resume─────┘
//!     │                  │
//!     └──failure──▶ Error ◀──failure── (any non-terminal)
//!
//!   any ──stop──▶ Stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::certs::{CertificateBundle, CertificateError, CertificatePaths};
use crate::publisher::Publisher;
use crate::queue::{Disposition, QueueConfig, QueueStats, RetryQueue};
use crate::sample::RawLocation;
use crate::sampler::{Sampler, SamplingThresholds};
use crate::source::{
    CapabilityGrant, CapabilityKind, LocationListener, LocationSink, LocationSource, SourceError,
    SourceStatus, SourceStatusKind,
};
use crate::status::{
    ErrorKind, StatusError, StatusEvent, StatusReporter, StreamState, TerminalOutcome,
};

/// Parameters for a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub thresholds: SamplingThresholds,
    pub certificates: CertificatePaths,
}

impl StartRequest {
    pub fn new(thresholds: SamplingThresholds, certificates: CertificatePaths) -> Self {
        Self {
            thresholds,
            certificates,
        }
    }
}

/// Errors returned by controller operations.
#[derive(Debug)]
pub enum StreamError {
    /// The operation is not valid in the current state
    InvalidTransition {
        from: StreamState,
        operation: &'static str,
    },

    /// The certificate bundle could not be loaded
    Certificate(CertificateError),

    /// The location source refused to start or access was denied
    Source(SourceError),
}

impl StreamError {
    /// Taxonomy kind, for errors that put the session into `Error`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StreamError::InvalidTransition { .. } => None,
            StreamError::Certificate(_) => Some(ErrorKind::CertificateLoadFailure),
            StreamError::Source(e) => Some(e.kind()),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::InvalidTransition { from, operation } => {
                write!(f, "Cannot {} a stream that is {}", operation, from)
            }
            StreamError::Certificate(e) => write!(f, "Certificate load failed: {}", e),
            StreamError::Source(e) => write!(f, "Location source failed: {}", e),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Certificate(e) => Some(e),
            StreamError::Source(e) => Some(e),
            StreamError::InvalidTransition { .. } => None,
        }
    }
}

impl From<CertificateError> for StreamError {
    fn from(err: CertificateError) -> Self {
        StreamError::Certificate(err)
    }
}

impl From<SourceError> for StreamError {
    fn from(err: SourceError) -> Self {
        StreamError::Source(err)
    }
}

/// Statistics about one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Raw events turned into samples
    pub samples_accepted: u64,

    /// Raw events filtered out by the sampler
    pub samples_filtered: u64,

    /// Samples currently waiting in the retry queue
    pub queued: usize,

    /// Retry queue counters
    pub queue: QueueStats,
}

/// One logical run of streaming, from `start` to `stop`.
///
/// Shared between the controller, the publish loop and the source's listener
/// handle. Only the controller changes `state`.
pub struct StreamSession {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    thresholds: SamplingThresholds,
    bundle: CertificateBundle,
    state: Mutex<StreamState>,
    accepting: AtomicBool,
    sampler: Mutex<Sampler>,
    queue: Mutex<RetryQueue>,
    wake: Notify,
    reporter: StatusReporter,
}

impl StreamSession {
    fn new(
        thresholds: SamplingThresholds,
        bundle: CertificateBundle,
        queue: RetryQueue,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            thresholds,
            bundle,
            state: Mutex::new(StreamState::Idle),
            accepting: AtomicBool::new(false),
            sampler: Mutex::new(Sampler::new(thresholds)),
            queue: Mutex::new(queue),
            wake: Notify::new(),
            reporter,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn thresholds(&self) -> &SamplingThresholds {
        &self.thresholds
    }

    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    fn stats(&self) -> StreamStats {
        let (samples_accepted, samples_filtered) = {
            let sampler = self.sampler.lock();
            (sampler.accepted(), sampler.filtered())
        };
        let queue = self.queue.lock();

        StreamStats {
            samples_accepted,
            samples_filtered,
            queued: queue.len(),
            queue: queue.stats().clone(),
        }
    }

    fn event(&self) -> StatusEvent {
        StatusEvent::transition(Some(self.session_id), self.state())
    }

    fn report_error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.reporter
            .emit(self.event().with_error(StatusError::new(kind, message)));
    }

    /// Report a settled attempt. Retries are not terminal and only logged.
    fn report_disposition(&self, disposition: Disposition) {
        let event = match disposition {
            Disposition::Retrying {
                delay,
                next_retry_at: _,
            } => {
                debug!(
                    session_id = %self.session_id,
                    delay_ms = delay.as_millis() as u64,
                    "Sample scheduled for retry"
                );
                return;
            }
            Disposition::Delivered { attempt, status } => {
                self.event().with_outcome(TerminalOutcome::Delivered {
                    status,
                    attempts: attempt.attempt_count,
                })
            }
            Disposition::Rejected {
                attempt: _,
                status,
                body,
            } => self
                .event()
                .with_outcome(TerminalOutcome::Rejected {
                    status,
                    body: body.clone(),
                })
                .with_error(StatusError::new(
                    ErrorKind::ServerRejected,
                    format!("endpoint rejected sample with status {}: {}", status, body),
                )),
            Disposition::Exhausted { attempt } => self
                .event()
                .with_outcome(TerminalOutcome::RetriesExhausted {
                    attempts: attempt.attempt_count,
                })
                .with_error(StatusError::new(
                    ErrorKind::NetworkTransient,
                    attempt
                        .last_error
                        .unwrap_or_else(|| "retry budget exhausted".to_string()),
                )),
            Disposition::HandshakeFailed { attempt } => self
                .event()
                .with_outcome(TerminalOutcome::HandshakeFailed)
                .with_error(StatusError::new(
                    ErrorKind::TlsHandshakeFailure,
                    attempt
                        .last_error
                        .unwrap_or_else(|| "TLS handshake failed".to_string()),
                )),
        };

        self.reporter.emit(event);
    }
}

impl LocationListener for StreamSession {
    fn on_location(&self, raw: RawLocation) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "Location event ignored while not active");
            return;
        }

        let Some(sample) = self.sampler.lock().on_location(&raw) else {
            return;
        };

        let evicted = self.queue.lock().enqueue(sample, Instant::now());
        self.wake.notify_one();

        if let Some(evicted) = evicted {
            self.reporter.emit(
                self.event()
                    .with_outcome(TerminalOutcome::Evicted)
                    .with_error(StatusError::new(
                        ErrorKind::QueueOverflow,
                        format!(
                            "dropped sample captured at {} after {} failed attempts",
                            evicted.sample.captured_at.wall, evicted.attempt_count
                        ),
                    )),
            );
        }
    }

    fn on_status(&self, status: SourceStatus) {
        match status.kind {
            SourceStatusKind::Available => {
                info!(session_id = %self.session_id, message = %status.message, "Location provider available");
            }
            SourceStatusKind::Unavailable => {
                self.report_error(ErrorKind::LocationUnavailable, status.message);
            }
            SourceStatusKind::PermissionDenied => {
                self.report_error(ErrorKind::PermissionDenied, status.message);
            }
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

/// Drain the session's queue through the publisher until cancelled.
async fn publish_loop<P: Publisher>(
    session: Arc<StreamSession>,
    publisher: Arc<P>,
    cancel: CancellationToken,
) {
    info!(session_id = %session.session_id, "Publish loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (ready, deadline) = {
            let mut queue = session.queue.lock();
            match queue.dequeue_ready(Instant::now()) {
                Some(attempt) => (Some(attempt), None),
                None => (None, queue.next_deadline()),
            }
        };

        let Some(attempt) = ready else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = session.wake.notified() => {}
                _ = wait_until(deadline) => {}
            }
            continue;
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = publisher.publish(&attempt.sample, &session.bundle) => outcome,
        };

        if cancel.is_cancelled() {
            break;
        }

        let disposition = session
            .queue
            .lock()
            .requeue(attempt, &outcome, Instant::now());
        session.report_disposition(disposition);
    }

    info!(session_id = %session.session_id, "Publish loop stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

struct ActiveSession {
    session: Arc<StreamSession>,
    cancel: CancellationToken,
    publish_loop: JoinHandle<()>,
}

struct ControllerInner {
    state: StreamState,
    active: Option<ActiveSession>,
    source_running: bool,
    last_session_id: Option<Uuid>,
    final_stats: Option<StreamStats>,
}

/// Drives one stream at a time through its lifecycle.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use location_streamer::config::Config;
/// use location_streamer::controller::{StartRequest, StreamController};
/// use location_streamer::publisher::HttpsPublisher;
/// use location_streamer::simulator::SimulatedSource;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let controller = StreamController::new(
///         Arc::new(SimulatedSource::with_defaults()),
///         Arc::new(HttpsPublisher::new(&config)),
///         config.queue_config(),
///     );
///
///     let request = StartRequest::new(config.thresholds(), config.certificates.clone());
///     controller.start(request).await.expect("Failed to start stream");
///     controller.stop().await;
/// }
/// ```
pub struct StreamController<S: LocationSource, P: Publisher> {
    source: Arc<S>,
    publisher: Arc<P>,
    queue_config: QueueConfig,
    jitter_seed: Option<u64>,
    reporter: StatusReporter,
    inner: tokio::sync::Mutex<ControllerInner>,
}

impl<S: LocationSource, P: Publisher> StreamController<S, P> {
    pub fn new(source: Arc<S>, publisher: Arc<P>, queue_config: QueueConfig) -> Self {
        Self {
            source,
            publisher,
            queue_config,
            jitter_seed: None,
            reporter: StatusReporter::default(),
            inner: tokio::sync::Mutex::new(ControllerInner {
                state: StreamState::Idle,
                active: None,
                source_running: false,
                last_session_id: None,
                final_stats: None,
            }),
        }
    }

    /// Use a fixed seed for retry jitter, making backoff reproducible.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Subscribe to status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.reporter.subscribe()
    }

    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state
    }

    /// Id of the current session, or of the last one once stopped.
    pub async fn session_id(&self) -> Option<Uuid> {
        self.inner.lock().await.last_session_id
    }

    /// Number of samples waiting for delivery.
    pub async fn queue_len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .map(|active| active.session.queue.lock().len())
            .unwrap_or(0)
    }

    /// Statistics for the current session, or the last one once stopped.
    pub async fn stats(&self) -> Option<StreamStats> {
        let inner = self.inner.lock().await;
        match &inner.active {
            Some(active) => Some(active.session.stats()),
            None => inner.final_stats.clone(),
        }
    }

    /// Begin a new session: `Idle` or `Error` → `Active`.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidTransition` from any other state. A
    /// certificate, capability or source failure moves the controller to
    /// `Error` and is returned as well.
    pub async fn start(&self, request: StartRequest) -> Result<Uuid, StreamError> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            StreamState::Idle | StreamState::Error => {}
            from => {
                return Err(StreamError::InvalidTransition {
                    from,
                    operation: "start",
                })
            }
        }

        let bundle = match CertificateBundle::load(&request.certificates) {
            Ok(bundle) => bundle,
            Err(e) => {
                let err = StreamError::from(e);
                self.enter_error(&mut inner, None, &err);
                return Err(err);
            }
        };

        if self.source.request_capability(CapabilityKind::Location).await == CapabilityGrant::Denied
        {
            let err = StreamError::Source(SourceError::PermissionDenied(
                "location capability was not granted".to_string(),
            ));
            self.enter_error(&mut inner, None, &err);
            return Err(err);
        }

        let queue = match self.jitter_seed {
            Some(seed) => RetryQueue::with_seed(self.queue_config, seed),
            None => RetryQueue::new(self.queue_config),
        };
        let session = Arc::new(StreamSession::new(
            request.thresholds,
            bundle,
            queue,
            self.reporter.clone(),
        ));
        let session_id = session.session_id;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(publish_loop(
            session.clone(),
            self.publisher.clone(),
            cancel.clone(),
        ));

        session.set_state(StreamState::Active);
        session.set_accepting(true);

        let sink: LocationSink = session.clone();
        if let Err(e) = self.source.start(request.thresholds, sink) {
            session.set_accepting(false);
            cancel.cancel();
            let _ = handle.await;

            let err = StreamError::from(e);
            self.enter_error(&mut inner, Some(session_id), &err);
            return Err(err);
        }

        info!(
            session_id = %session_id,
            min_interval_ms = request.thresholds.min_interval.as_millis() as u64,
            min_distance_m = request.thresholds.min_distance,
            "Stream started"
        );

        inner.state = StreamState::Active;
        inner.source_running = true;
        inner.last_session_id = Some(session_id);
        inner.final_stats = None;
        inner.active = Some(ActiveSession {
            session,
            cancel,
            publish_loop: handle,
        });

        self.reporter
            .emit(StatusEvent::transition(Some(session_id), StreamState::Active));
        Ok(session_id)
    }

    /// Stop sampling but keep draining the queue: `Active` → `Paused`.
    pub async fn pause(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;

        if inner.state != StreamState::Active {
            return Err(StreamError::InvalidTransition {
                from: inner.state,
                operation: "pause",
            });
        }

        if inner.source_running {
            self.source.stop();
            inner.source_running = false;
        }

        inner.state = StreamState::Paused;
        if let Some(active) = &inner.active {
            active.session.set_accepting(false);
            active.session.set_state(StreamState::Paused);
            active.session.wake.notify_one();
            info!(session_id = %active.session.session_id, "Stream paused");
            self.reporter.emit(active.session.event());
        }

        Ok(())
    }

    /// Restart sampling with the session's original thresholds:
    /// `Paused` → `Active`.
    ///
    /// # Errors
    ///
    /// If the source refuses to restart the session is torn down and the
    /// controller enters `Error`.
    pub async fn resume(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;

        if inner.state != StreamState::Paused {
            return Err(StreamError::InvalidTransition {
                from: inner.state,
                operation: "resume",
            });
        }

        let Some(session) = inner.active.as_ref().map(|a| a.session.clone()) else {
            return Err(StreamError::InvalidTransition {
                from: inner.state,
                operation: "resume",
            });
        };

        session.set_accepting(true);
        let sink: LocationSink = session.clone();
        if let Err(e) = self.source.start(session.thresholds, sink) {
            session.set_accepting(false);
            self.teardown(&mut inner).await;

            let err = StreamError::from(e);
            self.enter_error(&mut inner, Some(session.session_id), &err);
            return Err(err);
        }

        inner.source_running = true;
        inner.state = StreamState::Active;
        session.set_state(StreamState::Active);
        session.wake.notify_one();
        info!(session_id = %session.session_id, "Stream resumed");
        self.reporter.emit(session.event());

        Ok(())
    }

    /// End the session: any state → `Stopped`. Idempotent.
    ///
    /// Cancels any in-flight publish, discards queued samples and releases
    /// the certificate bundle.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;

        if inner.state == StreamState::Stopped {
            return;
        }

        if inner.source_running {
            self.source.stop();
            inner.source_running = false;
        }

        self.teardown(&mut inner).await;
        inner.state = StreamState::Stopped;

        info!(session_id = ?inner.last_session_id, "Stream stopped");
        self.reporter.emit(StatusEvent::transition(
            inner.last_session_id,
            StreamState::Stopped,
        ));
    }

    /// Cancel the publish loop, discard the queue and drop the session.
    async fn teardown(&self, inner: &mut ControllerInner) {
        let Some(active) = inner.active.take() else {
            return;
        };

        active.session.set_accepting(false);
        active.cancel.cancel();
        if let Err(e) = active.publish_loop.await {
            warn!(error = %e, "Publish loop ended abnormally");
        }

        let discarded = active.session.queue.lock().clear();
        if discarded > 0 {
            info!(
                session_id = %active.session.session_id,
                discarded = discarded,
                "Discarded queued samples"
            );
        }

        inner.final_stats = Some(active.session.stats());
    }

    fn enter_error(&self, inner: &mut ControllerInner, session_id: Option<Uuid>, err: &StreamError) {
        warn!(session_id = ?session_id, error = %err, "Stream entered error state");

        inner.state = StreamState::Error;
        if session_id.is_some() {
            inner.last_session_id = session_id;
        }

        let mut event = StatusEvent::transition(session_id, StreamState::Error);
        if let Some(kind) = err.kind() {
            event = event.with_error(StatusError::new(kind, err.to_string()));
        }
        self.reporter.emit(event);
    }
}
