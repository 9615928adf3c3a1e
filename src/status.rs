//! Status reporting for the presentation layer.
//!
//! Every state transition and every terminal publish outcome is emitted as a
//! `StatusEvent` on a broadcast channel. Subscribers that fall behind lose the
//! oldest events; the stream itself never blocks on a slow subscriber.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of buffered status events per subscriber.
const DEFAULT_STATUS_CAPACITY: usize = 256;

/// Lifecycle state of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Active,
    Paused,
    Stopped,
    Error,
}

impl StreamState {
    /// Whether no further transitions other than a fresh `start` apply.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Active => write!(f, "active"),
            StreamState::Paused => write!(f, "paused"),
            StreamState::Stopped => write!(f, "stopped"),
            StreamState::Error => write!(f, "error"),
        }
    }
}

/// Error taxonomy surfaced through status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Location source refused to start
    PermissionDenied,

    /// Transient provider fault; no sample produced
    LocationUnavailable,

    /// Client certificate, key or trusted root could not be loaded
    CertificateLoadFailure,

    /// TLS handshake or server trust failure
    TlsHandshakeFailure,

    /// Timeout, connection failure, 5xx or 429
    NetworkTransient,

    /// Non-retriable 4xx response
    ServerRejected,

    /// Oldest queued attempt evicted to make room
    QueueOverflow,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::PermissionDenied => write!(f, "permission denied"),
            ErrorKind::LocationUnavailable => write!(f, "location unavailable"),
            ErrorKind::CertificateLoadFailure => write!(f, "certificate load failure"),
            ErrorKind::TlsHandshakeFailure => write!(f, "TLS handshake failure"),
            ErrorKind::NetworkTransient => write!(f, "transient network failure"),
            ErrorKind::ServerRejected => write!(f, "server rejected"),
            ErrorKind::QueueOverflow => write!(f, "queue overflow"),
        }
    }
}

/// Terminal outcome of one sample's delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Delivered { status: u16, attempts: u32 },
    Rejected { status: u16, body: String },
    RetriesExhausted { attempts: u32 },
    HandshakeFailed,
    Evicted,
}

/// Error detail attached to a status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StatusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A single status notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    /// Session the event belongs to; `None` when no session was created
    pub session_id: Option<Uuid>,
    pub state: StreamState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<TerminalOutcome>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
}

impl StatusEvent {
    pub fn transition(session_id: Option<Uuid>, state: StreamState) -> Self {
        Self {
            session_id,
            state,
            last_outcome: None,
            last_error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: TerminalOutcome) -> Self {
        self.last_outcome = Some(outcome);
        self
    }

    pub fn with_error(mut self, error: StatusError) -> Self {
        self.last_error = Some(error);
        self
    }
}

/// Broadcast fan-out of status events.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: StatusEvent) {
        if let Some(error) = &event.last_error {
            warn!(
                session_id = ?event.session_id,
                state = %event.state,
                error_kind = %error.kind,
                error = %error.message,
                "Stream status"
            );
        } else {
            debug!(
                session_id = ?event.session_id,
                state = %event.state,
                outcome = ?event.last_outcome,
                "Stream status"
            );
        }

        let _ = self.tx.send(event);
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminality() {
        assert!(StreamState::Stopped.is_terminal());
        assert!(StreamState::Error.is_terminal());
        assert!(!StreamState::Idle.is_terminal());
        assert!(!StreamState::Active.is_terminal());
        assert!(!StreamState::Paused.is_terminal());
    }

    #[test]
    fn test_status_event_serialization() {
        let id = Uuid::nil();
        let event = StatusEvent::transition(Some(id), StreamState::Active)
            .with_outcome(TerminalOutcome::Delivered {
                status: 200,
                attempts: 1,
            });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["last_outcome"]["kind"], "delivered");
        assert_eq!(json["last_outcome"]["status"], 200);
        assert!(json.get("last_error").is_none());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(format!("{}", ErrorKind::QueueOverflow), "queue overflow");
        assert_eq!(
            format!("{}", ErrorKind::TlsHandshakeFailure),
            "TLS handshake failure"
        );
    }

    #[tokio::test]
    async fn test_reporter_fans_out() {
        let reporter = StatusReporter::default();
        let mut first = reporter.subscribe();
        let mut second = reporter.subscribe();

        reporter.emit(StatusEvent::transition(None, StreamState::Error).with_error(
            StatusError::new(ErrorKind::CertificateLoadFailure, "missing file"),
        ));

        assert_eq!(first.recv().await.unwrap().state, StreamState::Error);
        let event = second.recv().await.unwrap();
        assert_eq!(
            event.last_error.unwrap().kind,
            ErrorKind::CertificateLoadFailure
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let reporter = StatusReporter::new(0);
        reporter.emit(StatusEvent::transition(None, StreamState::Idle));
    }
}
