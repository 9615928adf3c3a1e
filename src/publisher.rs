//! Publisher for delivering location samples to the ingestion endpoint.
//!
//! A publish is a single HTTPS POST over mutual TLS: the client presents the
//! bundle's certificate and key, and the server is validated against the
//! bundle's trusted root only. The publisher performs no retries itself; it
//! classifies each attempt so the retry queue can decide what happens next.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::certs::CertificateBundle;
use crate::config::Config;
use crate::sample::LocationSample;

/// Response bodies longer than this are truncated before being reported.
const MAX_REPORTED_BODY_CHARS: usize = 1024;

/// Classification of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// 2xx response
    Delivered { status: u16 },

    /// Non-retriable response (4xx other than 429) or unbuildable request
    Rejected { status: u16, body: String },

    /// Network failure, timeout, 5xx or 429; safe to retry
    Transient { reason: String },

    /// TLS handshake or server trust failure; retrying cannot help
    HandshakeFailed { reason: String },
}

impl PublishOutcome {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PublishOutcome::Transient { .. })
    }
}

impl std::fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishOutcome::Delivered { status } => write!(f, "delivered ({})", status),
            PublishOutcome::Rejected { status, body } => {
                write!(f, "rejected ({}): {}", status, body)
            }
            PublishOutcome::Transient { reason } => write!(f, "transient failure: {}", reason),
            PublishOutcome::HandshakeFailed { reason } => {
                write!(f, "TLS handshake failed: {}", reason)
            }
        }
    }
}

/// Sends one sample and reports how it went.
///
/// The publish loop is the only caller, so implementations never see
/// concurrent calls for the same session.
pub trait Publisher: Send + Sync + 'static {
    fn publish(
        &self,
        sample: &LocationSample,
        bundle: &CertificateBundle,
    ) -> impl Future<Output = PublishOutcome> + Send;
}

/// Mutual-TLS HTTPS publisher backed by reqwest.
///
/// Requests go through the pooled client owned by the session's bundle.
pub struct HttpsPublisher {
    /// URL of the ingestion endpoint
    endpoint_url: String,

    /// Per-attempt timeout
    timeout: Duration,
}

impl HttpsPublisher {
    /// Create a publisher from the loaded configuration.
    pub fn new(config: &Config) -> Self {
        Self::with_settings(config.endpoint_url.clone(), config.request_timeout)
    }

    /// Create a publisher with explicit settings.
    pub fn with_settings(endpoint_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            timeout,
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send_request(&self, bundle: &CertificateBundle, sample: &LocationSample) -> PublishOutcome {
        let response = match bundle
            .client()
            .post(&self.endpoint_url)
            .timeout(self.timeout)
            .json(&sample.payload())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_error(&e),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                debug!(error = %e, "Failed to read response body after success");
                String::new()
            }
            Err(e) => return classify_error(&e),
        };

        classify_status(status, body)
    }
}

impl Publisher for HttpsPublisher {
    async fn publish(&self, sample: &LocationSample, bundle: &CertificateBundle) -> PublishOutcome {
        debug!(
            url = %self.endpoint_url,
            bundle_id = %bundle.id(),
            captured_at = %sample.captured_at.wall,
            "Publishing location sample"
        );

        let outcome = match tokio::time::timeout(self.timeout, self.send_request(bundle, sample)).await
        {
            Ok(outcome) => outcome,
            Err(_) => PublishOutcome::Transient {
                reason: format!("request timed out after {:?}", self.timeout),
            },
        };

        match &outcome {
            PublishOutcome::Delivered { status } => {
                debug!(status = status, "Location sample delivered");
            }
            other => {
                warn!(outcome = %other, "Location sample not delivered");
            }
        }

        outcome
    }
}

/// Map an HTTP status and body to an outcome.
///
/// 2xx is delivered; 429 and 5xx are transient; anything else is rejected.
pub fn classify_status(status: StatusCode, body: String) -> PublishOutcome {
    if status.is_success() {
        PublishOutcome::Delivered {
            status: status.as_u16(),
        }
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PublishOutcome::Transient {
            reason: format!("server responded {}", status.as_u16()),
        }
    } else {
        PublishOutcome::Rejected {
            status: status.as_u16(),
            body: truncate(body, MAX_REPORTED_BODY_CHARS),
        }
    }
}

/// Map a transport error to an outcome.
///
/// TLS failures are checked first since they also report as connect errors.
pub fn classify_error(err: &reqwest::Error) -> PublishOutcome {
    let reason = error_chain(err);

    if is_tls_failure(err) {
        PublishOutcome::HandshakeFailed { reason }
    } else if err.is_builder() {
        PublishOutcome::Rejected { status: 0, body: reason }
    } else if err.is_timeout() {
        PublishOutcome::Transient {
            reason: format!("request timed out: {}", reason),
        }
    } else {
        PublishOutcome::Transient { reason }
    }
}

/// Whether rustls raised any error in the chain.
///
/// rustls errors arrive wrapped in `io::Error`, whose `source()` skips the
/// wrapped error, so the payload is inspected directly.
fn is_tls_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if cause.is::<rustls::Error>() {
            return true;
        }
        if let Some(inner) = cause
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
        {
            if is_tls_failure(inner) {
                return true;
            }
        }
        current = cause.source();
    }
    false
}

/// Render an error and all of its sources as one line.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn truncate(mut body: String, max_chars: usize) -> String {
    if let Some((index, _)) = body.char_indices().nth(max_chars) {
        body.truncate(index);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Layered {
        message: &'static str,
        source: Option<Box<Layered>>,
    }

    impl std::fmt::Display for Layered {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl std::error::Error for Layered {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static))
        }
    }

    #[test]
    fn test_success_statuses_are_delivered() {
        assert_eq!(
            classify_status(StatusCode::OK, String::new()),
            PublishOutcome::Delivered { status: 200 }
        );
        assert_eq!(
            classify_status(StatusCode::ACCEPTED, "{}".to_string()),
            PublishOutcome::Delivered { status: 202 }
        );
    }

    #[test]
    fn test_server_errors_and_throttling_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let outcome = classify_status(status, "busy".to_string());
            assert!(outcome.is_retriable(), "{} should be retriable", status);
        }
    }

    #[test]
    fn test_client_errors_are_rejected() {
        let outcome = classify_status(StatusCode::FORBIDDEN, "{\"message\":\"Forbidden\"}".to_string());
        assert_eq!(
            outcome,
            PublishOutcome::Rejected {
                status: 403,
                body: "{\"message\":\"Forbidden\"}".to_string(),
            }
        );
        assert!(!outcome.is_retriable());

        let outcome = classify_status(StatusCode::BAD_REQUEST, String::new());
        assert!(matches!(outcome, PublishOutcome::Rejected { status: 400, .. }));
    }

    #[test]
    fn test_rejected_body_is_truncated() {
        let body = "x".repeat(5000);
        match classify_status(StatusCode::UNPROCESSABLE_ENTITY, body) {
            PublishOutcome::Rejected { body, .. } => {
                assert_eq!(body.chars().count(), MAX_REPORTED_BODY_CHARS)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_rustls_error_inside_io_error_is_tls_failure() {
        let err = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(is_tls_failure(&err));

        let alert = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate),
        );
        assert!(is_tls_failure(&alert));
    }

    #[test]
    fn test_tls_words_in_messages_are_not_tls_failures() {
        let err = std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "https://127.0.0.1:1/mtls/alerts/certificate-handshake: connection refused",
        );
        assert!(!is_tls_failure(&err));

        let err = Layered {
            message: "tls alert",
            source: Some(Box::new(Layered {
                message: "invalid peer certificate",
                source: None,
            })),
        };
        assert!(!is_tls_failure(&err));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Layered {
            message: "error sending request",
            source: Some(Box::new(Layered {
                message: "invalid peer certificate",
                source: None,
            })),
        };
        assert_eq!(
            error_chain(&err),
            "error sending request: invalid peer certificate"
        );
    }

    #[test]
    fn test_publisher_settings() {
        let publisher =
            HttpsPublisher::with_settings("https://iot.example.com:8443/topics/track", Duration::from_secs(7));
        assert_eq!(
            publisher.endpoint_url(),
            "https://iot.example.com:8443/topics/track"
        );
        assert_eq!(publisher.timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = PublishOutcome::Transient {
            reason: "connection reset".to_string(),
        };
        assert_eq!(format!("{}", outcome), "transient failure: connection reset");
    }

    mod endpoint {
        use std::io::{Read, Write};
        use std::net::{SocketAddr, TcpListener, TcpStream};
        use std::sync::Arc;
        use std::time::Duration;

        use chrono::Utc;
        use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
        use rustls::server::WebPkiClientVerifier;
        use rustls::{RootCertStore, ServerConfig, ServerConnection};
        use tempfile::TempDir;

        use crate::certs::test_pki::TestAuthority;
        use crate::certs::CertificateBundle;
        use crate::publisher::{HttpsPublisher, PublishOutcome, Publisher};
        use crate::sample::{LocationSample, RawLocation, SourceKind};

        /// How long `/stall` holds a request before answering.
        const STALL: Duration = Duration::from_secs(2);

        /// TLS server requiring a client certificate issued by `client_ca`.
        fn server_config(server_ca: &TestAuthority, client_ca: &TestAuthority) -> Arc<ServerConfig> {
            let provider = Arc::new(rustls::crypto::ring::default_provider());

            let mut client_roots = RootCertStore::empty();
            client_roots.add(client_ca.der().clone()).unwrap();
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider.clone())
                    .build()
                    .unwrap();

            let server = server_ca.issue_server();
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server.key.serialize_der()));
            let config = ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_client_cert_verifier(verifier)
                .with_single_cert(vec![server.cert.der().clone()], key)
                .unwrap();
            Arc::new(config)
        }

        /// Serve the ingestion routes on an ephemeral localhost port.
        fn spawn_server(config: Arc<ServerConfig>) -> SocketAddr {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let config = config.clone();
                    std::thread::spawn(move || serve_connection(config, stream));
                }
            });
            addr
        }

        fn serve_connection(config: Arc<ServerConfig>, mut tcp: TcpStream) {
            let Ok(mut conn) = ServerConnection::new(config) else {
                return;
            };
            let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
            let Some(path) = read_request(&mut tls) else {
                return;
            };

            let (status, body) = match path.as_str() {
                "/ingest" => ("200 OK", "{}"),
                "/throttled" => ("429 Too Many Requests", "slow down"),
                "/unavailable" => ("503 Service Unavailable", "busy"),
                "/forbidden" => ("403 Forbidden", "{\"message\":\"Forbidden\"}"),
                "/stall" => {
                    std::thread::sleep(STALL);
                    ("200 OK", "{}")
                }
                _ => ("404 Not Found", ""),
            };

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            if tls.write_all(response.as_bytes()).is_err() {
                return;
            }
            let _ = tls.flush();
            tls.conn.send_close_notify();
            let _ = tls.flush();
        }

        /// Read one request and return its path; `None` if the handshake or
        /// read fails.
        fn read_request(stream: &mut impl Read) -> Option<String> {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];

            let header_end = loop {
                if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                let n = stream.read(&mut chunk).ok()?;
                if n == 0 {
                    return None;
                }
                buffer.extend_from_slice(&chunk[..n]);
            };

            let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
            let path = head.split_whitespace().nth(1)?.to_string();
            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);

            while buffer.len() < header_end + content_length {
                let n = stream.read(&mut chunk).ok()?;
                if n == 0 {
                    return None;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }

            Some(path)
        }

        fn sample() -> LocationSample {
            let raw = RawLocation::new(12.97, 77.59, 5.0, Utc::now(), SourceKind::Gps);
            LocationSample::from_raw(&raw, tokio::time::Instant::now())
        }

        /// A device bundle under `client_ca`, trusting `trusted`.
        fn bundle(dir: &TempDir, client_ca: &TestAuthority, trusted: &TestAuthority) -> CertificateBundle {
            let paths = client_ca.write_client_bundle(dir.path());
            std::fs::write(&paths.trusted_root, trusted.pem()).unwrap();
            CertificateBundle::load(&paths).unwrap()
        }

        #[tokio::test]
        async fn test_publish_statuses_from_mtls_endpoint() {
            let ca = TestAuthority::new("ingest root");
            let addr = spawn_server(server_config(&ca, &ca));
            let dir = TempDir::new().unwrap();
            let bundle = bundle(&dir, &ca, &ca);

            let publish = |path: &str| {
                let publisher = HttpsPublisher::with_settings(
                    format!("https://{}{}", addr, path),
                    Duration::from_secs(5),
                );
                let bundle = bundle.clone();
                async move { publisher.publish(&sample(), &bundle).await }
            };

            assert_eq!(publish("/ingest").await, PublishOutcome::Delivered { status: 200 });
            assert!(matches!(publish("/throttled").await, PublishOutcome::Transient { .. }));
            assert!(matches!(publish("/unavailable").await, PublishOutcome::Transient { .. }));
            assert_eq!(
                publish("/forbidden").await,
                PublishOutcome::Rejected {
                    status: 403,
                    body: "{\"message\":\"Forbidden\"}".to_string(),
                }
            );
        }

        #[tokio::test]
        async fn test_untrusted_server_certificate_fails_handshake() {
            let device_ca = TestAuthority::new("device root");
            let rogue_ca = TestAuthority::new("rogue root");
            let addr = spawn_server(server_config(&rogue_ca, &device_ca));
            let dir = TempDir::new().unwrap();
            let bundle = bundle(&dir, &device_ca, &device_ca);

            let publisher = HttpsPublisher::with_settings(
                format!("https://{}/ingest", addr),
                Duration::from_secs(5),
            );
            let outcome = publisher.publish(&sample(), &bundle).await;

            assert!(
                matches!(outcome, PublishOutcome::HandshakeFailed { .. }),
                "got {:?}",
                outcome
            );
            assert!(!outcome.is_retriable());
        }

        #[tokio::test]
        async fn test_stalled_endpoint_times_out_as_transient() {
            let ca = TestAuthority::new("ingest root");
            let addr = spawn_server(server_config(&ca, &ca));
            let dir = TempDir::new().unwrap();
            let bundle = bundle(&dir, &ca, &ca);

            let publisher = HttpsPublisher::with_settings(
                format!("https://{}/stall", addr),
                Duration::from_millis(300),
            );
            let started = std::time::Instant::now();
            let outcome = publisher.publish(&sample(), &bundle).await;

            assert!(outcome.is_retriable(), "got {:?}", outcome);
            assert!(started.elapsed() < STALL);
        }

        #[tokio::test]
        async fn test_refused_connection_is_transient() {
            let ca = TestAuthority::new("ingest root");
            let dir = TempDir::new().unwrap();
            let bundle = bundle(&dir, &ca, &ca);

            // Nothing listens on port 1; the TLS-sounding path must not matter
            let publisher = HttpsPublisher::with_settings(
                "https://127.0.0.1:1/mtls-ingest/alerts",
                Duration::from_secs(5),
            );
            let outcome = publisher.publish(&sample(), &bundle).await;

            assert!(
                matches!(outcome, PublishOutcome::Transient { .. }),
                "got {:?}",
                outcome
            );
        }
    }
}
