//! Client certificate bundle for mutual TLS.
//!
//! The bundle is read from disk once per session, validated, and then shared
//! read-only between the controller and the publish loop. Validation builds
//! the session's HTTPS client: rustls parses every certificate and the key,
//! and checks that the key belongs to the client certificate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Certificate, Client, Identity};
use tracing::info;
use uuid::Uuid;

const PEM_CERTIFICATE_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const PEM_PRIVATE_KEY_MARKER: &str = "PRIVATE KEY-----";

/// Idle connections kept per host by the bundle's client.
const POOL_MAX_IDLE_PER_HOST: usize = 2;

/// How long an idle pooled connection is kept.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Filesystem locations of the credentials making up a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub trusted_root: PathBuf,
}

impl CertificatePaths {
    pub fn new(
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        trusted_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
            trusted_root: trusted_root.into(),
        }
    }
}

/// Errors raised while loading a certificate bundle.
#[derive(Debug)]
pub enum CertificateError {
    /// File could not be read
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// File does not contain the expected PEM block
    InvalidPem { path: PathBuf, expected: &'static str },

    /// The TLS stack refused the certificate, key or trusted root
    Tls(reqwest::Error),
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateError::Io { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            CertificateError::InvalidPem { path, expected } => {
                write!(f, "{} does not contain a PEM {}", path.display(), expected)
            }
            CertificateError::Tls(e) => write!(f, "Invalid TLS credentials: {}", e),
        }
    }
}

impl std::error::Error for CertificateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CertificateError::Io { source, .. } => Some(source),
            CertificateError::Tls(e) => Some(e),
            CertificateError::InvalidPem { .. } => None,
        }
    }
}

/// Validated client credentials plus the mutual-TLS client built from them.
#[derive(Clone)]
pub struct CertificateBundle {
    inner: Arc<BundleInner>,
}

struct BundleInner {
    id: Uuid,
    paths: CertificatePaths,
    client: Client,
}

impl CertificateBundle {
    /// Read and validate the certificate, private key and trusted root.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError` if any file is missing, lacks the expected
    /// PEM block, fails to parse, or if the key does not match the
    /// certificate.
    pub fn load(paths: &CertificatePaths) -> Result<Self, CertificateError> {
        let certificate = read_pem(&paths.certificate, PEM_CERTIFICATE_MARKER, "certificate")?;
        let private_key = read_pem(&paths.private_key, PEM_PRIVATE_KEY_MARKER, "private key")?;
        let trusted_root = read_pem(&paths.trusted_root, PEM_CERTIFICATE_MARKER, "certificate")?;

        let mut identity_pem = certificate;
        if !identity_pem.ends_with(b"\n") {
            identity_pem.push(b'\n');
        }
        identity_pem.extend_from_slice(&private_key);

        let identity = Identity::from_pem(&identity_pem).map_err(CertificateError::Tls)?;
        let trusted_root = Certificate::from_pem(&trusted_root).map_err(CertificateError::Tls)?;

        // Only the pinned root is trusted; the built-in web PKI roots are off
        let client = Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .tls_built_in_root_certs(false)
            .add_root_certificate(trusted_root)
            .identity(identity)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(CertificateError::Tls)?;

        let id = Uuid::new_v4();
        info!(
            bundle_id = %id,
            certificate = %paths.certificate.display(),
            trusted_root = %paths.trusted_root.display(),
            "Certificate bundle loaded"
        );

        Ok(Self {
            inner: Arc::new(BundleInner {
                id,
                paths: paths.clone(),
                client,
            }),
        })
    }

    /// Unique id of this loaded bundle; a reload yields a new id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn paths(&self) -> &CertificatePaths {
        &self.inner.paths
    }

    /// Pooled HTTPS client presenting this bundle's identity.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("id", &self.inner.id)
            .field("paths", &self.inner.paths)
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path, marker: &str, expected: &'static str) -> Result<Vec<u8>, CertificateError> {
    let bytes = std::fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let contains_marker = std::str::from_utf8(&bytes)
        .map(|text| text.contains(marker))
        .unwrap_or(false);

    if !contains_marker {
        return Err(CertificateError::InvalidPem {
            path: path.to_path_buf(),
            expected,
        });
    }

    Ok(bytes)
}


/// Write a valid client bundle under a fresh test root into `dir`.
#[cfg(test)]
pub(crate) fn write_test_bundle(dir: &Path) -> CertificatePaths {
    test_pki::TestAuthority::new("test root").write_client_bundle(dir)
}
