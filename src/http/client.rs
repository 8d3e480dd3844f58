//! Shared upstream HTTP client.
//!
//! # Responsibilities
//! - Build the hyper client used for every outbound dispatch
//! - Terminate backend TLS (optionally without verification)
//! - Enforce the per-host in-flight ceiling
//!
//! The connection pool has no hard per-host cap of its own, so the ceiling
//! is enforced in front of it with one semaphore per authority.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ClientConfig;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the shared client.
pub fn build(config: &ClientConfig) -> std::io::Result<HttpClient> {
    let connector = if config.insecure {
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build()
    } else {
        HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .build()
    };

    Ok(Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.keepalive_conns)
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector))
}

/// Per-authority in-flight ceiling.
pub struct HostLimiter {
    max: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    /// `max` of 0 disables the ceiling.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a dispatch slot to `authority`. The returned permit must be
    /// held until the response body has been relayed.
    pub async fn acquire(&self, authority: &str) -> Option<OwnedSemaphorePermit> {
        if self.max == 0 {
            return None;
        }

        let semaphore = {
            let mut semaphores = match self.semaphores.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            semaphores
                .entry(authority.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max)))
                .clone()
        };

        semaphore.acquire_owned().await.ok()
    }
}

/// Certificate verifier that accepts anything. Enabled by the `insecure`
/// option for debugging against backends with self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
