//! # TLS Policy
//!
//! Where to find trust roots and how strict to be about them, resolved
//! per server host. The monitor feeds this from its config file
//! (`CERTPATH`, `CERTVERIFY`, `FORCESSL`, plus per-host `CERTHOST`
//! overrides); the session only asks two questions: "must this host speak
//! TLS?" and "give me a client config for this host".

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use super::error::ClientError;

/// Per-host certificate expectations from a `CERTHOST` directive.
#[derive(Debug, Clone)]
pub struct HostCert {
    /// Certificate name the server is expected to present.
    pub certname: String,
    /// Whether to verify the presented certificate chain.
    pub verify: bool,
    /// Whether plaintext fallback is forbidden for this host.
    pub force_tls: bool,
}

/// Process-wide TLS settings plus per-host overrides.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicy {
    /// PEM file or directory of PEM files holding trust roots.
    pub cert_path: Option<PathBuf>,
    /// Default for hosts without a `CERTHOST` entry.
    pub verify: bool,
    /// Default TLS requirement for hosts without a `CERTHOST` entry.
    pub force_tls: bool,
    /// Host-keyed overrides.
    pub hosts: HashMap<String, HostCert>,
}

impl TlsPolicy {
    /// Register a `CERTHOST` override.
    pub fn add_host(&mut self, hostname: &str, certname: &str, verify: bool, force_tls: bool) {
        self.hosts.insert(
            hostname.to_string(),
            HostCert {
                certname: certname.to_string(),
                verify,
                force_tls,
            },
        );
    }

    /// Effective (verify, force_tls) pair for one server host.
    pub fn for_host(&self, hostname: &str) -> (bool, bool) {
        match self.hosts.get(hostname) {
            Some(hc) => (hc.verify, hc.force_tls),
            None => (self.verify, self.force_tls),
        }
    }

    /// Build the rustls client config used to upgrade a session to this
    /// host. With verification off the server certificate is accepted
    /// unseen, which matches the legacy behaviour of monitors that only
    /// want wire privacy.
    pub fn client_config(&self, hostname: &str) -> Result<Arc<rustls::ClientConfig>, ClientError> {
        let (verify, _) = self.for_host(hostname);

        let config = if verify {
            let roots = self.load_roots()?;
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                .with_no_client_auth()
        };

        Ok(Arc::new(config))
    }

    fn load_roots(&self) -> Result<RootCertStore, ClientError> {
        let mut roots = RootCertStore::empty();

        match &self.cert_path {
            Some(path) if path.is_dir() => {
                let entries = std::fs::read_dir(path)
                    .map_err(|e| ClientError::Tls(format!("CERTPATH {}: {e}", path.display())))?;
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.extension().is_some_and(|ext| ext == "pem" || ext == "crt") {
                        add_pem_file(&mut roots, &p)?;
                    }
                }
            }
            Some(path) => add_pem_file(&mut roots, path)?,
            None => {
                let native = rustls_native_certs::load_native_certs();
                for err in &native.errors {
                    log::warn!("skipping unusable native root certificate: {err}");
                }
                for cert in native.certs {
                    let _ = roots.add(cert);
                }
            }
        }

        if roots.is_empty() {
            return Err(ClientError::Tls("no usable trust roots found".to_string()));
        }

        Ok(roots)
    }
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> Result<(), ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("CERTPATH {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| ClientError::Tls(format!("{}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("{}: {e}", path.display())))?;
    }

    Ok(())
}

/// Resolve the SNI name for a host, required by the TLS handshake even
/// when verification is off.
pub fn server_name(hostname: &str) -> Result<ServerName<'static>, ClientError> {
    ServerName::try_from(hostname.to_string())
        .map_err(|e| ClientError::Tls(format!("invalid server name [{hostname}]: {e}")))
}

/// Certificate verifier that accepts whatever the server presents.
/// Used only when `CERTVERIFY 0` (the shipped default).
#[derive(Debug)]
struct AcceptAnyCert {
    provider: CryptoProvider,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
