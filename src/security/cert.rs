//! TLS certificate management for both proxy directions.
//!
//! Certificates are loaded from disk or generated on the fly (`auto_certs`)
//! and published as atomically swappable snapshots, so a reload never blocks
//! in-flight handshakes.

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tracing::{info, warn};

use crate::config::TlsConfig;

/// Recreate auto certs this long before they expire. It should be longer
/// than one reload interval.
const RECREATE_AUTO_CERT_ADVANCE_SECS: i64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid certificate material: {0}")]
    Invalid(String),
}

/// TLS state for one direction (server role toward clients, client role
/// toward backends).
pub struct CertInfo {
    cfg: TlsConfig,
    server: bool,
    /// Unix timestamp after which the auto cert must be regenerated
    auto_cert_exp: AtomicI64,
    server_snapshot: RwLock<Option<Arc<rustls::ServerConfig>>>,
    client_snapshot: RwLock<Option<Arc<rustls::ClientConfig>>>,
}

impl CertInfo {
    pub fn new_server(cfg: TlsConfig) -> Self {
        Self {
            cfg,
            server: true,
            auto_cert_exp: AtomicI64::new(0),
            server_snapshot: RwLock::new(None),
            client_snapshot: RwLock::new(None),
        }
    }

    pub fn new_client(cfg: TlsConfig) -> Self {
        Self {
            cfg,
            server: false,
            auto_cert_exp: AtomicI64::new(0),
            server_snapshot: RwLock::new(None),
            client_snapshot: RwLock::new(None),
        }
    }

    /// Rebuild the TLS config from config/auto-certs and publish it.
    pub fn reload(&self) -> Result<(), CertError> {
        if self.server {
            let config = self.build_server_config()?;
            *self.server_snapshot.write() = config;
        } else {
            let config = self.build_client_config()?;
            *self.client_snapshot.write() = config;
        }
        Ok(())
    }

    /// Snapshot of the server-role config; `None` when TLS is disabled.
    ///
    /// When auto certs are in use and the stored expiry has passed, the cert
    /// is regenerated before the snapshot is returned, so the first handshake
    /// after a long idle period still gets a valid certificate.
    pub fn server_tls(&self) -> Option<Arc<rustls::ServerConfig>> {
        if self.server && self.cfg.auto_certs && !self.cfg.has_cert() {
            let now = unix_now();
            if self.auto_cert_exp.load(Ordering::Acquire) <= now {
                if let Err(err) = self.reload() {
                    warn!(error = %err, "auto cert refresh failed, keeping previous cert");
                }
            }
        }
        self.server_snapshot.read().clone()
    }

    /// Snapshot of the client-role config; `None` when TLS is disabled
    pub fn client_tls(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.client_snapshot.read().clone()
    }

    fn build_server_config(&self) -> Result<Option<Arc<rustls::ServerConfig>>, CertError> {
        let auto_certs = if self.cfg.has_cert() {
            false
        } else if self.cfg.auto_certs {
            true
        } else {
            info!("no certificates to secure client connections, TLS disabled");
            return Ok(None);
        };

        let (certs, key) = if auto_certs {
            let expire_secs = self.cfg.auto_cert_expire_secs as i64;
            self.auto_cert_exp.store(
                unix_now() + expire_secs - RECREATE_AUTO_CERT_ADVANCE_SECS,
                Ordering::Release,
            );
            generate_self_signed(self.cfg.auto_cert_expire_secs)?
        } else {
            let certs = load_certs(self.cfg.cert.as_deref().unwrap_or_default())?;
            let key = load_key(self.cfg.key.as_deref().unwrap_or_default())?;
            (certs, key)
        };

        let versions = min_versions(&self.cfg.min_tls_version);
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(versions)?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Some(Arc::new(config)))
    }

    fn build_client_config(&self) -> Result<Option<Arc<rustls::ClientConfig>>, CertError> {
        if self.cfg.auto_certs {
            info!("auto_certs in a client tls config is ignored");
        }

        let versions = min_versions(&self.cfg.min_tls_version);
        let builder =
            rustls::ClientConfig::builder_with_provider(provider()).with_protocol_versions(versions)?;

        let config = if self.cfg.has_ca() {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(self.cfg.ca.as_deref().unwrap_or_default())? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        } else if self.cfg.skip_ca {
            // TLS without verifying the backend's certificate
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipVerification::new()))
                .with_no_client_auth()
        } else {
            info!("no CA to verify backend connections, TLS disabled");
            return Ok(None);
        };

        Ok(Some(Arc::new(config)))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn min_versions(min: &str) -> &'static [&'static rustls::SupportedProtocolVersion] {
    static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
    static ALL: &[&rustls::SupportedProtocolVersion] =
        &[&rustls::version::TLS12, &rustls::version::TLS13];
    match min {
        "1.3" => TLS13_ONLY,
        _ => ALL,
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs?;
    if certs.is_empty() {
        return Err(CertError::Invalid(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| CertError::Invalid(format!("no private key in {path}")))
}

/// Generate a self-signed certificate valid for `expire_secs`
fn generate_self_signed(
    expire_secs: u64,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertError> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params =
        rcgen::CertificateParams::new(vec!["hermes".to_string(), "localhost".to_string()])?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::seconds(expire_secs as i64);
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::Invalid(e.to_string()))?;
    Ok((vec![cert_der], key_der))
}

/// Certificate verifier that accepts any peer (skip_ca)
#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl SkipVerification {
    fn new() -> Self {
        Self(provider())
    }
}

impl ServerCertVerifier for SkipVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a matching (server, client) config pair backed by a fresh
/// self-signed certificate. For tests and local tooling.
pub fn create_tls_pair_for_test(
) -> Result<(Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>), CertError> {
    let (certs, key) = generate_self_signed(24 * 3600)?;
    let server = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    let client = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipVerification::new()))
        .with_no_client_auth();
    Ok((Arc::new(server), Arc::new(client)))
}
