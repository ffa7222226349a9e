//! Transport trust policy and TLS configuration
//!
//! [`SecurityMode`] selects how much trust a connection places in its peer.
//! The trust-all behavior of [`SecurityMode::Encrypted`] is implemented as
//! an explicit verifier type rather than hidden in a callback, so opting out
//! of verification is visible at the call site.

use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Transport trust policy, fixed per connection once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No encryption.
    Plain,
    /// TLS with any peer certificate accepted unconditionally.
    ///
    /// The wire is encrypted but the peer is unauthenticated, so an active
    /// attacker can substitute its own certificate. Development only.
    Encrypted,
    /// TLS with standard chain and hostname validation.
    EncryptedAndVerified,
}

impl SecurityMode {
    /// Whether this mode wraps the socket in TLS.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SecurityMode::Plain)
    }
}

/// Server certificate chain and private key.
///
/// Loaded eagerly so that a bad certificate fails at construction time, not
/// at the first handshake. Read-only after load and shared across all
/// handshakes.
#[derive(Clone)]
pub struct ServerIdentity {
    acceptor: TlsAcceptor,
}

impl ServerIdentity {
    /// Load a PEM certificate chain and private key from files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            Error::Certificate(format!("failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            Error::Certificate(format!("failed to read {}: {}", key_path.display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build an identity from in-memory PEM certificate chain and key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<io::Result<Vec<CertificateDer<'static>>>>()
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Certificate("no certificate found in PEM input".into()));
        }
        let key = private_key_from_pem(key_pem)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Certificate(format!("invalid certificate or key: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub(crate) fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

fn private_key_from_pem(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let items = rustls_pemfile::read_all(&mut BufReader::new(key_pem))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Certificate(format!("failed to parse private key: {e}")))?;

    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::Certificate("no private key found in PEM input".into()))
}

/// Build the TLS connector for a client-side handshake in the given mode.
///
/// `None` for [`SecurityMode::Plain`].
pub(crate) fn client_connector(mode: SecurityMode) -> Option<TlsConnector> {
    match mode {
        SecurityMode::Plain => None,
        SecurityMode::Encrypted => {
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier))
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        }
        SecurityMode::EncryptedAndVerified => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        }
    }
}

/// Certificate verifier that accepts any peer.
///
/// Selected only by [`SecurityMode::Encrypted`].
#[derive(Debug)]
struct TrustAllVerifier;

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_is_not_encrypted() {
        assert!(!SecurityMode::Plain.is_encrypted());
        assert!(SecurityMode::Encrypted.is_encrypted());
        assert!(SecurityMode::EncryptedAndVerified.is_encrypted());
    }

    #[test]
    fn rejects_garbage_pem() {
        let result = ServerIdentity::from_pem(b"not a certificate", b"not a key");
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn rejects_cert_without_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.cert.pem();
        // Certificate PEM passed where the key belongs
        let result = ServerIdentity::from_pem(cert_pem.as_bytes(), cert_pem.as_bytes());
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn rejects_missing_files() {
        let result = ServerIdentity::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn loads_self_signed_identity() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let identity = ServerIdentity::from_pem(
            cert.cert.pem().as_bytes(),
            cert.key_pair.serialize_pem().as_bytes(),
        );
        assert!(identity.is_ok());
    }
}
