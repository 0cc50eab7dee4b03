//! TLS configuration for the base transport.
//!
//! When the settings ask for nothing special the transport keeps reqwest's
//! own rustls defaults. Otherwise a `rustls::ClientConfig` is assembled here
//! and handed to reqwest as a preconfigured backend.

use std::sync::Arc;

use egress_common::{TlsSettings, expose_or_empty};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::error::ClientError;

/// Returns the installed crypto provider, or ring without installing it.
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Whether the settings require a custom TLS configuration.
#[must_use]
pub const fn needs_custom_tls(settings: &TlsSettings) -> bool {
    settings.insecure_skip_verify
        || !settings.server_name.is_empty()
        || settings.tls_client_auth
        || settings.tls_auth_with_ca_cert
}

/// Builds the TLS client configuration described by `settings`.
///
/// Returns `None` when the defaults apply.
///
/// # Errors
///
/// - [`ClientError::InvalidClientCertificate`] if client auth is enabled and the
///   certificate or key is missing or unparsable
/// - [`ClientError::InvalidCaCertificate`] if the CA bundle holds no certificate
/// - [`ClientError::Tls`] if rustls rejects the assembled configuration
pub fn build_tls_config(settings: &TlsSettings) -> Result<Option<rustls::ClientConfig>, ClientError> {
    if !needs_custom_tls(settings) {
        return Ok(None);
    }

    let provider = crypto_provider();
    let roots = Arc::new(root_store(settings)?);

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let verifier: Arc<dyn ServerCertVerifier> = if settings.insecure_skip_verify {
        tracing::warn!("TLS certificate verification is disabled");
        Arc::new(NoCertificateVerification { provider })
    } else if settings.server_name.is_empty() {
        webpki_verifier(roots, provider)?
    } else {
        let server_name = ServerName::try_from(settings.server_name.clone()).map_err(|e| {
            ClientError::InvalidRequest(format!(
                "invalid TLS server name '{}': {e}",
                settings.server_name
            ))
        })?;
        Arc::new(ServerNameOverride {
            inner: webpki_verifier(roots, provider)?,
            server_name,
        })
    };

    let builder = builder
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = if settings.tls_client_auth {
        let (chain, key) = client_identity(settings)?;
        builder.with_client_auth_cert(chain, key)?
    } else {
        builder.with_no_client_auth()
    };

    Ok(Some(config))
}

fn webpki_verifier(
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ServerCertVerifier>, ClientError> {
    let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
        .build()
        .map_err(|e| ClientError::InvalidCaCertificate(e.to_string()))?;
    Ok(verifier)
}

/// The configured CA bundle when enabled, otherwise the bundled web PKI roots.
fn root_store(settings: &TlsSettings) -> Result<RootCertStore, ClientError> {
    let ca_pem = expose_or_empty(settings.tls_ca_cert.as_ref());
    if !settings.tls_auth_with_ca_cert || ca_pem.is_empty() {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    }

    let mut store = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| ClientError::InvalidCaCertificate(e.to_string()))?;
        store
            .add(cert)
            .map_err(|e| ClientError::InvalidCaCertificate(e.to_string()))?;
    }

    if store.is_empty() {
        return Err(ClientError::InvalidCaCertificate(
            "no certificate found in CA bundle".to_string(),
        ));
    }
    tracing::debug!(count = store.len(), "loaded custom CA certificates");
    Ok(store)
}

fn client_identity(
    settings: &TlsSettings,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ClientError> {
    let cert_pem = expose_or_empty(settings.tls_client_cert.as_ref());
    let key_pem = expose_or_empty(settings.tls_client_key.as_ref());
    if cert_pem.is_empty() || key_pem.is_empty() {
        return Err(ClientError::InvalidClientCertificate(
            "client certificate and key are both required".to_string(),
        ));
    }

    let chain = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::InvalidClientCertificate(e.to_string()))?;
    if chain.is_empty() {
        return Err(ClientError::InvalidClientCertificate(
            "no certificate found in client certificate".to_string(),
        ));
    }

    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| ClientError::InvalidClientCertificate(e.to_string()))?;

    Ok((chain, key))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoCertificateVerification {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies the server certificate against a fixed name instead of the URL host.
#[derive(Debug)]
struct ServerNameOverride {
    inner: Arc<dyn ServerCertVerifier>,
    server_name: ServerName<'static>,
}

impl ServerCertVerifier for ServerNameOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            &self.server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use egress_common::secret;

    const CLIENT_CERT: &str = include_str!("../testdata/client.crt");
    const CLIENT_KEY: &str = include_str!("../testdata/client.key");

    #[test]
    fn test_defaults_need_no_custom_config() {
        let settings = TlsSettings::default();
        assert!(!needs_custom_tls(&settings));
        assert!(build_tls_config(&settings).unwrap().is_none());
    }

    #[test]
    fn test_insecure_skip_verify_builds_config() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(build_tls_config(&settings).unwrap().is_some());
    }

    #[test]
    fn test_server_name_override_builds_config() {
        let settings = TlsSettings {
            server_name: "internal.example.com".to_string(),
            ..Default::default()
        };
        assert!(build_tls_config(&settings).unwrap().is_some());
    }

    #[test]
    fn test_client_auth_requires_cert_and_key() {
        let settings = TlsSettings {
            tls_client_auth: true,
            tls_client_cert: Some(secret(CLIENT_CERT)),
            ..Default::default()
        };
        let err = build_tls_config(&settings).unwrap_err();
        assert!(matches!(err, ClientError::InvalidClientCertificate(_)));
    }

    #[test]
    fn test_client_auth_with_valid_identity() {
        let settings = TlsSettings {
            tls_client_auth: true,
            tls_client_cert: Some(secret(CLIENT_CERT)),
            tls_client_key: Some(secret(CLIENT_KEY)),
            ..Default::default()
        };
        let config = build_tls_config(&settings).unwrap().unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_client_auth_with_garbage_key() {
        let settings = TlsSettings {
            tls_client_auth: true,
            tls_client_cert: Some(secret(CLIENT_CERT)),
            tls_client_key: Some(secret("not a key")),
            ..Default::default()
        };
        let err = build_tls_config(&settings).unwrap_err();
        assert!(matches!(err, ClientError::InvalidClientCertificate(_)));
    }

    #[test]
    fn test_ca_bundle_without_certificates_is_rejected() {
        let settings = TlsSettings {
            tls_auth_with_ca_cert: true,
            tls_ca_cert: Some(secret("-----BEGIN NOTHING-----\n-----END NOTHING-----\n")),
            ..Default::default()
        };
        let err = build_tls_config(&settings).unwrap_err();
        assert!(matches!(err, ClientError::InvalidCaCertificate(_)));
    }

    #[test]
    fn test_ca_bundle_is_loaded() {
        let settings = TlsSettings {
            tls_auth_with_ca_cert: true,
            tls_ca_cert: Some(secret(CLIENT_CERT)),
            ..Default::default()
        };
        assert_eq!(root_store(&settings).unwrap().len(), 1);
        assert!(build_tls_config(&settings).unwrap().is_some());
    }

    #[test]
    fn test_empty_ca_bundle_falls_back_to_web_roots() {
        let settings = TlsSettings {
            tls_auth_with_ca_cert: true,
            ..Default::default()
        };
        assert_eq!(
            root_store(&settings).unwrap().len(),
            webpki_roots::TLS_SERVER_ROOTS.len()
        );
    }
}
