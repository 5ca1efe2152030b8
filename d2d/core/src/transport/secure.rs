//! Secure Transport
//!
//! TLS connector for paired devices. Paired peers present self-signed
//! certificates, so full chain and peer-name validation is disabled. The
//! remaining trust decision is explicit, see [`TlsTrust`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};

use super::config::{TlsConfig, TlsTrust};
use super::socket::connect_tcp;
use super::traits::{BoxedStream, Connector, Endpoint, TransportError};

/// TLS-over-TCP connector with relaxed certificate validation
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    trust: TlsTrust,
}

impl TlsConnector {
    /// Build a connector from TLS settings
    ///
    /// Fails if the trust mode needs a certificate that is missing or
    /// unreadable.
    pub fn new(tls: &TlsConfig) -> Result<Self, TransportError> {
        let pinned = match (tls.trust, &tls.certificate) {
            (TlsTrust::PinnedCertificate, Some(path)) => Some(load_certificate(path)?),
            (TlsTrust::PinnedCertificate, None) => {
                return Err(TransportError::Tls(
                    "pinned-certificate trust requires a certificate".into(),
                ))
            }
            (TlsTrust::TrustOnFirstUse, _) => None,
        };

        tracing::warn!(
            trust = %tls.trust,
            "TLS certificate chain and peer name validation are disabled"
        );

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = RelaxedServerVerifier {
            pinned,
            provider: Arc::clone(&provider),
        };
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            trust: tls.trust,
        })
    }

    /// Trust mode in effect
    pub fn trust(&self) -> TlsTrust {
        self.trust
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, TransportError> {
        let tcp = connect_tcp(endpoint).await?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name {}: {e}", endpoint.host)))?;

        let stream = self
            .inner
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake with {endpoint} failed: {e}")))?;

        tracing::debug!(endpoint = %endpoint, trust = %self.trust, "TLS handshake complete");
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

/// Load the bundled certificate from a PEM or DER file
pub fn load_certificate(path: &Path) -> Result<CertificateDer<'static>, TransportError> {
    let bytes = std::fs::read(path).map_err(|e| {
        TransportError::Tls(format!("failed to read certificate {}: {e}", path.display()))
    })?;

    // DER starts with an ASN.1 SEQUENCE tag; PEM never does
    if bytes.first() == Some(&0x30) {
        return Ok(CertificateDer::from(bytes));
    }

    let mut reader = bytes.as_slice();
    let first = rustls_pemfile::certs(&mut reader).next().transpose().map_err(|e| {
        TransportError::Tls(format!("failed to parse certificate {}: {e}", path.display()))
    })?;

    first.ok_or_else(|| {
        TransportError::Tls(format!("no certificate found in {}", path.display()))
    })
}

/// Skips chain and name validation; optionally pins the end entity
#[derive(Debug)]
struct RelaxedServerVerifier {
    pinned: Option<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RelaxedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => {
                tracing::warn!("Server certificate does not match the pinned certificate");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            _ => Ok(ServerCertVerified::assertion()),
        }
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
