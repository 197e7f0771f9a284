use crate::attestation::{
    AttestationService, BindingDigest, ClaimSet, ErrorContext, ErrorKind, SessionMaterial,
    VerificationResult,
};
use crate::ratls::extract_evidence;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

/// Default bound on the whole TLS handshake, attestation included.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("attestation rejected: {kind}")]
    Rejected {
        kind: ErrorKind,
        context: ErrorContext,
    },
    #[error("TLS configuration: {0}")]
    Config(#[from] rustls::Error),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("TLS handshake did not complete within {0:?}")]
    Timeout(Duration),
    #[error("handshake completed without an attestation outcome")]
    Unattested,
}

impl ChannelError {
    /// Attestation failure kind, when the handshake was rejected for that reason.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ChannelError::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Verifies the server's RA-TLS certificate instead of a WebPKI chain.
///
/// One verifier serves one connection; the outcome is kept so the caller can
/// read the accepted claims once the handshake finishes.
pub struct AttestingVerifier {
    service: AttestationService,
    provider: Arc<CryptoProvider>,
    outcome: Mutex<Option<VerificationResult>>,
}

impl AttestingVerifier {
    pub fn new(service: AttestationService, provider: Arc<CryptoProvider>) -> Self {
        Self {
            service,
            provider,
            outcome: Mutex::new(None),
        }
    }

    fn record(&self, result: VerificationResult) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(result);
        }
    }

    fn take_outcome(&self) -> Option<VerificationResult> {
        self.outcome.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl fmt::Debug for AttestingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for AttestingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(now.as_secs());
        let result = match (
            SessionMaterial::from_certificate(end_entity.as_ref()),
            extract_evidence(end_entity.as_ref()),
        ) {
            (Ok(material), Ok(bundle)) => self.service.verify(&bundle, &material, now),
            (Err(err), _) | (_, Err(err)) => VerificationResult::Rejected {
                kind: err.kind(),
                context: err.context(),
            },
        };

        let accepted = result.is_accepted();
        self.record(result);
        if accepted {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
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

/// An established TLS session whose server evidence was accepted and bound
/// to the handshake key. Dropped together with the transport.
pub struct BoundChannel<IO> {
    stream: TlsStream<IO>,
    claims: ClaimSet,
    binding: BindingDigest,
}

impl<IO> BoundChannel<IO> {
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    pub fn binding(&self) -> BindingDigest {
        self.binding
    }

    pub fn get_mut(&mut self) -> &mut TlsStream<IO> {
        &mut self.stream
    }

    pub fn into_parts(self) -> (TlsStream<IO>, ClaimSet, BindingDigest) {
        (self.stream, self.claims, self.binding)
    }
}

impl<IO> fmt::Debug for BoundChannel<IO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundChannel")
            .field("issuer", &self.claims.issuer())
            .field("binding", &self.binding)
            .finish()
    }
}

/// Client side of an RA-TLS connection.
#[derive(Clone)]
pub struct RaTlsConnector {
    service: AttestationService,
    handshake_timeout: Duration,
}

impl RaTlsConnector {
    pub fn new(service: AttestationService) -> Self {
        Self {
            service,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Runs the TLS handshake over `io`, accepting the server only if its
    /// embedded evidence verifies and is bound to the presented key.
    pub async fn connect<IO>(&self, io: IO, server_name: &str) -> Result<BoundChannel<IO>, ChannelError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(AttestingVerifier::new(self.service.clone(), provider.clone()));

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ChannelError::InvalidServerName(server_name.to_string()))?;
        let connector = TlsConnector::from(Arc::new(config));

        let handshake = tokio::time::timeout(self.handshake_timeout, connector.connect(name, io))
            .await
            .map_err(|_| ChannelError::Timeout(self.handshake_timeout))?;

        match (handshake, verifier.take_outcome()) {
            (
                Ok(stream),
                Some(VerificationResult::Accepted {
                    claims,
                    binding_digest: Some(binding),
                }),
            ) => {
                info!(issuer = claims.issuer(), binding = %binding, "RA-TLS channel established");
                Ok(BoundChannel {
                    stream,
                    claims,
                    binding,
                })
            }
            (_, Some(VerificationResult::Rejected { kind, context })) => {
                warn!(code = kind.code(), ?context, "server attestation rejected");
                Err(ChannelError::Rejected { kind, context })
            }
            (Err(err), _) => Err(ChannelError::Handshake(err)),
            (Ok(_), _) => Err(ChannelError::Unattested),
        }
    }
}
