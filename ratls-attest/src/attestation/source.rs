use crate::attestation::config::{Policy, SourceConfig};
use crate::attestation::errors::AttnError;
use crate::attestation::sim::{simulated_claims, SimulatedIdentity};
use crate::attestation::types::{Evidence, EvidenceFormat, Nonce};
use crate::attestation::util::hex_to_bytes;
use anyhow::Context;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

const TOKEN_PATH: &str = "/v1/token";
const TOKEN_TYPE: &str = "COSE";
/// Lifetime of simulated evidence unless overridden.
pub const DEFAULT_SIMULATED_LIFETIME: Duration = Duration::from_secs(3600);

/// Produces attestation evidence embedding a caller-supplied nonce.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn format(&self) -> EvidenceFormat;

    /// Returns fresh evidence for `nonce`; nothing is cached between calls.
    async fn obtain(&self, nonce: &Nonce) -> Result<Evidence, AttnError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    audience: &'a str,
    token_type: &'a str,
    nonces: Vec<String>,
}

/// Queries the local hardware-attestation provider over its Unix socket.
#[derive(Debug, Clone)]
pub struct HardwareSource {
    socket: PathBuf,
    timeout: Duration,
    audience: String,
}

impl HardwareSource {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration, audience: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            timeout,
            audience: audience.into(),
        }
    }

    async fn request_token(&self, nonce: &Nonce) -> Result<Vec<u8>, AttnError> {
        let body = serde_json::to_vec(&TokenRequest {
            audience: &self.audience,
            token_type: TOKEN_TYPE,
            nonces: vec![hex::encode(nonce.as_bytes())],
        })
        .map_err(|e| AttnError::unavailable(format!("encode token request: {e}")))?;

        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            AttnError::unavailable(format!("connect {}: {e}", self.socket.display()))
        })?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| AttnError::unavailable(format!("provider handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "provider connection closed");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(TOKEN_PATH)
            .header(HOST, "localhost")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| AttnError::unavailable(format!("build token request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| AttnError::unavailable(format!("provider request: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AttnError::unavailable(format!("read provider response: {e}")))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(AttnError::unavailable(format!(
                "provider returned {status}: {}",
                String::from_utf8_lossy(&bytes).chars().take(200).collect::<String>()
            )));
        }
        if bytes.is_empty() {
            return Err(AttnError::unavailable("provider returned an empty token"));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl EvidenceSource for HardwareSource {
    fn format(&self) -> EvidenceFormat {
        EvidenceFormat::Hardware
    }

    async fn obtain(&self, nonce: &Nonce) -> Result<Evidence, AttnError> {
        let document = tokio::time::timeout(self.timeout, self.request_token(nonce))
            .await
            .map_err(|_| {
                AttnError::unavailable(format!(
                    "provider did not answer within {}ms",
                    self.timeout.as_millis()
                ))
            })??;
        debug!(len = document.len(), "received hardware evidence");
        Ok(Evidence::new(EvidenceFormat::Hardware, document))
    }
}

/// Signs evidence locally with a [`SimulatedIdentity`]. Never trusted unless
/// the policy allows simulation.
pub struct SimulatedSource {
    identity: SimulatedIdentity,
    image_digest: Vec<u8>,
    lifetime: Duration,
    clock: Option<SystemTime>,
}

impl SimulatedSource {
    pub fn new(identity: SimulatedIdentity, image_digest: impl Into<Vec<u8>>) -> Self {
        Self {
            identity,
            image_digest: image_digest.into(),
            lifetime: DEFAULT_SIMULATED_LIFETIME,
            clock: None,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Pins the issuance time for deterministic tests.
    pub fn with_fixed_clock(mut self, at: SystemTime) -> Self {
        self.clock = Some(at);
        self
    }
}

#[async_trait]
impl EvidenceSource for SimulatedSource {
    fn format(&self) -> EvidenceFormat {
        EvidenceFormat::Simulated
    }

    async fn obtain(&self, nonce: &Nonce) -> Result<Evidence, AttnError> {
        let issued_at = self.clock.unwrap_or_else(SystemTime::now);
        let claims = simulated_claims(
            &self.image_digest,
            nonce.as_bytes(),
            issued_at,
            self.lifetime.as_secs(),
        );
        let document = self.identity.sign_claims(&claims)?;
        Ok(Evidence::new(EvidenceFormat::Simulated, document))
    }
}

/// Picks the evidence source once, at construction.
///
/// Forcing simulation while the policy rejects simulated evidence is a
/// configuration error rather than a silent downgrade.
pub fn select_source(cfg: &SourceConfig, policy: &Policy) -> anyhow::Result<Arc<dyn EvidenceSource>> {
    if !cfg.force_simulated {
        info!(socket = %cfg.provider_socket.display(), "using hardware evidence provider");
        return Ok(Arc::new(HardwareSource::new(
            cfg.provider_socket.clone(),
            cfg.provider_timeout(),
            cfg.audience.clone(),
        )));
    }

    anyhow::ensure!(
        policy.simulate_allowed,
        "EVIDENCE_FORCE_SIMULATED is set but the policy does not allow simulated evidence"
    );

    let image_digest = match &cfg.simulated_image_digest {
        Some(hex) => hex_to_bytes(hex.trim_start_matches("sha256:"))
            .context("EVIDENCE_SIMULATED_IMAGE_DIGEST")?,
        None => policy
            .allowed_image_digests
            .iter()
            .min()
            .cloned()
            .unwrap_or_else(|| vec![0u8; 32]),
    };
    let identity = match &cfg.simulated_identity_path {
        Some(path) => SimulatedIdentity::load_or_create(path)?,
        None => SimulatedIdentity::generate()?,
    };
    warn!(
        root = %identity.root_fingerprint(),
        "using SIMULATED evidence; pin this root only in test environments"
    );
    Ok(Arc::new(SimulatedSource::new(identity, image_digest)))
}
