use anyhow::Result;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine as _;
use ratls_attest::attestation::AttestationService;
use ratls_attest::ratls::server::{generate_ratls_material, RaTlsMaterial};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// Shared by every handler; cheap to clone.
#[derive(Clone)]
pub struct PublicState {
    pub service: AttestationService,
}

/// RA-TLS material for a single connection plus the TLS config presenting it.
pub struct ServedCertificate {
    pub server_config: Arc<ServerConfig>,
    pub material: RaTlsMaterial,
}

/// Mints fresh key, evidence and certificate for every accepted connection.
pub struct CertificateIssuer {
    service: AttestationService,
    server_names: Vec<String>,
    validity: Duration,
}

impl CertificateIssuer {
    pub fn new(service: AttestationService, server_names: Vec<String>, validity: Duration) -> Self {
        Self {
            service,
            server_names,
            validity,
        }
    }

    pub async fn issue(&self) -> Result<ServedCertificate> {
        let material =
            generate_ratls_material(&self.service, &self.server_names, self.validity).await?;
        let server_config = material.server_config()?;
        Ok(ServedCertificate {
            server_config,
            material,
        })
    }
}

#[derive(Clone, Debug, serde::Serialize)]
/// JSON body of `GET /attestation`: the evidence behind the certificate this
/// connection was served with.
pub struct AttestationResponse {
    /// Hex SHA-256 session binding the evidence nonce must equal.
    pub binding_hex: String,
    pub format: String,
    /// Base64 COSE_Sign1 evidence document.
    pub document_b64: String,
    /// The presented TLS certificate (DER, base64).
    pub cert_der_b64: String,
    /// Seconds since the Unix epoch.
    pub generated_at: u64,
}

impl AttestationResponse {
    pub fn from_served(served: &ServedCertificate) -> Self {
        let material = &served.material;
        Self {
            binding_hex: material.binding.to_hex(),
            format: material.evidence.format().to_string(),
            document_b64: b64.encode(material.evidence.document()),
            cert_der_b64: b64.encode(&material.cert_der),
            generated_at: material
                .generated_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}
