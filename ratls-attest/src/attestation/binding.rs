use crate::attestation::errors::AttnError;
use crate::attestation::source::EvidenceSource;
use crate::attestation::types::{ClaimSet, Evidence, Nonce};
use crate::attestation::util::constant_time_eq;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};
use x509_parser::prelude::*;

const BINDING_DOMAIN: &[u8] = b"ratls-session-binding-v1";

/// Ephemeral key material identifying one transport session.
///
/// For RA-TLS this is the SubjectPublicKeyInfo of the key the server proves
/// possession of during the handshake.
#[derive(Clone)]
pub struct SessionMaterial(Vec<u8>);

impl SessionMaterial {
    pub fn from_spki(spki_der: &[u8]) -> Self {
        Self(spki_der.to_vec())
    }

    /// Extracts the SPKI of a presented TLS certificate.
    pub fn from_certificate(cert_der: &[u8]) -> Result<Self, AttnError> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| AttnError::malformed(format!("parse peer certificate: {e}")))?;
        Ok(Self(cert.tbs_certificate.subject_pki.raw.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// One-way digest used as the evidence nonce for this session.
    pub fn digest(&self) -> BindingDigest {
        let mut h = Sha256::new();
        h.update(BINDING_DOMAIN);
        h.update(&self.0);
        BindingDigest(h.finalize().into())
    }
}

impl fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("len", &self.0.len())
            .finish()
    }
}

/// SHA-256 digest tying evidence to one session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingDigest([u8; 32]);

impl BindingDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn as_nonce(&self) -> Nonce {
        Nonce::from_digest(self.0)
    }
}

impl fmt::Debug for BindingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindingDigest({})", self.to_hex())
    }
}

impl fmt::Display for BindingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Ties evidence to a transport session on both sides of the handshake.
pub struct ChannelBinder<'a> {
    source: &'a dyn EvidenceSource,
}

impl<'a> ChannelBinder<'a> {
    pub fn new(source: &'a dyn EvidenceSource) -> Self {
        Self { source }
    }

    /// Server side: request evidence whose nonce is the session digest.
    pub async fn bind(&self, material: &SessionMaterial) -> Result<Evidence, AttnError> {
        let digest = material.digest();
        debug!(binding = %digest, format = %self.source.format(), "requesting session-bound evidence");
        self.source.obtain(&digest.as_nonce()).await
    }

    /// Client side: recompute the digest and compare it to the accepted nonce.
    pub fn verify_binding(
        material: &SessionMaterial,
        claims: &ClaimSet,
    ) -> Result<BindingDigest, AttnError> {
        let digest = material.digest();
        if !constant_time_eq(digest.as_bytes(), claims.nonce()) {
            warn!("evidence nonce does not match the session binding");
            return Err(AttnError::BindingMismatch);
        }
        Ok(digest)
    }
}
