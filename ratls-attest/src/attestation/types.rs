use crate::attestation::binding::BindingDigest;
use crate::attestation::errors::{AttnError, ErrorContext, ErrorKind};
use crate::attestation::util::{decode_b64, encode_b64};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lower bound on caller nonces; anything shorter is guessable enough to replay.
pub const MIN_NONCE_LEN: usize = 16;
/// Upper bound accepted by the attestation provider.
pub const MAX_NONCE_LEN: usize = 74;

/// Claim names understood by the decoder and the policy engine.
pub mod claims {
    pub const ISSUER: &str = "iss";
    pub const IMAGE_DIGEST: &str = "image_digest";
    pub const ISSUED_AT: &str = "iat";
    pub const EXPIRY: &str = "exp";
    pub const NONCE: &str = "eat_nonce";
    pub const SECURE_BOOT: &str = "secboot";
    pub const DEBUG_STATUS: &str = "dbgstat";
    pub const HARDWARE_MODEL: &str = "hwmodel";
    pub const SOFTWARE_NAME: &str = "swname";

    /// `hwmodel` reported by the simulated generator.
    pub const SIMULATED_HARDWARE: &str = "SIMULATED";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Where a piece of evidence came from.
pub enum EvidenceFormat {
    Hardware,
    Simulated,
}

impl fmt::Display for EvidenceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceFormat::Hardware => f.write_str("hardware"),
            EvidenceFormat::Simulated => f.write_str("simulated"),
        }
    }
}

/// Raw attestation evidence: a signed COSE document plus its format tag.
///
/// Evidence is generated per handshake and never persisted; `Debug` only
/// reports the document length.
#[derive(Clone, PartialEq, Eq)]
pub struct Evidence {
    format: EvidenceFormat,
    document: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
/// JSON shape of an evidence bundle as it travels between peers.
struct EvidenceEnvelope {
    format: EvidenceFormat,
    document_b64: String,
}

impl Evidence {
    pub fn new(format: EvidenceFormat, document: Vec<u8>) -> Self {
        Self { format, document }
    }

    pub fn format(&self) -> EvidenceFormat {
        self.format
    }

    pub fn document(&self) -> &[u8] {
        &self.document
    }

    /// Serializes the evidence into its wire bundle.
    pub fn to_bundle(&self) -> Vec<u8> {
        let envelope = EvidenceEnvelope {
            format: self.format,
            document_b64: encode_b64(&self.document),
        };
        // Serializing a struct of two strings cannot fail.
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    /// Parses a wire bundle produced by [`Evidence::to_bundle`].
    pub fn from_bundle(bundle: &[u8]) -> Result<Self, AttnError> {
        let envelope: EvidenceEnvelope = serde_json::from_slice(bundle)
            .map_err(|e| AttnError::malformed(format!("bundle json: {e}")))?;
        let document = decode_b64("document_b64", &envelope.document_b64)?;
        if document.is_empty() {
            return Err(AttnError::malformed("empty evidence document"));
        }
        Ok(Self {
            format: envelope.format,
            document,
        })
    }
}

impl fmt::Debug for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evidence")
            .field("format", &self.format)
            .field("document_len", &self.document.len())
            .finish()
    }
}

/// Single-use challenge bound into evidence.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(Vec<u8>);

impl Nonce {
    pub fn new(bytes: Vec<u8>) -> Result<Self, AttnError> {
        if bytes.len() < MIN_NONCE_LEN || bytes.len() > MAX_NONCE_LEN {
            return Err(AttnError::malformed(format!(
                "nonce must be {MIN_NONCE_LEN}..={MAX_NONCE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Fresh 32-byte nonce from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// A 32-byte digest always sits within the nonce bounds.
    pub(crate) fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Typed value of a single claim.
pub enum ClaimValue {
    Text(String),
    Integer(i64),
    Digest(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
    Bool(bool),
}

impl fmt::Display for ClaimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimValue::Text(s) => f.write_str(s),
            ClaimValue::Integer(i) => write!(f, "{i}"),
            ClaimValue::Digest(d) => f.write_str(&hex::encode(d)),
            ClaimValue::Timestamp(t) => write!(f, "{t}"),
            ClaimValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Decoded, signature-verified claims. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    claims: BTreeMap<String, ClaimValue>,
}

impl ClaimSet {
    /// Builds a claim set, requiring every mandatory claim with its expected type.
    pub fn from_map(claims: BTreeMap<String, ClaimValue>) -> Result<Self, AttnError> {
        let set = Self { claims };
        set.require(claims::ISSUER, |v| matches!(v, ClaimValue::Text(_)))?;
        set.require(claims::IMAGE_DIGEST, |v| matches!(v, ClaimValue::Digest(d) if !d.is_empty()))?;
        set.require(claims::ISSUED_AT, |v| matches!(v, ClaimValue::Timestamp(_)))?;
        set.require(claims::EXPIRY, |v| matches!(v, ClaimValue::Timestamp(_)))?;
        set.require(claims::NONCE, |v| matches!(v, ClaimValue::Digest(d) if !d.is_empty()))?;
        Ok(set)
    }

    fn require(&self, name: &str, ok: impl Fn(&ClaimValue) -> bool) -> Result<(), AttnError> {
        match self.claims.get(name) {
            Some(value) if ok(value) => Ok(()),
            Some(_) => Err(AttnError::malformed(format!("claim {name} has wrong type"))),
            None => Err(AttnError::malformed(format!("{name} missing"))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.claims.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClaimValue)> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn issuer(&self) -> &str {
        match self.claims.get(claims::ISSUER) {
            Some(ClaimValue::Text(s)) => s,
            _ => "",
        }
    }

    pub fn image_digest(&self) -> &[u8] {
        self.digest(claims::IMAGE_DIGEST)
    }

    pub fn nonce(&self) -> &[u8] {
        self.digest(claims::NONCE)
    }

    pub fn issued_at(&self) -> u64 {
        self.timestamp(claims::ISSUED_AT)
    }

    pub fn expiry(&self) -> u64 {
        self.timestamp(claims::EXPIRY)
    }

    pub fn secure_boot(&self) -> Option<bool> {
        match self.claims.get(claims::SECURE_BOOT) {
            Some(ClaimValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn debug_status(&self) -> Option<&str> {
        self.text(claims::DEBUG_STATUS)
    }

    pub fn hardware_model(&self) -> Option<&str> {
        self.text(claims::HARDWARE_MODEL)
    }

    fn text(&self, name: &str) -> Option<&str> {
        match self.claims.get(name) {
            Some(ClaimValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    // Mandatory claims are type-checked in `from_map`, so the fallbacks are unreachable.
    fn digest(&self, name: &str) -> &[u8] {
        match self.claims.get(name) {
            Some(ClaimValue::Digest(d)) => d,
            _ => &[],
        }
    }

    fn timestamp(&self, name: &str) -> u64 {
        match self.claims.get(name) {
            Some(ClaimValue::Timestamp(t)) => *t,
            _ => 0,
        }
    }
}

/// Ordered leaf-to-root certificate sequence (DER).
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self { certs }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.certs.first().map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.certs.iter().map(Vec::as_slice)
    }

    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.certs.get(idx).map(Vec::as_slice)
    }
}

impl fmt::Debug for CertificateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateChain")
            .field("len", &self.certs.len())
            .finish()
    }
}

/// Unified outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Accepted {
        claims: ClaimSet,
        /// `None` for plain challenge-response verification.
        binding_digest: Option<BindingDigest>,
    },
    Rejected {
        kind: ErrorKind,
        context: ErrorContext,
    },
}

impl VerificationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, VerificationResult::Accepted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_claims() -> BTreeMap<String, ClaimValue> {
        let mut map = BTreeMap::new();
        map.insert(claims::ISSUER.into(), ClaimValue::Text("issuer".into()));
        map.insert(claims::IMAGE_DIGEST.into(), ClaimValue::Digest(vec![0xAA; 32]));
        map.insert(claims::ISSUED_AT.into(), ClaimValue::Timestamp(100));
        map.insert(claims::EXPIRY.into(), ClaimValue::Timestamp(200));
        map.insert(claims::NONCE.into(), ClaimValue::Digest(vec![0x01; 32]));
        map
    }

    #[test]
    fn claim_set_requires_every_mandatory_claim() {
        for name in [
            claims::ISSUER,
            claims::IMAGE_DIGEST,
            claims::ISSUED_AT,
            claims::EXPIRY,
            claims::NONCE,
        ] {
            let mut map = base_claims();
            map.remove(name);
            let err = ClaimSet::from_map(map).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedEvidence, "{name}");
        }
        let set = ClaimSet::from_map(base_claims()).expect("complete claims");
        assert_eq!(set.issuer(), "issuer");
        assert_eq!(set.expiry(), 200);
    }

    #[test]
    fn mistyped_mandatory_claim_is_malformed() {
        let mut map = base_claims();
        map.insert(claims::ISSUED_AT.into(), ClaimValue::Text("yesterday".into()));
        let err = ClaimSet::from_map(map).unwrap_err();
        assert!(matches!(err, AttnError::MalformedEvidence { .. }));
    }

    #[test]
    fn bundle_round_trip_keeps_format_and_hides_bytes_in_debug() {
        let evidence = Evidence::new(EvidenceFormat::Simulated, vec![1, 2, 3]);
        let parsed = Evidence::from_bundle(&evidence.to_bundle()).expect("parse bundle");
        assert_eq!(parsed, evidence);
        let dbg = format!("{parsed:?}");
        assert!(dbg.contains("document_len: 3"));
    }

    #[test]
    fn nonce_length_is_bounded() {
        assert!(Nonce::new(vec![0; 15]).is_err());
        assert!(Nonce::new(vec![0; 16]).is_ok());
        assert!(Nonce::new(vec![0; 75]).is_err());
        assert_eq!(Nonce::random().as_bytes().len(), 32);
    }
}
