use crate::attestation::certs::public_key_of;
use crate::attestation::errors::AttnError;
use crate::attestation::types::{claims, CertificateChain, ClaimSet, ClaimValue, Evidence};
use coset::cbor::value::Value as HeaderValue;
use coset::{
    iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder, Label,
    TaggedCborSerializable,
};
use ring::signature::{self, UnparsedPublicKey};
use serde_cbor::Value as CborValue;
use std::collections::BTreeMap;
use x509_parser::prelude::*;

/// COSE header label carrying the certificate chain (`x5chain`).
const X5CHAIN_LABEL: i64 = 33;

/// Signature-verified content of an evidence document.
#[derive(Debug)]
pub struct DecodedEvidence {
    pub claims: ClaimSet,
    pub chain: CertificateChain,
}

/// Parses the COSE_Sign1 envelope, verifies it with the chain leaf's key, and
/// only then decodes the claim payload.
pub fn decode(evidence: &Evidence) -> Result<DecodedEvidence, AttnError> {
    let document = evidence.document();
    let sign1 = CoseSign1::from_tagged_slice(document)
        .or_else(|_| CoseSign1::from_slice(document))
        .map_err(|e| AttnError::malformed(format!("parse COSE_Sign1: {e:?}")))?;

    // The chain is the only thing read before the signature is checked.
    let chain = extract_chain(&sign1)?;
    let leaf_der = chain
        .leaf()
        .ok_or_else(|| AttnError::malformed("x5chain is empty"))?;
    let (_, leaf_cert) = parse_x509_certificate(leaf_der)
        .map_err(|e| AttnError::malformed(format!("parse attestation leaf: {e}")))?;
    let leaf_public_key = public_key_of(&leaf_cert);

    verify_signature(&sign1, &leaf_public_key)?;

    let payload_bytes = sign1
        .payload
        .as_ref()
        .ok_or_else(|| AttnError::malformed("missing COSE payload"))?;
    let payload: CborValue = serde_cbor::from_slice(payload_bytes)
        .map_err(|e| AttnError::malformed(format!("decode CBOR payload: {e}")))?;

    let claims = ClaimSet::from_map(extract_claims(&payload)?)?;
    Ok(DecodedEvidence { claims, chain })
}

fn extract_chain(sign1: &CoseSign1) -> Result<CertificateChain, AttnError> {
    let value = sign1
        .unprotected
        .rest
        .iter()
        .chain(sign1.protected.header.rest.iter())
        .find(|(label, _)| *label == Label::Int(X5CHAIN_LABEL))
        .map(|(_, value)| value)
        .ok_or_else(|| AttnError::malformed("x5chain header missing"))?;

    let certs = match value {
        HeaderValue::Bytes(single) => vec![single.clone()],
        HeaderValue::Array(items) => items
            .iter()
            .map(|item| match item {
                HeaderValue::Bytes(der) => Ok(der.clone()),
                other => Err(AttnError::malformed(format!(
                    "x5chain entry expected bytes, got {:?}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(AttnError::malformed(format!(
                "x5chain expected bytes or array, got {:?}",
                other
            )))
        }
    };
    if certs.is_empty() {
        return Err(AttnError::malformed("x5chain is empty"));
    }
    Ok(CertificateChain::new(certs))
}

fn verify_signature(sign1: &CoseSign1, leaf_public_key: &[u8]) -> Result<(), AttnError> {
    let alg = sign1
        .protected
        .header
        .alg
        .as_ref()
        .ok_or_else(|| AttnError::malformed("missing COSE alg"))?;

    let (ring_alg, expected_sig_len) = match alg {
        coset::Algorithm::Assigned(iana::Algorithm::ES256) => {
            (&signature::ECDSA_P256_SHA256_FIXED, 64)
        }
        coset::Algorithm::Assigned(iana::Algorithm::ES384) => {
            (&signature::ECDSA_P384_SHA384_FIXED, 96)
        }
        other => {
            return Err(AttnError::bad_signature(format!(
                "unsupported COSE alg: {:?}",
                other
            )))
        }
    };

    let unparsed = UnparsedPublicKey::new(ring_alg, leaf_public_key);
    sign1.verify_signature(&[], |sig, data| {
        let raw = normalize_ecdsa_signature(sig, expected_sig_len).map_err(AttnError::bad_signature)?;
        unparsed
            .verify(data, &raw)
            .map_err(|_| AttnError::bad_signature("COSE signature verification failed"))
    })
}

fn extract_claims(payload: &CborValue) -> Result<BTreeMap<String, ClaimValue>, AttnError> {
    let map = match payload {
        CborValue::Map(m) => m,
        _ => return Err(AttnError::malformed("payload is not a map")),
    };

    let mut out = BTreeMap::new();
    for (key, value) in map {
        let Some(name) = key_as_string(key) else {
            continue;
        };
        let claim = match name.as_str() {
            claims::ISSUED_AT | claims::EXPIRY => {
                Some(ClaimValue::Timestamp(timestamp_from_value(value, &name)?))
            }
            claims::IMAGE_DIGEST | claims::NONCE => {
                Some(ClaimValue::Digest(bytes_from_value(value, &name)?))
            }
            claims::ISSUER => Some(ClaimValue::Text(string_from_value(value, &name)?)),
            _ => generic_claim(value),
        };
        if let Some(claim) = claim {
            out.insert(name, claim);
        }
    }
    Ok(out)
}

fn generic_claim(value: &CborValue) -> Option<ClaimValue> {
    match value {
        CborValue::Text(s) => Some(ClaimValue::Text(s.clone())),
        CborValue::Bytes(b) => Some(ClaimValue::Digest(b.clone())),
        CborValue::Bool(b) => Some(ClaimValue::Bool(*b)),
        CborValue::Integer(i) => i64::try_from(*i).ok().map(ClaimValue::Integer),
        _ => None,
    }
}

fn key_as_string(key: &CborValue) -> Option<String> {
    match key {
        CborValue::Text(s) => Some(s.clone()),
        CborValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn bytes_from_value(value: &CborValue, field: &str) -> Result<Vec<u8>, AttnError> {
    match value {
        CborValue::Bytes(b) => Ok(b.clone()),
        other => Err(AttnError::malformed(format!(
            "{field} expected bytes, got {:?}",
            other
        ))),
    }
}

fn string_from_value(value: &CborValue, field: &str) -> Result<String, AttnError> {
    match value {
        CborValue::Text(s) => Ok(s.clone()),
        other => Err(AttnError::malformed(format!(
            "{field} expected text, got {:?}",
            other
        ))),
    }
}

fn timestamp_from_value(value: &CborValue, field: &str) -> Result<u64, AttnError> {
    match value {
        CborValue::Integer(i) if *i >= 0 && *i <= u64::MAX as i128 => Ok(*i as u64),
        other => Err(AttnError::malformed(format!(
            "{field} expected non-negative integer, got {:?}",
            other
        ))),
    }
}

/// Builds a tagged COSE_Sign1 (ES256) over `claims`, carrying `chain` in x5chain.
///
/// `sign` receives the COSE `Sig_structure` bytes and returns a fixed-width
/// ECDSA signature.
pub fn encode<F>(
    claims: &BTreeMap<String, ClaimValue>,
    chain: &CertificateChain,
    sign: F,
) -> Result<Vec<u8>, AttnError>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, AttnError>,
{
    let payload: BTreeMap<CborValue, CborValue> = claims
        .iter()
        .map(|(name, value)| (CborValue::Text(name.clone()), claim_to_cbor(value)))
        .collect();
    let payload = serde_cbor::to_vec(&CborValue::Map(payload))
        .map_err(|e| AttnError::malformed(format!("encode CBOR payload: {e}")))?;

    let x5chain = HeaderValue::Array(
        chain
            .iter()
            .map(|der| HeaderValue::Bytes(der.to_vec()))
            .collect(),
    );
    let protected = HeaderBuilder::new()
        .algorithm(iana::Algorithm::ES256)
        .build();
    let unprotected = HeaderBuilder::new().value(X5CHAIN_LABEL, x5chain).build();

    let mut sign1 = CoseSign1Builder::new()
        .protected(protected)
        .unprotected(unprotected)
        .payload(payload)
        .build();
    sign1.signature = sign(&sign1.tbs_data(&[]))?;
    sign1
        .to_tagged_vec()
        .map_err(|e| AttnError::malformed(format!("serialize COSE_Sign1: {e:?}")))
}

fn claim_to_cbor(value: &ClaimValue) -> CborValue {
    match value {
        ClaimValue::Text(s) => CborValue::Text(s.clone()),
        ClaimValue::Integer(i) => CborValue::Integer(*i as i128),
        ClaimValue::Digest(d) => CborValue::Bytes(d.clone()),
        ClaimValue::Timestamp(t) => CborValue::Integer(*t as i128),
        ClaimValue::Bool(b) => CborValue::Bool(*b),
    }
}

/// Accepts either raw fixed-width signatures or DER-encoded ones and normalises to raw.
fn normalize_ecdsa_signature(sig: &[u8], expected_len: usize) -> Result<Vec<u8>, String> {
    if sig.len() == expected_len {
        return Ok(sig.to_vec());
    }
    if sig.len() < 8 || sig.first() != Some(&0x30) {
        return Err(format!(
            "unexpected ECDSA signature format (len={})",
            sig.len()
        ));
    }
    let total_len = sig[1] as usize;
    if total_len + 2 != sig.len() {
        return Err(format!(
            "DER signature length mismatch (declared={}, actual={})",
            total_len,
            sig.len()
        ));
    }
    let mut idx = 2;
    let r = der_read_int(sig, &mut idx, expected_len / 2)?;
    let s = der_read_int(sig, &mut idx, expected_len / 2)?;
    if idx != sig.len() {
        return Err("unexpected trailing data in DER signature".into());
    }
    let mut out = Vec::with_capacity(expected_len);
    out.extend_from_slice(&r);
    out.extend_from_slice(&s);
    Ok(out)
}

fn der_read_int(sig: &[u8], idx: &mut usize, part_len: usize) -> Result<Vec<u8>, String> {
    if *idx >= sig.len() || sig[*idx] != 0x02 {
        return Err("expected INTEGER tag in DER signature".into());
    }
    *idx += 1;
    if *idx >= sig.len() {
        return Err("incomplete DER length".into());
    }
    let len = sig[*idx] as usize;
    *idx += 1;
    if len & 0x80 != 0 {
        return Err("unsupported DER length encoding".into());
    }
    if *idx + len > sig.len() {
        return Err("DER INTEGER overruns signature buffer".into());
    }
    let mut value = &sig[*idx..*idx + len];
    *idx += len;
    while !value.is_empty() && value[0] == 0 {
        value = &value[1..];
    }
    if value.len() > part_len {
        return Err(format!(
            "DER INTEGER too large (len={}, expected <= {})",
            value.len(),
            part_len
        ));
    }
    let mut out = vec![0u8; part_len];
    let start = part_len - value.len();
    out[start..].copy_from_slice(value);
    Ok(out)
}
