//! RA-TLS: attestation evidence carried in a self-signed certificate whose
//! key is the session key the evidence is bound to.

pub mod client;
pub mod server;

use crate::attestation::AttnError;
use x509_parser::prelude::*;

/// Arc components of the certificate extension holding the evidence bundle.
pub const EVIDENCE_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 9999, 1, 1];

fn evidence_oid_string() -> String {
    EVIDENCE_EXTENSION_OID
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Returns the evidence bundle embedded in an RA-TLS certificate.
pub fn extract_evidence(cert_der: &[u8]) -> Result<Vec<u8>, AttnError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| AttnError::malformed(format!("parse RA-TLS certificate: {e}")))?;
    let oid = evidence_oid_string();
    cert.extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == oid)
        .map(|ext| ext.value.to_vec())
        .ok_or_else(|| AttnError::malformed(format!("certificate has no evidence extension {oid}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_renders_dotted() {
        assert_eq!(evidence_oid_string(), "1.3.6.1.4.1.9999.1.1");
    }

    #[test]
    fn plain_certificate_has_no_evidence() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("cert");
        let der = cert.serialize_der().expect("der");
        let err = extract_evidence(&der).unwrap_err();
        assert_eq!(err.kind(), crate::attestation::ErrorKind::MalformedEvidence);
    }
}
