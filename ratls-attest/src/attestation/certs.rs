use crate::attestation::config::{Policy, RevocationList};
use crate::attestation::errors::AttnError;
use crate::attestation::types::CertificateChain;
use crate::attestation::util::{normalize_fingerprint, sha256_fingerprint, unix_secs};
use anyhow::{anyhow, Context};
use ring::signature::{self, UnparsedPublicKey};
use rustls_pemfile as pemfile;
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, SystemTime};
use x509_parser::prelude::*;

/// Captured data for the pinned root certificate.
pub struct RootMetadata {
    pub fingerprint: String,
    pub subject_display: String,
}

/// Loads the first PEM certificate in `path` and returns its fingerprint and subject.
pub fn load_pinned_root(path: &Path) -> anyhow::Result<RootMetadata> {
    let bytes = std::fs::read(path).with_context(|| format!("read {:?}", path))?;
    let mut cursor = Cursor::new(&bytes);
    let certs = pemfile::certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("parse PEM in {:?}: {e:?}", path))?;
    let der = certs
        .first()
        .ok_or_else(|| anyhow!("no certificate found in {:?}", path))?;
    let (_, cert) = parse_x509_certificate(der.as_ref())
        .map_err(|e| anyhow!("parse root certificate {:?}: {e}", path))?;
    Ok(RootMetadata {
        fingerprint: sha256_fingerprint(der.as_ref()),
        subject_display: format!("{}", cert.subject()),
    })
}

/// Summary produced after a chain validates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    pub leaf_fingerprint: String,
    pub root_fingerprint: String,
    pub root_subject: String,
}

/// Validates an evidence certificate chain against a pinned root.
pub struct ChainValidator<'a> {
    pinned_root: String,
    max_len: usize,
    clock_skew: Duration,
    revocation: Option<&'a RevocationList>,
}

impl<'a> ChainValidator<'a> {
    pub fn new(pinned_root: &str, max_len: usize, clock_skew: Duration) -> Self {
        Self {
            pinned_root: normalize_fingerprint(pinned_root),
            max_len,
            clock_skew,
            revocation: None,
        }
    }

    pub fn from_policy(policy: &'a Policy) -> Self {
        Self {
            pinned_root: normalize_fingerprint(&policy.pinned_root),
            max_len: policy.max_chain_len,
            clock_skew: policy.clock_skew_tolerance,
            revocation: policy.revocation.as_ref(),
        }
    }

    pub fn with_revocation(mut self, list: &'a RevocationList) -> Self {
        self.revocation = Some(list);
        self
    }

    /// Runs linkage, validity, root pinning, then revocation. No partial trust:
    /// the first failure rejects the whole chain.
    pub fn validate(
        &self,
        chain: &CertificateChain,
        at: SystemTime,
    ) -> Result<ChainSummary, AttnError> {
        let parsed = self.parse_all(chain)?;
        self.check_linkage(&parsed)?;
        self.check_validity(&parsed, at)?;
        let (root_fingerprint, root_subject) = self.check_root(chain, &parsed)?;
        self.check_revocation(&parsed)?;

        let leaf_fingerprint = sha256_fingerprint(chain.leaf().unwrap_or_default());
        Ok(ChainSummary {
            leaf_fingerprint,
            root_fingerprint,
            root_subject,
        })
    }

    fn parse_all<'c>(
        &self,
        chain: &'c CertificateChain,
    ) -> Result<Vec<X509Certificate<'c>>, AttnError> {
        if chain.is_empty() {
            return Err(broken(0, "<none>", "empty certificate chain"));
        }
        if chain.len() > self.max_len {
            // Name the first certificate past the limit.
            let subject = chain
                .get(self.max_len)
                .and_then(|der| parse_x509_certificate(der).ok())
                .map(|(_, cert)| subject_of(&cert))
                .unwrap_or_else(|| "<unparsable>".into());
            return Err(broken(
                self.max_len,
                &subject,
                format!("chain length {} exceeds limit {}", chain.len(), self.max_len),
            ));
        }
        chain
            .iter()
            .enumerate()
            .map(|(idx, der)| {
                parse_x509_certificate(der)
                    .map(|(_, cert)| cert)
                    .map_err(|e| broken(idx, "<unparsable>", format!("parse certificate: {e}")))
            })
            .collect()
    }

    fn check_linkage(&self, certs: &[X509Certificate<'_>]) -> Result<(), AttnError> {
        let last = certs.len() - 1;
        for (idx, cert) in certs.iter().enumerate() {
            let parent = certs.get(idx + 1).unwrap_or(cert);
            let subject = subject_of(cert);

            if cert.tbs_certificate.issuer.as_raw() != parent.tbs_certificate.subject.as_raw() {
                let reason = if idx == last {
                    "terminal certificate is not self-issued"
                } else {
                    "issuer does not match next certificate's subject"
                };
                return Err(broken(idx, &subject, reason));
            }

            ensure_basic_constraints(cert, idx != 0).map_err(|e| broken(idx, &subject, e))?;
            verify_signed_by(cert, parent).map_err(|e| broken(idx, &subject, e))?;
        }
        Ok(())
    }

    fn check_validity(&self, certs: &[X509Certificate<'_>], at: SystemTime) -> Result<(), AttnError> {
        let now = unix_secs(at);
        let skew = self.clock_skew.as_secs() as i64;
        for (idx, cert) in certs.iter().enumerate() {
            let not_before = cert.validity().not_before.timestamp();
            let not_after = cert.validity().not_after.timestamp();
            if now < not_before.saturating_sub(skew) || now > not_after {
                return Err(AttnError::CertificateExpired {
                    index: idx,
                    subject: subject_of(cert),
                    not_before,
                    not_after,
                    at: now,
                });
            }
        }
        Ok(())
    }

    fn check_root(
        &self,
        chain: &CertificateChain,
        certs: &[X509Certificate<'_>],
    ) -> Result<(String, String), AttnError> {
        let idx = certs.len() - 1;
        let root = &certs[idx];
        let fingerprint = sha256_fingerprint(chain.get(idx).unwrap_or_default());
        if fingerprint != self.pinned_root {
            return Err(AttnError::UntrustedRoot {
                index: idx,
                subject: subject_of(root),
                fingerprint,
            });
        }
        Ok((fingerprint, subject_of(root)))
    }

    fn check_revocation(&self, certs: &[X509Certificate<'_>]) -> Result<(), AttnError> {
        let Some(list) = self.revocation else {
            return Ok(());
        };
        for (idx, cert) in certs.iter().enumerate() {
            let serial = hex::encode(cert.tbs_certificate.raw_serial());
            if list.is_revoked(&serial) {
                return Err(AttnError::RevocationCheckFailed {
                    index: idx,
                    subject: subject_of(cert),
                    reason: format!("serial {serial} is revoked"),
                });
            }
        }
        Ok(())
    }
}

fn broken(index: usize, subject: &str, reason: impl Into<String>) -> AttnError {
    AttnError::ChainBroken {
        index,
        subject: subject.to_string(),
        reason: reason.into(),
    }
}

fn subject_of(cert: &X509Certificate<'_>) -> String {
    format!("{}", cert.subject())
}

/// Public key bytes of a certificate, as ring expects them.
pub(crate) fn public_key_of(cert: &X509Certificate<'_>) -> Vec<u8> {
    cert.tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .to_vec()
}

fn verify_signed_by(cert: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> Result<(), String> {
    let alg = map_signature_oid(&cert.signature_algorithm.algorithm)?;
    let parent_key = public_key_of(parent);
    UnparsedPublicKey::new(alg, &parent_key)
        .verify(
            cert.tbs_certificate.as_ref(),
            cert.signature_value.data.as_ref(),
        )
        .map_err(|_| "certificate signature verification failed".to_string())
}

fn ensure_basic_constraints(cert: &X509Certificate<'_>, expect_ca: bool) -> Result<(), String> {
    let bc = cert
        .basic_constraints()
        .map_err(|e| format!("basicConstraints parse error: {e}"))?;
    if expect_ca {
        let bc = bc.ok_or_else(|| "missing basicConstraints on CA".to_string())?;
        if !bc.value.ca {
            return Err("certificate missing CA=true in basicConstraints".into());
        }
    } else if let Some(bc) = bc {
        if bc.value.ca {
            return Err("leaf certificate unexpectedly marked as CA".into());
        }
    }

    let ku = cert
        .key_usage()
        .map_err(|e| format!("keyUsage parse error: {e}"))?;
    if expect_ca {
        let ku = ku.ok_or_else(|| "missing keyUsage on CA".to_string())?;
        if !ku.value.key_cert_sign() {
            return Err("CA certificate missing keyCertSign usage".into());
        }
    } else if let Some(ku) = ku {
        if ku.value.key_cert_sign() {
            return Err("leaf certificate unexpectedly has keyCertSign usage".into());
        }
    }

    Ok(())
}

fn map_signature_oid(
    oid: &x509_parser::der_parser::oid::Oid<'_>,
) -> Result<&'static dyn signature::VerificationAlgorithm, String> {
    let oid_str = oid.to_id_string();
    let alg: &'static dyn signature::VerificationAlgorithm = match oid_str.as_str() {
        "1.2.840.10045.4.3.2" => &signature::ECDSA_P256_SHA256_ASN1,
        "1.2.840.10045.4.3.3" => &signature::ECDSA_P384_SHA384_ASN1,
        "1.2.840.113549.1.1.11" => &signature::RSA_PKCS1_2048_8192_SHA256,
        "1.2.840.113549.1.1.12" => &signature::RSA_PKCS1_2048_8192_SHA384,
        "1.2.840.113549.1.1.13" => &signature::RSA_PKCS1_2048_8192_SHA512,
        other => {
            return Err(format!(
                "unsupported certificate signature algorithm OID {other}"
            ))
        }
    };
    Ok(alg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::errors::ErrorKind;
    use crate::attestation::sim::{IdentityWindows, SimulatedIdentity};
    use std::io::Write;

    const DAY: Duration = Duration::from_secs(86_400);

    fn validator<'a>(identity: &SimulatedIdentity) -> ChainValidator<'a> {
        ChainValidator::new(&identity.root_fingerprint(), 5, Duration::from_secs(30))
    }

    #[test]
    fn accepts_valid_three_level_chain() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let summary = validator(&identity)
            .validate(&identity.chain(), SystemTime::now())
            .expect("valid chain");
        assert_eq!(summary.root_fingerprint, identity.root_fingerprint());
        assert!(summary.root_subject.contains("Simulated Root"));
    }

    #[test]
    fn rejects_chain_with_other_pinned_root() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let other = SimulatedIdentity::generate().expect("other identity");
        let err = validator(&other)
            .validate(&identity.chain(), SystemTime::now())
            .unwrap_err();
        match err {
            AttnError::UntrustedRoot { index, .. } => assert_eq!(index, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_expired_intermediate_with_its_index() {
        let now = SystemTime::now();
        let windows = IdentityWindows {
            intermediate: (now - 10 * DAY, now - DAY),
            ..IdentityWindows::around(now)
        };
        let identity = SimulatedIdentity::generate_with(windows).expect("identity");
        let err = validator(&identity)
            .validate(&identity.chain(), now)
            .unwrap_err();
        match err {
            AttnError::CertificateExpired { index, subject, .. } => {
                assert_eq!(index, 1);
                assert!(subject.contains("Simulated Intermediate"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn skew_absorbs_not_yet_valid_leaf_but_not_expiry() {
        let now = SystemTime::now();
        let windows = IdentityWindows {
            leaf: (now + Duration::from_secs(10), now + DAY),
            ..IdentityWindows::around(now)
        };
        let identity = SimulatedIdentity::generate_with(windows).expect("identity");
        validator(&identity)
            .validate(&identity.chain(), now)
            .expect("10s early leaf is within skew");

        let strict = ChainValidator::new(&identity.root_fingerprint(), 5, Duration::ZERO);
        let err = strict.validate(&identity.chain(), now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateExpired);
    }

    #[test]
    fn rejects_reordered_chain_as_broken() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let mut certs: Vec<Vec<u8>> = identity.chain().iter().map(<[u8]>::to_vec).collect();
        certs.swap(0, 1);
        let err = validator(&identity)
            .validate(&CertificateChain::new(certs), SystemTime::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainBroken);
    }

    #[test]
    fn rejects_leaf_signed_by_foreign_intermediate() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let other = SimulatedIdentity::generate().expect("other identity");
        let mut certs: Vec<Vec<u8>> = identity.chain().iter().map(<[u8]>::to_vec).collect();
        // Same subject names, different keys: linkage by name holds, signatures do not.
        certs[0] = other.chain().leaf().expect("leaf").to_vec();
        let err = validator(&identity)
            .validate(&CertificateChain::new(certs), SystemTime::now())
            .unwrap_err();
        match err {
            AttnError::ChainBroken { index, reason, .. } => {
                assert_eq!(index, 0);
                assert!(reason.contains("signature"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_overlong_chain() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let limited = ChainValidator::new(&identity.root_fingerprint(), 2, Duration::ZERO);
        let err = limited
            .validate(&identity.chain(), SystemTime::now())
            .unwrap_err();
        match err {
            AttnError::ChainBroken { index, subject, .. } => {
                assert_eq!(index, 2);
                assert!(subject.contains("Simulated Root"), "{subject}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_revoked_intermediate() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let chain = identity.chain();
        let (_, intermediate) = parse_x509_certificate(chain.get(1).expect("intermediate")).expect("parse");
        let revoked = RevocationList::new([hex::encode(intermediate.tbs_certificate.raw_serial())]);
        let err = validator(&identity)
            .with_revocation(&revoked)
            .validate(&chain, SystemTime::now())
            .unwrap_err();
        match err {
            AttnError::RevocationCheckFailed { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loads_pinned_root_from_pem() {
        let identity = SimulatedIdentity::generate().expect("identity");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(identity.root_pem().as_bytes()).expect("write pem");
        let meta = load_pinned_root(file.path()).expect("load root");
        assert_eq!(meta.fingerprint, identity.root_fingerprint());
        assert!(meta.subject_display.contains("Simulated Root"));
    }
}
