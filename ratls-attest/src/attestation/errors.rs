use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Structured diagnostic context attached to a rejection.
///
/// Values are short, human-readable strings (subjects, indices, check names,
/// hex fingerprints). Evidence bytes and key material never end up here.
pub type ErrorContext = BTreeMap<&'static str, String>;

/// Stable, machine-readable classification of a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EvidenceUnavailable,
    MalformedEvidence,
    SignatureInvalid,
    ChainBroken,
    CertificateExpired,
    UntrustedRoot,
    RevocationCheckFailed,
    PolicyViolation,
    BindingMismatch,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::EvidenceUnavailable => "EVIDENCE_UNAVAILABLE",
            ErrorKind::MalformedEvidence => "MALFORMED_EVIDENCE",
            ErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorKind::ChainBroken => "CHAIN_BROKEN",
            ErrorKind::CertificateExpired => "CERTIFICATE_EXPIRED",
            ErrorKind::UntrustedRoot => "UNTRUSTED_ROOT",
            ErrorKind::RevocationCheckFailed => "REVOCATION_CHECK_FAILED",
            ErrorKind::PolicyViolation => "POLICY_VIOLATION",
            ErrorKind::BindingMismatch => "BINDING_MISMATCH",
        }
    }

    /// Only an unavailable provider may be retried, and only with a fresh attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::EvidenceUnavailable)
    }

    /// A binding mismatch signals interception or replay and must end the connection.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::BindingMismatch)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Individual acceptance checks performed by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyCheck {
    Simulation,
    Issuer,
    ImageDigest,
    MaxAge,
    IssuedInFuture,
    Expiry,
    Nonce,
    SecureBoot,
    DebugMode,
}

impl PolicyCheck {
    pub fn code(self) -> &'static str {
        match self {
            PolicyCheck::Simulation => "simulation_not_allowed",
            PolicyCheck::Issuer => "issuer",
            PolicyCheck::ImageDigest => "image_digest",
            PolicyCheck::MaxAge => "max_age",
            PolicyCheck::IssuedInFuture => "issued_in_future",
            PolicyCheck::Expiry => "expiry",
            PolicyCheck::Nonce => "nonce",
            PolicyCheck::SecureBoot => "secure_boot",
            PolicyCheck::DebugMode => "debug_mode",
        }
    }
}

impl fmt::Display for PolicyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// High-level error taxonomy consumers can match on when verification fails.
pub enum AttnError {
    #[error("evidence unavailable: {reason}")]
    EvidenceUnavailable { reason: String },
    #[error("malformed evidence: {reason}")]
    MalformedEvidence { reason: String },
    #[error("evidence signature invalid: {reason}")]
    SignatureInvalid { reason: String },
    #[error("certificate chain broken at index {index} ({subject}): {reason}")]
    ChainBroken {
        index: usize,
        subject: String,
        reason: String,
    },
    #[error("certificate {index} ({subject}) not valid at {at} (nb={not_before} na={not_after})")]
    CertificateExpired {
        index: usize,
        subject: String,
        not_before: i64,
        not_after: i64,
        at: i64,
    },
    #[error("untrusted root at index {index} ({subject}), fingerprint {fingerprint}")]
    UntrustedRoot {
        index: usize,
        subject: String,
        fingerprint: String,
    },
    #[error("revocation check failed for certificate {index} ({subject}): {reason}")]
    RevocationCheckFailed {
        index: usize,
        subject: String,
        reason: String,
    },
    #[error("policy violation: {check}")]
    PolicyViolation {
        check: PolicyCheck,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("session binding mismatch")]
    BindingMismatch,
}

impl AttnError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        AttnError::EvidenceUnavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AttnError::MalformedEvidence {
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_signature(reason: impl Into<String>) -> Self {
        AttnError::SignatureInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(check: PolicyCheck) -> Self {
        AttnError::PolicyViolation {
            check,
            expected: None,
            actual: None,
        }
    }

    pub(crate) fn violation_with(
        check: PolicyCheck,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        AttnError::PolicyViolation {
            check,
            expected: Some(expected.into()),
            actual: Some(actual.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AttnError::EvidenceUnavailable { .. } => ErrorKind::EvidenceUnavailable,
            AttnError::MalformedEvidence { .. } => ErrorKind::MalformedEvidence,
            AttnError::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            AttnError::ChainBroken { .. } => ErrorKind::ChainBroken,
            AttnError::CertificateExpired { .. } => ErrorKind::CertificateExpired,
            AttnError::UntrustedRoot { .. } => ErrorKind::UntrustedRoot,
            AttnError::RevocationCheckFailed { .. } => ErrorKind::RevocationCheckFailed,
            AttnError::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            AttnError::BindingMismatch => ErrorKind::BindingMismatch,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Structured context for logs and rejected results.
    pub fn context(&self) -> ErrorContext {
        let mut ctx = ErrorContext::new();
        ctx.insert("code", self.code().to_string());
        match self {
            AttnError::EvidenceUnavailable { reason }
            | AttnError::MalformedEvidence { reason }
            | AttnError::SignatureInvalid { reason } => {
                ctx.insert("reason", reason.clone());
            }
            AttnError::ChainBroken {
                index,
                subject,
                reason,
            }
            | AttnError::RevocationCheckFailed {
                index,
                subject,
                reason,
            } => {
                ctx.insert("index", index.to_string());
                ctx.insert("subject", subject.clone());
                ctx.insert("reason", reason.clone());
            }
            AttnError::CertificateExpired {
                index,
                subject,
                not_before,
                not_after,
                at,
            } => {
                ctx.insert("index", index.to_string());
                ctx.insert("subject", subject.clone());
                ctx.insert("not_before", not_before.to_string());
                ctx.insert("not_after", not_after.to_string());
                ctx.insert("at", at.to_string());
            }
            AttnError::UntrustedRoot {
                index,
                subject,
                fingerprint,
            } => {
                ctx.insert("index", index.to_string());
                ctx.insert("subject", subject.clone());
                ctx.insert("fingerprint", fingerprint.clone());
            }
            AttnError::PolicyViolation {
                check,
                expected,
                actual,
            } => {
                ctx.insert("check", check.code().to_string());
                if let Some(expected) = expected {
                    ctx.insert("expected", expected.clone());
                }
                if let Some(actual) = actual {
                    ctx.insert("actual", actual.clone());
                }
            }
            AttnError::BindingMismatch => {}
        }
        ctx
    }
}
