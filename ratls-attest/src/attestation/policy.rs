use crate::attestation::config::Policy;
use crate::attestation::errors::{AttnError, PolicyCheck};
use crate::attestation::types::{claims, ClaimSet, EvidenceFormat, Nonce};
use crate::attestation::util::{constant_time_eq, unix_secs};
use std::time::SystemTime;
use tracing::{debug, warn};

/// `dbgstat` values reported by a TEE whose debug interfaces are closed.
const DEBUG_DISABLED: &[&str] = &["disabled-since-boot", "disabled"];

/// Applies an acceptance [`Policy`] to a verified claim set.
pub struct PolicyEngine;

impl PolicyEngine {
    /// Runs every check, logs each failure, and reports the first one in check order.
    pub fn evaluate(
        claims: &ClaimSet,
        policy: &Policy,
        expected_nonce: Option<&Nonce>,
        format: EvidenceFormat,
        at: SystemTime,
    ) -> Result<(), AttnError> {
        // i128 holds every u64 claim timestamp and the i64 clock without wrapping.
        let now = i128::from(unix_secs(at));
        let skew = i128::from(policy.clock_skew_tolerance.as_secs());
        let max_age = i128::from(policy.max_evidence_age.as_secs());
        let issued_at = i128::from(claims.issued_at());
        let expiry = i128::from(claims.expiry());

        let outcomes = [
            check_simulation(claims, policy, format),
            check_issuer(claims, policy),
            check_image_digest(claims, policy),
            check(now - issued_at <= max_age, || {
                AttnError::violation_with(
                    PolicyCheck::MaxAge,
                    format!("<= {max_age}s"),
                    format!("{}s", now - issued_at),
                )
            }),
            check(issued_at <= now + skew, || {
                AttnError::violation_with(
                    PolicyCheck::IssuedInFuture,
                    format!("iat <= {}", now + skew),
                    issued_at.to_string(),
                )
            }),
            check(expiry > now, || {
                AttnError::violation_with(
                    PolicyCheck::Expiry,
                    format!("exp > {now}"),
                    expiry.to_string(),
                )
            }),
            check_nonce(claims, expected_nonce),
            check_secure_boot(claims, policy),
            check_debug(claims, policy),
        ];

        let mut first = None;
        for outcome in outcomes {
            if let Err(err) = outcome {
                warn!(context = ?err.context(), "policy check failed");
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => {
                debug!(issuer = claims.issuer(), %format, "claims satisfy policy");
                Ok(())
            }
        }
    }
}

fn check(ok: bool, err: impl FnOnce() -> AttnError) -> Result<(), AttnError> {
    if ok {
        Ok(())
    } else {
        Err(err())
    }
}

fn check_simulation(
    claims: &ClaimSet,
    policy: &Policy,
    format: EvidenceFormat,
) -> Result<(), AttnError> {
    let simulated = format == EvidenceFormat::Simulated
        || claims.hardware_model() == Some(claims::SIMULATED_HARDWARE);
    check(!simulated || policy.simulate_allowed, || {
        AttnError::violation(PolicyCheck::Simulation)
    })
}

fn check_issuer(claims: &ClaimSet, policy: &Policy) -> Result<(), AttnError> {
    match &policy.expected_issuer {
        Some(expected) if expected != claims.issuer() => Err(AttnError::violation_with(
            PolicyCheck::Issuer,
            expected.clone(),
            claims.issuer(),
        )),
        _ => Ok(()),
    }
}

fn check_image_digest(claims: &ClaimSet, policy: &Policy) -> Result<(), AttnError> {
    check(
        policy.allowed_image_digests.contains(claims.image_digest()),
        || {
            AttnError::violation_with(
                PolicyCheck::ImageDigest,
                format!("one of {} allowed digests", policy.allowed_image_digests.len()),
                hex::encode(claims.image_digest()),
            )
        },
    )
}

fn check_nonce(claims: &ClaimSet, expected: Option<&Nonce>) -> Result<(), AttnError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    // Nonce values are not echoed into the error context.
    check(constant_time_eq(expected.as_bytes(), claims.nonce()), || {
        AttnError::violation(PolicyCheck::Nonce)
    })
}

fn check_secure_boot(claims: &ClaimSet, policy: &Policy) -> Result<(), AttnError> {
    if !policy.require_secure_boot {
        return Ok(());
    }
    check(claims.secure_boot() == Some(true), || {
        AttnError::violation_with(
            PolicyCheck::SecureBoot,
            "true",
            claims
                .secure_boot()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "absent".into()),
        )
    })
}

fn check_debug(claims: &ClaimSet, policy: &Policy) -> Result<(), AttnError> {
    if policy.allow_debug {
        return Ok(());
    }
    match claims.debug_status() {
        Some(status) if DEBUG_DISABLED.contains(&status) => Ok(()),
        other => Err(AttnError::violation_with(
            PolicyCheck::DebugMode,
            DEBUG_DISABLED.join("|"),
            other.unwrap_or("absent"),
        )),
    }
}
