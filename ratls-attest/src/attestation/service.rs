use crate::attestation::binding::{BindingDigest, ChannelBinder, SessionMaterial};
use crate::attestation::certs::ChainValidator;
use crate::attestation::config::Policy;
use crate::attestation::cose::{self, DecodedEvidence};
use crate::attestation::errors::AttnError;
use crate::attestation::policy::PolicyEngine;
use crate::attestation::source::EvidenceSource;
use crate::attestation::types::{ClaimSet, Evidence, Nonce, VerificationResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Bounded exponential backoff for unavailable evidence providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Progress of a single verification attempt. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    EvidenceRequested,
    Decoded,
    ChainValidated,
    PolicyEvaluated,
    Bound,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::EvidenceRequested => "evidence_requested",
            Stage::Decoded => "decoded",
            Stage::ChainValidated => "chain_validated",
            Stage::PolicyEvaluated => "policy_evaluated",
            Stage::Bound => "bound",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the verified claims are tied to the caller.
enum Freshness<'a> {
    Session(&'a SessionMaterial),
    Challenge(&'a Nonce),
}

/// Per-attempt state. Owned by the attempt and dropped with it.
struct Attempt {
    stage: Stage,
}

impl Attempt {
    fn new() -> Self {
        Self { stage: Stage::Init }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage);
        debug!(from = %self.stage, to = %next, "attestation stage");
        self.stage = next;
    }
}

/// Entry point for both attestation roles.
///
/// The server role calls [`AttestationService::issue`]; the verifier role calls
/// [`AttestationService::verify`]. Attempts share nothing but the read-only
/// policy.
#[derive(Clone)]
pub struct AttestationService {
    source: Option<Arc<dyn EvidenceSource>>,
    policy: Arc<Policy>,
    retry: RetryPolicy,
}

impl AttestationService {
    /// A service able to both issue and verify evidence.
    pub fn new(source: Arc<dyn EvidenceSource>, policy: Arc<Policy>) -> Self {
        Self {
            source: Some(source),
            policy,
            retry: RetryPolicy::default(),
        }
    }

    /// A verify-only service; `issue` fails with `EvidenceUnavailable`.
    pub fn verifier(policy: Arc<Policy>) -> Self {
        Self {
            source: None,
            policy,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Server role: evidence bound to `material`, retrying an unavailable provider.
    pub async fn issue(&self, material: &SessionMaterial) -> Result<Evidence, AttnError> {
        let binder = ChannelBinder::new(self.source()?);
        self.obtain_with_retry(|| binder.bind(material)).await
    }

    /// Evidence for a caller-chosen challenge nonce, without a transport binding.
    pub async fn issue_for_nonce(&self, nonce: &Nonce) -> Result<Evidence, AttnError> {
        let source = self.source()?;
        self.obtain_with_retry(|| source.obtain(nonce)).await
    }

    fn source(&self) -> Result<&dyn EvidenceSource, AttnError> {
        self.source
            .as_deref()
            .ok_or_else(|| AttnError::unavailable("no evidence source configured"))
    }

    async fn obtain_with_retry<F, Fut>(&self, mut obtain: F) -> Result<Evidence, AttnError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Evidence, AttnError>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match obtain().await {
                Ok(evidence) => {
                    info!(format = %evidence.format(), attempt, "issued evidence");
                    return Ok(evidence);
                }
                Err(err) if err.kind().is_retryable() && attempt < attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "evidence unavailable; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(error = %err, attempt, "failed to obtain evidence");
                    return Err(err);
                }
            }
        }
    }

    /// Verifier role: accepts `bundle` only if it is genuine, satisfies the
    /// policy and is bound to `material`.
    pub fn verify(
        &self,
        bundle: &[u8],
        material: &SessionMaterial,
        now: SystemTime,
    ) -> VerificationResult {
        self.run(bundle, Freshness::Session(material), now)
    }

    /// Challenge-response verification without a transport binding; the
    /// nonce is enforced by the policy engine.
    pub fn verify_with_nonce(
        &self,
        bundle: &[u8],
        nonce: &Nonce,
        now: SystemTime,
    ) -> VerificationResult {
        self.run(bundle, Freshness::Challenge(nonce), now)
    }

    fn run(&self, bundle: &[u8], freshness: Freshness<'_>, now: SystemTime) -> VerificationResult {
        let mut attempt = Attempt::new();
        match self.pipeline(&mut attempt, bundle, &freshness, now) {
            Ok((claims, binding_digest)) => {
                info!(issuer = claims.issuer(), "evidence accepted");
                VerificationResult::Accepted {
                    claims,
                    binding_digest,
                }
            }
            Err(err) => {
                let mut context = err.context();
                context.insert("stage", attempt.stage.to_string());
                warn!(code = err.code(), stage = %attempt.stage, error = %err, "evidence rejected");
                VerificationResult::Rejected {
                    kind: err.kind(),
                    context,
                }
            }
        }
    }

    fn pipeline(
        &self,
        attempt: &mut Attempt,
        bundle: &[u8],
        freshness: &Freshness<'_>,
        now: SystemTime,
    ) -> Result<(ClaimSet, Option<BindingDigest>), AttnError> {
        let evidence = Evidence::from_bundle(bundle)?;
        attempt.advance(Stage::EvidenceRequested);

        let DecodedEvidence { claims, chain } = cose::decode(&evidence)?;
        attempt.advance(Stage::Decoded);

        let summary = ChainValidator::from_policy(&self.policy).validate(&chain, now)?;
        debug!(root = %summary.root_subject, leaf = %summary.leaf_fingerprint, "chain validated");
        attempt.advance(Stage::ChainValidated);

        let expected_nonce = match freshness {
            Freshness::Challenge(nonce) => Some(*nonce),
            Freshness::Session(_) => None,
        };
        PolicyEngine::evaluate(&claims, &self.policy, expected_nonce, evidence.format(), now)?;
        attempt.advance(Stage::PolicyEvaluated);

        let binding = match freshness {
            Freshness::Session(material) => Some(ChannelBinder::verify_binding(material, &claims)?),
            Freshness::Challenge(_) => None,
        };
        attempt.advance(Stage::Bound);

        Ok((claims, binding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::errors::ErrorKind;
    use crate::attestation::sim::SimulatedIdentity;
    use crate::attestation::source::SimulatedSource;
    use crate::attestation::types::EvidenceFormat;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DIGEST: [u8; 32] = [0x5A; 32];

    fn simulated_service() -> AttestationService {
        let identity = SimulatedIdentity::generate().expect("identity");
        let policy = Policy::new(
            &identity.root_fingerprint(),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
        .allow_image_digest(DIGEST.to_vec())
        .with_simulation(true);
        AttestationService::new(
            Arc::new(SimulatedSource::new(identity, DIGEST.to_vec())),
            Arc::new(policy),
        )
    }

    #[tokio::test]
    async fn issue_then_verify_accepts_with_binding() {
        let service = simulated_service();
        let material = SessionMaterial::from_spki(b"ephemeral-spki");
        let evidence = service.issue(&material).await.expect("issue");

        match service.verify(&evidence.to_bundle(), &material, SystemTime::now()) {
            VerificationResult::Accepted {
                claims,
                binding_digest,
            } => {
                assert_eq!(binding_digest, Some(material.digest()));
                assert_eq!(claims.image_digest(), &DIGEST);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_session_is_binding_mismatch_at_policy_stage() {
        let service = simulated_service();
        let evidence = service
            .issue(&SessionMaterial::from_spki(b"session-a"))
            .await
            .expect("issue");
        let result = service.verify(
            &evidence.to_bundle(),
            &SessionMaterial::from_spki(b"session-b"),
            SystemTime::now(),
        );
        match result {
            VerificationResult::Rejected { kind, context } => {
                assert_eq!(kind, ErrorKind::BindingMismatch);
                assert_eq!(context["stage"], "policy_evaluated");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn challenge_nonce_is_enforced_by_policy() {
        let service = simulated_service();
        let nonce = Nonce::random();
        let evidence = service.issue_for_nonce(&nonce).await.expect("evidence");
        let bundle = evidence.to_bundle();

        let accepted = service.verify_with_nonce(&bundle, &nonce, SystemTime::now());
        assert!(accepted.is_accepted());

        let rejected = service.verify_with_nonce(&bundle, &Nonce::random(), SystemTime::now());
        match rejected {
            VerificationResult::Rejected { kind, context } => {
                assert_eq!(kind, ErrorKind::PolicyViolation);
                assert_eq!(context["check"], "nonce");
                assert_eq!(context["stage"], "chain_validated");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verification_is_deterministic_for_fixed_inputs() {
        let service = simulated_service();
        let material = SessionMaterial::from_spki(b"spki");
        let bundle = service.issue(&material).await.expect("issue").to_bundle();
        let now = SystemTime::now();
        assert_eq!(
            service.verify(&bundle, &material, now),
            service.verify(&bundle, &material, now)
        );
    }

    #[test]
    fn garbage_bundle_is_rejected_at_init() {
        let service = simulated_service();
        let result = service.verify(b"not json", &SessionMaterial::from_spki(b"x"), SystemTime::now());
        match result {
            VerificationResult::Rejected { kind, context } => {
                assert_eq!(kind, ErrorKind::MalformedEvidence);
                assert_eq!(context["stage"], "init");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
        inner: SimulatedSource,
    }

    #[async_trait]
    impl EvidenceSource for FlakySource {
        fn format(&self) -> EvidenceFormat {
            EvidenceFormat::Simulated
        }

        async fn obtain(&self, nonce: &Nonce) -> Result<Evidence, AttnError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AttnError::unavailable("provider down"));
            }
            self.inner.obtain(nonce).await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakySource> {
        Arc::new(FlakySource {
            failures,
            calls: AtomicU32::new(0),
            inner: SimulatedSource::new(SimulatedIdentity::generate().expect("identity"), DIGEST.to_vec()),
        })
    }

    #[tokio::test]
    async fn issue_retries_unavailable_provider_with_bound() {
        let policy = Arc::new(Policy::new("AA", Duration::from_secs(60), Duration::ZERO));
        let material = SessionMaterial::from_spki(b"spki");

        let recovering = flaky(2);
        let service = AttestationService::new(recovering.clone(), policy.clone());
        service.issue(&material).await.expect("third attempt succeeds");
        assert_eq!(recovering.calls.load(Ordering::SeqCst), 3);

        let down = flaky(10);
        let service = AttestationService::new(down.clone(), policy.clone());
        let err = service.issue(&material).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceUnavailable);
        assert_eq!(down.calls.load(Ordering::SeqCst), 3);

        let once = flaky(10);
        let service = AttestationService::new(once.clone(), policy).with_retry(RetryPolicy::none());
        assert!(service.issue(&material).await.is_err());
        assert_eq!(once.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verifier_only_service_cannot_issue() {
        let policy = Arc::new(Policy::new("AA", Duration::from_secs(60), Duration::ZERO));
        let err = AttestationService::verifier(policy)
            .issue(&SessionMaterial::from_spki(b"spki"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceUnavailable);
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
    }
}
