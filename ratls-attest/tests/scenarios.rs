use ratls_attest::attestation::sim::{IdentityWindows, SimulatedIdentity};
use ratls_attest::attestation::{
    AttestationService, ErrorKind, EvidenceSource, Nonce, Policy, SessionMaterial,
    SimulatedSource, VerificationResult,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const IMAGE: [u8; 32] = [0x11; 32];
const DAY: Duration = Duration::from_secs(86_400);

fn policy_for(identity: &SimulatedIdentity) -> Policy {
    Policy::new(
        &identity.root_fingerprint(),
        Duration::from_secs(300),
        Duration::from_secs(30),
    )
    .allow_image_digest(IMAGE.to_vec())
    .with_simulation(true)
}

fn rejection(result: VerificationResult) -> (ErrorKind, ratls_attest::attestation::ErrorContext) {
    match result {
        VerificationResult::Rejected { kind, context } => (kind, context),
        other => panic!("expected rejection, got {other:?}"),
    }
}

async fn bundle_for(source: &SimulatedSource, material: &SessionMaterial) -> Vec<u8> {
    let nonce = Nonce::new(material.digest().as_bytes().to_vec()).expect("nonce");
    source.obtain(&nonce).await.expect("evidence").to_bundle()
}

#[tokio::test]
async fn accepts_fresh_bound_evidence() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let policy = Arc::new(policy_for(&identity));
    let service = AttestationService::new(
        Arc::new(SimulatedSource::new(identity, IMAGE.to_vec())),
        policy,
    );
    let material = SessionMaterial::from_spki(b"ephemeral key A");
    let evidence = service.issue(&material).await.expect("issue");

    let result = service.verify(&evidence.to_bundle(), &material, SystemTime::now());
    match result {
        VerificationResult::Accepted {
            claims,
            binding_digest,
        } => {
            assert_eq!(claims.image_digest(), &IMAGE);
            assert_eq!(binding_digest, Some(material.digest()));
        }
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn evidence_replayed_on_another_session_is_binding_mismatch() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&identity)));
    let source = SimulatedSource::new(identity, IMAGE.to_vec());

    let bundle = bundle_for(&source, &SessionMaterial::from_spki(b"session A")).await;
    let (kind, _) = rejection(service.verify(
        &bundle,
        &SessionMaterial::from_spki(b"session B"),
        SystemTime::now(),
    ));
    assert_eq!(kind, ErrorKind::BindingMismatch);
    assert!(kind.is_fatal());
    assert!(!kind.is_retryable());
}

#[tokio::test]
async fn expired_intermediate_is_reported_at_index_one() {
    let now = SystemTime::now();
    let identity = SimulatedIdentity::generate_with(IdentityWindows {
        intermediate: (now - 30 * DAY, now - DAY),
        ..IdentityWindows::around(now)
    })
    .expect("identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&identity)));
    let source = SimulatedSource::new(identity, IMAGE.to_vec());

    let material = SessionMaterial::from_spki(b"spki");
    let bundle = bundle_for(&source, &material).await;
    let (kind, context) = rejection(service.verify(&bundle, &material, now));
    assert_eq!(kind, ErrorKind::CertificateExpired);
    assert_eq!(context["index"], "1");
    assert!(context["subject"].contains("Simulated Intermediate"));
}

#[tokio::test]
async fn chain_to_unpinned_root_is_untrusted() {
    let genuine = SimulatedIdentity::generate().expect("identity");
    let rogue = SimulatedIdentity::generate().expect("rogue identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&genuine)));
    let source = SimulatedSource::new(rogue, IMAGE.to_vec());

    let material = SessionMaterial::from_spki(b"spki");
    let bundle = bundle_for(&source, &material).await;
    let (kind, context) = rejection(service.verify(&bundle, &material, SystemTime::now()));
    assert_eq!(kind, ErrorKind::UntrustedRoot);
    assert_eq!(context["index"], "2");
}

#[tokio::test]
async fn verification_is_idempotent() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&identity)));
    let source = SimulatedSource::new(identity, IMAGE.to_vec());

    let material = SessionMaterial::from_spki(b"spki");
    let bundle = bundle_for(&source, &material).await;
    let now = SystemTime::now();
    let first = service.verify(&bundle, &material, now);
    assert!(first.is_accepted());
    assert_eq!(first, service.verify(&bundle, &material, now));
}

#[tokio::test]
async fn simulated_evidence_needs_the_simulation_toggle() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let strict = policy_for(&identity).with_simulation(false);
    let service = AttestationService::verifier(Arc::new(strict));
    let source = SimulatedSource::new(identity, IMAGE.to_vec());

    let material = SessionMaterial::from_spki(b"spki");
    let bundle = bundle_for(&source, &material).await;
    let (kind, context) = rejection(service.verify(&bundle, &material, SystemTime::now()));
    assert_eq!(kind, ErrorKind::PolicyViolation);
    assert_eq!(context["check"], "simulation_not_allowed");
}

#[tokio::test]
async fn expired_evidence_is_rejected_even_for_an_allowed_image() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&identity)));
    let issued = SystemTime::now() - Duration::from_secs(120);
    let source = SimulatedSource::new(identity, IMAGE.to_vec())
        .with_fixed_clock(issued)
        .with_lifetime(Duration::from_secs(60));

    let material = SessionMaterial::from_spki(b"spki");
    let bundle = bundle_for(&source, &material).await;
    let (kind, context) = rejection(service.verify(&bundle, &material, SystemTime::now()));
    assert_eq!(kind, ErrorKind::PolicyViolation);
    assert_eq!(context["check"], "expiry");
}

#[test]
fn truncated_bundle_is_malformed() {
    let identity = SimulatedIdentity::generate().expect("identity");
    let service = AttestationService::verifier(Arc::new(policy_for(&identity)));
    let (kind, context) = rejection(service.verify(
        br#"{"format":"hardware","document_b64":"oA=="}"#,
        &SessionMaterial::from_spki(b"spki"),
        SystemTime::now(),
    ));
    assert_eq!(kind, ErrorKind::MalformedEvidence);
    assert_eq!(context["stage"], "evidence_requested");
}
