use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use ratls_attest::attestation::{
    AttestationService, ErrorContext, ErrorKind, Nonce, PolicyConfig, VerificationResult,
};
use ratls_attest::ratls::client::{BoundChannel, ChannelError, RaTlsConnector};
use std::{env, sync::Arc, time::SystemTime};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, anyhow::Error>;

const DEFAULT_TARGET: &str = "127.0.0.1:8443";

/// CLI entrypoint: connects over RA-TLS, then runs a nonce challenge on the attested channel.
#[tokio::main]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init()
        .ok();

    let policy_cfg = PolicyConfig::from_env()?;
    policy_cfg.info();
    let policy = Arc::new(policy_cfg.into_policy()?);
    let service = AttestationService::verifier(policy);

    let target = resolve_target();
    let server_name = env::var("RATLS_SERVER_NAME").unwrap_or_else(|_| host_of(&target));

    let tcp = TcpStream::connect(&target)
        .await
        .with_context(|| format!("connect {target}"))?;
    let channel = match RaTlsConnector::new(service.clone())
        .connect(tcp, &server_name)
        .await
    {
        Ok(channel) => channel,
        Err(ChannelError::Rejected { kind, context }) => {
            return Err(anyhow!(format_rejection(kind, &context)))
        }
        Err(err) => return Err(err.into()),
    };

    println!("✅ RA-TLS channel established with {target}:");
    println!("  issuer         : {}", channel.claims().issuer());
    println!("  image digest   : {}", hex::encode(channel.claims().image_digest()));
    println!("  issued at      : {}", channel.claims().issued_at());
    println!("  expires        : {}", channel.claims().expiry());
    println!("  session binding: {}", channel.binding());

    challenge(channel, &service).await
}

/// Target from the first argument, `RATLS_TARGET`, or the local default.
fn resolve_target() -> String {
    env::args()
        .nth(1)
        .or_else(|| env::var("RATLS_TARGET").ok())
        .unwrap_or_else(|| DEFAULT_TARGET.to_string())
}

fn host_of(target: &str) -> String {
    target
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(target)
        .trim_matches(|c| c == '[' || c == ']')
        .to_string()
}

/// Posts a fresh nonce to `/attestation` over the attested channel and verifies the reply.
async fn challenge(channel: BoundChannel<TcpStream>, service: &AttestationService) -> CliResult<()> {
    let (stream, _, _) = channel.into_parts();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("http1 handshake")?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(error = %err, "connection closed");
        }
    });

    let nonce = Nonce::random();
    let body = serde_json::to_vec(&serde_json::json!({ "nonce_b64": b64.encode(nonce.as_bytes()) }))?;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/attestation")
        .header(HOST, "ratls")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;
    let response = sender.send_request(request).await.context("POST /attestation")?;
    let status = response.status();
    let bundle = response.into_body().collect().await?.to_bytes();
    if status != StatusCode::OK {
        return Err(anyhow!(
            "/attestation returned {status}: {}",
            String::from_utf8_lossy(&bundle)
        ));
    }

    match service.verify_with_nonce(&bundle, &nonce, SystemTime::now()) {
        VerificationResult::Accepted { claims, .. } => {
            println!("✅ Challenge verified:");
            println!("  nonce          : {}", hex::encode(claims.nonce()));
            if let Some(model) = claims.hardware_model() {
                println!("  hardware model : {model}");
            }
            Ok(())
        }
        VerificationResult::Rejected { kind, context } => Err(anyhow!(format_rejection(kind, &context))),
    }
}

/// Human-friendly rendering of a rejection for CLI output.
fn format_rejection(kind: ErrorKind, context: &ErrorContext) -> String {
    let field = |name: &str| context.get(name).cloned().unwrap_or_default();
    match kind {
        ErrorKind::EvidenceUnavailable => format!("evidence unavailable: {}", field("reason")),
        ErrorKind::MalformedEvidence => format!("malformed evidence: {}", field("reason")),
        ErrorKind::SignatureInvalid => format!("evidence signature invalid: {}", field("reason")),
        ErrorKind::ChainBroken => format!(
            "certificate chain broken at {} ({}): {}",
            field("index"),
            field("subject"),
            field("reason")
        ),
        ErrorKind::CertificateExpired => format!(
            "certificate {} ({}) outside its validity window",
            field("index"),
            field("subject")
        ),
        ErrorKind::UntrustedRoot => format!(
            "attestation root not trusted: {} ({})",
            field("fingerprint"),
            field("subject")
        ),
        ErrorKind::RevocationCheckFailed => format!(
            "certificate {} revoked: {}",
            field("index"),
            field("reason")
        ),
        ErrorKind::PolicyViolation => format!("policy check failed: {}", field("check")),
        ErrorKind::BindingMismatch => "evidence is not bound to this TLS session".into(),
    }
}
