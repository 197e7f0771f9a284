use crate::state::{AttestationResponse, PublicState, ServedCertificate};
use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose;
use base64::Engine as _;
use ratls_attest::attestation::{ErrorKind, Nonce};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, warn};

/// Liveness probe endpoint.
pub async fn ready() -> &'static str {
    "ready"
}

#[derive(Serialize)]
/// Static response body for `/health`.
pub struct Health {
    pub status: &'static str,
}

/// Health-check endpoint.
pub async fn health() -> (StatusCode, Json<Health>) {
    (StatusCode::OK, Json(Health { status: "ok" }))
}

/// Evidence embedded in the certificate this connection was served with.
pub async fn current_attestation(
    Extension(served): Extension<Arc<ServedCertificate>>,
) -> Json<AttestationResponse> {
    Json(AttestationResponse::from_served(&served))
}

#[derive(Deserialize)]
/// Incoming JSON body for `POST /attestation`.
pub struct AttestationRequest {
    /// Verifier-provided nonce (base64). Must be fresh/single-use on verifier side.
    pub nonce_b64: String,
}

fn error_body(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

/// Challenge-response: fresh evidence whose nonce is the verifier's, returned as a wire bundle.
pub async fn attestation_handler(
    State(state): State<PublicState>,
    Json(req): Json<AttestationRequest>,
) -> Response {
    let raw = match general_purpose::STANDARD.decode(req.nonce_b64.as_bytes()) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = ?e, "bad nonce base64");
            return error_body(StatusCode::BAD_REQUEST, "invalid_nonce_base64");
        }
    };
    let nonce = match Nonce::new(raw) {
        Ok(nonce) => nonce,
        Err(e) => {
            warn!(error = %e, "invalid nonce length");
            return error_body(StatusCode::BAD_REQUEST, "invalid_nonce_length");
        }
    };

    match state.service.issue_for_nonce(&nonce).await {
        Ok(evidence) => {
            debug!(format = %evidence.format(), len = evidence.document().len(), "challenge evidence issued");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                evidence.to_bundle(),
            )
                .into_response()
        }
        Err(e) => {
            warn!(code = e.code(), error = %e, "challenge evidence failed");
            let status = if e.kind() == ErrorKind::EvidenceUnavailable {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_body(status, e.code())
        }
    }
}

/// Blocks until Ctrl+C (or SIGTERM on Unix) to trigger graceful shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, };
}
