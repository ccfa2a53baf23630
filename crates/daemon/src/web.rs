//! Webhook and status endpoints.
//!
//! - `POST /webhook` -- trigger an immediate pass. The request body is
//!   authenticated with an HMAC-SHA256 signature in `X-Signature-256`
//!   (`sha256=<hex>`), verified against the configured secret. With no
//!   secret configured the endpoint is disabled.
//! - `GET /status` -- the last pass summary as JSON.
//! - `GET /healthz` -- liveness.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use imagesync_core::orchestrator::PassSummary;

type HmacSha256 = Hmac<Sha256>;

/// Shared state for the web handlers.
pub struct WebState {
    /// Channel for triggering immediate passes.
    pub trigger: mpsc::Sender<()>,
    /// The most recent pass summary.
    pub last_summary: Arc<RwLock<Option<PassSummary>>>,
    /// Webhook HMAC secret; `None` disables the webhook.
    pub webhook_secret: Option<String>,
}

/// Build the router.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/status", get(status))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process shuts down.
pub async fn serve(listen: &str, state: Arc<WebState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "web server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn status(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    match state.last_summary.read().await.as_ref() {
        Some(summary) => Json(serde_json::to_value(summary).unwrap_or_default()).into_response(),
        None => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "no pass completed yet" })),
        )
            .into_response(),
    }
}

async fn webhook(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return (StatusCode::NOT_FOUND, "webhook disabled");
    };

    let signature = headers
        .get("x-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&body, signature, secret) {
        warn!("webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "invalid signature");
    }

    info!("pass triggered by webhook");
    match state.trigger.try_send(()) {
        Ok(()) => (StatusCode::ACCEPTED, "pass triggered"),
        Err(_) => (StatusCode::ACCEPTED, "pass already queued"),
    }
}

/// Verify an HMAC-SHA256 webhook signature of the form `sha256=<hex>`.
fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        warn!("webhook signature missing sha256= prefix");
        return false;
    };
    let Ok(expected_bytes) = hex::decode(hex_sig) else {
        warn!("webhook signature is not valid hex");
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        warn!("failed to create HMAC");
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_signature_valid() {
        let secret = "my-secret";
        let payload = b"trigger";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature(payload, &signature, secret));
    }

    #[test]
    fn test_verify_signature_invalid() {
        assert!(!verify_signature(
            b"payload",
            "sha256=0000000000000000000000000000000000000000000000000000000000000000",
            "secret"
        ));
        assert!(!verify_signature(b"payload", "md5=abcd", "secret"));
        assert!(!verify_signature(b"payload", "sha256=nothex", "secret"));
    }
}
