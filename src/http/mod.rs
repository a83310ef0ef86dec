//! C12: `HTTPFront` — routes (exactly) the three ETSI014 endpoints plus
//! liveness/readiness, unifying mTLS and trusted-proxy client
//! authentication behind one `VerifiedCertificate` shape.

pub mod dto;
pub mod health;
pub mod tls;

use crate::audit_log::RequestAuditLog;
use crate::authz::AuthorizationPolicy;
use crate::cert_resolver::{decode_trusted_proxy_header, CertificateResolver};
use crate::config::KmeConfig;
use crate::error::KmeError;
use crate::extensions::ExtensionEngine;
use crate::key_pool::KeyPool;
use crate::pairing_ledger::PairingLedger;
use crate::sae_registry::SaeRegistry;
use crate::services::key_request::KeyRequestService;
use crate::services::key_retrieval::KeyRetrievalService;
use crate::services::status::StatusService;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: Arc<KmeConfig>,
    pub cert_resolver: Arc<CertificateResolver>,
    pub key_pool: Arc<KeyPool>,
    pub status_service: Arc<StatusService>,
    pub key_request_service: Arc<KeyRequestService>,
    pub key_retrieval_service: Arc<KeyRetrievalService>,
    #[allow(dead_code)]
    pub authz: Arc<AuthorizationPolicy>,
    #[allow(dead_code)]
    pub extensions: Arc<ExtensionEngine>,
    #[allow(dead_code)]
    pub pairing_ledger: Arc<PairingLedger>,
    #[allow(dead_code)]
    pub sae_registry: Arc<dyn SaeRegistry>,
    #[allow(dead_code)]
    pub audit_log: Arc<RequestAuditLog>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/keys/{slave_sae_id}/status", get(status_handler))
        .route("/api/v1/keys/{slave_sae_id}/enc_keys", post(enc_keys_handler))
        .route("/api/v1/keys/{master_sae_id}/dec_keys", post(dec_keys_handler))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trusted_proxy_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// When trusted-proxy mode is configured, verifies the direct TCP peer is
/// the configured proxy and swaps the TLS-layer `PeerCertExtension` for one
/// decoded from the forwarded-cert header.
async fn trusted_proxy_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let Some(proxy_cfg) = &state.config.trusted_proxy else {
        return next.run(req).await;
    };

    if addr.ip().to_string() != proxy_cfg.proxy_addr {
        return KmeError::AuthenticationError(
            "direct peer is not the configured trusted proxy".into(),
        )
        .into_response();
    }

    let header_value = req
        .headers()
        .get(&proxy_cfg.header)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let Some(raw) = header_value else {
        return KmeError::AuthenticationError(
            "trusted-proxy mode requires the forwarded-certificate header".into(),
        )
        .into_response();
    };

    match decode_trusted_proxy_header(&raw, &proxy_cfg.proxy_addr) {
        Ok(verified) => {
            req.extensions_mut().insert(tls::PeerCertExtension(Some(verified)));
        }
        Err(e) => return e.into_response(),
    }

    next.run(req).await
}

fn resolve_sae_id(
    state: &AppState,
    req_extensions: &axum::http::Extensions,
) -> Result<String, KmeError> {
    let cert = req_extensions
        .get::<tls::PeerCertExtension>()
        .and_then(|ext| ext.0.clone())
        .ok_or_else(|| KmeError::AuthenticationError("no client certificate presented".into()))?;
    state.cert_resolver.resolve(&cert)
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(slave_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> axum::response::Response {
    let requesting_sae_id = match resolve_sae_id(&state, req.extensions()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state
        .status_service
        .get_status(&requesting_sae_id, &slave_sae_id)
        .await
    {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn enc_keys_handler(
    State(state): State<Arc<AppState>>,
    Path(slave_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> axum::response::Response {
    let requesting_sae_id = match resolve_sae_id(&state, req.extensions()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let (_, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return KmeError::InvalidArgument(e.to_string()).into_response(),
    };
    let payload: dto::KeyRequestBody = if bytes.is_empty() {
        dto::KeyRequestBody::default()
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => return KmeError::InvalidArgument(format!("malformed body: {e}")).into_response(),
        }
    };

    match state
        .key_request_service
        .request_keys(&requesting_sae_id, &slave_sae_id, payload)
        .await
    {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn dec_keys_handler(
    State(state): State<Arc<AppState>>,
    Path(master_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> axum::response::Response {
    let requesting_sae_id = match resolve_sae_id(&state, req.extensions()) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let (_, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return KmeError::InvalidArgument(e.to_string()).into_response(),
    };
    let payload: dto::KeyRetrievalBody = match serde_json::from_slice(&bytes) {
        Ok(p) => p,
        Err(e) => return KmeError::InvalidArgument(format!("malformed body: {e}")).into_response(),
    };

    match state
        .key_retrieval_service
        .retrieve_keys(&requesting_sae_id, &master_sae_id, payload)
        .await
    {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}
