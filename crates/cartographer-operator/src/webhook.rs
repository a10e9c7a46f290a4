//! Admission webhook HTTP server

use crate::admission;
use crate::crd::Workspace;
use crate::defaults::Defaulter;
use anyhow::Context as _;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use cartographer_common::{TlsConfig, WebhookSettings};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const MUTATE_PATH: &str = "/mutate-mlops-aigency-com-v1alpha1-workspace";
pub const VALIDATE_PATH: &str = "/validate-mlops-aigency-com-v1alpha1-workspace";

/// Shared state for webhook handlers
pub struct WebhookState {
    pub defaulter: Defaulter,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate))
        .route(VALIDATE_PATH, post(validate))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn into_request(review: AdmissionReview<Workspace>) -> Result<AdmissionRequest<Workspace>, AdmissionResponse> {
    let request: Result<AdmissionRequest<Workspace>, _> = review.try_into();
    request.map_err(|e| {
        warn!(error = %e, "malformed admission review");
        AdmissionResponse::invalid(e.to_string())
    })
}

async fn mutate(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Workspace>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(req) => admission::mutate(&req, &state.defaulter),
        Err(response) => response,
    };
    Json(response.into_review())
}

async fn validate(Json(review): Json<AdmissionReview<Workspace>>) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(req) => admission::validate_request(&req),
        Err(response) => response,
    };
    Json(response.into_review())
}

/// Serve the webhook until the listener fails. Uses TLS when a certificate
/// and key are configured.
pub async fn serve(settings: &WebhookSettings, state: Arc<WebhookState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind webhook server on {}", settings.bind_addr))?;

    let Some((cert, key)) = settings.tls_paths() else {
        info!(addr = %settings.bind_addr, "webhook server listening (plain HTTP)");
        axum::serve(listener, app).await.context("webhook server failed")?;
        return Ok(());
    };

    let acceptor = TlsConfig::from_pem_files(cert, key)
        .context("failed to load webhook TLS material")?
        .acceptor();
    info!(addr = %settings.bind_addr, "webhook server listening (TLS)");

    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept failed")?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%peer_addr, error = %e, "connection error");
            }
        });
    }
}
