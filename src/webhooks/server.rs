//! HTTPS endpoint called by the API server with admission reviews

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use thiserror::Error;
use tracing::{error, info};

use super::policies::admit;
use crate::crd::Elasticsearch;
use crate::resources::client::KubeClient;

/// Path registered in the ValidatingWebhookConfiguration
pub const VALIDATE_PATH: &str = "/validate-elasticsearch";

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[source] std::io::Error),

    #[error("Webhook server error: {0}")]
    Server(#[source] std::io::Error),
}

struct WebhookState {
    client: Arc<dyn KubeClient>,
}

pub fn router(client: Arc<dyn KubeClient>) -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate_elasticsearch))
        .with_state(Arc::new(WebhookState { client }))
}

async fn validate_elasticsearch(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Elasticsearch>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<Elasticsearch> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "admission review without a usable request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    info!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "processing admission request"
    );
    Json(admit(state.client.as_ref(), &request).await.into_review())
}

/// Serve admission reviews over TLS on `0.0.0.0:<port>`
///
/// Runs on every replica regardless of leadership, since the API server may
/// call any of them.
pub async fn run_webhook_server(
    client: Arc<dyn KubeClient>,
    port: u16,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), WebhookError> {
    let tls = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(WebhookError::TlsConfig)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "webhook server listening with TLS");
    axum_server::bind_rustls(addr, tls)
        .serve(router(client).into_make_service())
        .await
        .map_err(WebhookError::Server)
}
