//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controllers are watching, and `/metrics` serves the Prometheus registry.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

use crate::crd::DatabasePhase;

const METRIC_PREFIX: &str = "elasticsearch_operator";
const OPENMETRICS_TEXT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ObjectLabels {
    pub namespace: String,
    pub name: String,
}

impl ObjectLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

pub struct Metrics {
    pub reconciliations: Family<ObjectLabels, Counter>,
    pub reconcile_errors: Family<ObjectLabels, Counter>,
    pub reconcile_duration: Family<ObjectLabels, Histogram>,
    /// Elasticsearch objects per phase, refreshed periodically
    pub databases: Family<PhaseLabels, Gauge>,
    pub backup_schedules: Gauge,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        let reconciliations = register(
            &mut registry,
            "reconciliations",
            "Reconciliations handled",
            Family::<ObjectLabels, Counter>::default(),
        );
        let reconcile_errors = register(
            &mut registry,
            "reconciliation_errors",
            "Reconciliations that returned an error",
            Family::<ObjectLabels, Counter>::default(),
        );
        let reconcile_duration = register(
            &mut registry,
            "reconcile_duration_seconds",
            "Time spent in one reconciliation",
            Family::<ObjectLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            }),
        );
        let databases = register(
            &mut registry,
            "databases",
            "Elasticsearch objects by phase",
            Family::<PhaseLabels, Gauge>::default(),
        );
        let backup_schedules = register(
            &mut registry,
            "backup_schedules",
            "Registered backup schedules",
            Gauge::default(),
        );

        Self {
            reconciliations,
            reconcile_errors,
            reconcile_duration,
            databases,
            backup_schedules,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ObjectLabels::new(namespace, name);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconcile_errors
            .get_or_create(&ObjectLabels::new(namespace, name))
            .inc();
    }

    /// Overwrite the phase gauges; phases missing from `counts` drop to zero
    pub fn set_databases_by_phase(&self, counts: &BTreeMap<DatabasePhase, i64>) {
        for phase in DatabasePhase::ALL {
            let labels = PhaseLabels {
                phase: phase.to_string(),
            };
            let count = counts.get(&phase).copied().unwrap_or_default();
            self.databases.get_or_create(&labels).set(count);
        }
    }

    pub fn set_backup_schedules(&self, count: i64) {
        self.backup_schedules.set(count);
    }

    fn render(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

fn register<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M {
    registry.register(name, help, metric.clone());
    metric
}

/// State shared between the controllers and the HTTP server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> axum::response::Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_TEXT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve probes and metrics on `0.0.0.0:<port>` until the listener fails
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "health server listening");
    axum::serve(listener, router(state)).await
}
