pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use controller::{
    BackoffConfig, Context, DORMANT_FINALIZER, Error, FINALIZER, OperatorConfig, Result,
    dormant_error_policy, error_policy, reconcile, reconcile_dormant,
};
pub use crd::{DormantDatabase, Elasticsearch, ElasticsearchVersion, Snapshot};
pub use health::{HealthState, Metrics};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::ListParams;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::controller::KubeEventPublisher;
use crate::crd::DatabasePhase;
use crate::resources::{KIND, KubeClientImpl, LABEL_KIND, LABEL_NAME};

/// Controller name reported on Kubernetes events
pub const CONTROLLER_NAME: &str = "elasticsearch-operator";

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Map a managed object back to its Elasticsearch by the kind and name labels
fn owner_ref<K: Resource>(obj: &K) -> Option<ObjectRef<Elasticsearch>> {
    let labels = obj.meta().labels.as_ref()?;
    if labels.get(LABEL_KIND).map(String::as_str) != Some(KIND) {
        return None;
    }
    let name = labels.get(LABEL_NAME)?;
    let ns = obj.meta().namespace.as_deref()?;
    Some(ObjectRef::new(name).within(ns))
}

/// Build the context shared by both controllers
pub fn build_context(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    cancel: CancellationToken,
) -> Arc<Context> {
    let ctx = Context::new(
        Arc::new(KubeClientImpl::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
        config,
    )
    .with_cancellation(cancel);
    Arc::new(match health_state {
        Some(state) => ctx.with_health(state),
        None => ctx,
    })
}

/// Run the Elasticsearch controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller_scoped(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for Elasticsearch resources (scope: {})",
        scope_msg
    );

    if let Some(state) = ctx.health.as_ref() {
        state.set_ready(true);
    }

    let databases: Api<Elasticsearch> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);

    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();
    let managed = WatcherConfig::default()
        .any_semantic()
        .labels(&format!("{}={}", LABEL_KIND, KIND));

    // Managed objects carry no owner references, so they map back by label
    Controller::new(databases, watcher_config)
        .watches(statefulsets, managed.clone(), |sts| owner_ref(&sts))
        .watches(services, managed.clone(), |svc| owner_ref(&svc))
        .watches(secrets, managed, |secret| owner_ref(&secret))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // NotFound is expected when a watch event arrives for a deleted object
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::info!("Elasticsearch controller stopped");
}

/// Run the DormantDatabase controller with optional namespace scoping.
pub async fn run_dormant_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for DormantDatabase resources (scope: {})",
        scope_msg
    );

    let dormants: Api<DormantDatabase> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(dormants, watcher_config)
        .run(reconcile_dormant, dormant_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled dormant database: {}", obj.name);
                }
                Err(e) => {
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Dormant database no longer exists: {:?}", e);
                    } else {
                        tracing::error!("Dormant database reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::info!("DormantDatabase controller stopped");
}

/// Run the Elasticsearch and DormantDatabase controllers side by side
pub async fn run_controllers(client: Client, ctx: Arc<Context>, namespace: Option<&str>) {
    futures::join!(
        run_controller_scoped(client.clone(), ctx.clone(), namespace),
        run_dormant_controller_scoped(client, ctx, namespace),
    );
}

/// Interval between refreshes of the fleet gauges
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Count databases per phase, treating a missing status as Pending
pub fn count_by_phase<'a>(dbs: impl IntoIterator<Item = &'a Elasticsearch>) -> BTreeMap<DatabasePhase, i64> {
    let mut counts = BTreeMap::new();
    for db in dbs {
        let phase = db.status.as_ref().map(|s| s.phase).unwrap_or_default();
        *counts.entry(phase).or_insert(0) += 1;
    }
    counts
}

/// Periodically publish database phase counts and schedule totals
pub async fn run_metrics_refresh(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
    cancel: CancellationToken,
) {
    let Some(state) = ctx.health.clone() else {
        return;
    };
    let databases: Api<Elasticsearch> = scoped_api(client, namespace);
    loop {
        match databases.list(&ListParams::default()).await {
            Ok(list) => state.metrics.set_databases_by_phase(&count_by_phase(&list.items)),
            Err(e) => tracing::debug!(error = %e, "failed to list databases for metrics"),
        }
        state
            .metrics
            .set_backup_schedules(i64::try_from(ctx.scheduler.len()).unwrap_or(i64::MAX));

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(METRICS_REFRESH_INTERVAL) => {}
        }
    }
}
