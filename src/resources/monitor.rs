//! Monitoring agent wiring for the exporter sidecar
//!
//! Both agents get the `<name>-stats` service. The Prometheus operator agent
//! additionally gets a ServiceMonitor selecting that service.

use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::info;

use crate::controller::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{
    Elasticsearch, MonitorAgent, MonitorEndpoint, MonitorSelector, MonitorSpec, NamespaceSelector,
    ServiceMonitor, ServiceMonitorSpec,
};
use crate::resources::client::KubeClient;
use crate::resources::common::standard_labels;
use crate::resources::service::{
    ensure_service, generate_stats_service, stats_service_labels, stats_service_name,
};
use crate::resources::statefulset::exporter_port;

/// Name of the ServiceMonitor of a database
pub fn service_monitor_name(db: &Elasticsearch) -> String {
    format!(
        "kubedb-{}-{}",
        db.namespace().unwrap_or_default(),
        db.name_any()
    )
}

fn monitor_namespace(db: &Elasticsearch, monitor: &MonitorSpec) -> String {
    monitor
        .prometheus
        .as_ref()
        .and_then(|p| p.namespace.clone())
        .or_else(|| db.namespace())
        .unwrap_or_default()
}

/// Generate the ServiceMonitor for the Prometheus operator agent
pub fn generate_service_monitor(db: &Elasticsearch, monitor: &MonitorSpec) -> ServiceMonitor {
    let db_name = db.name_any();
    let prometheus = monitor.prometheus.clone().unwrap_or_default();

    let mut labels = prometheus.labels.clone();
    labels.extend(standard_labels(&db_name));

    ServiceMonitor {
        metadata: ObjectMeta {
            name: Some(service_monitor_name(db)),
            namespace: Some(monitor_namespace(db, monitor)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ServiceMonitorSpec {
            selector: MonitorSelector {
                match_labels: stats_service_labels(&db_name),
            },
            namespace_selector: NamespaceSelector {
                match_names: db.namespace().into_iter().collect(),
            },
            endpoints: vec![MonitorEndpoint {
                port: "metrics".to_string(),
                path: Some("/metrics".to_string()),
                interval: prometheus.interval,
            }],
        },
    }
}

/// Create or update the monitoring objects for the current monitor spec
pub async fn ensure_monitor(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    config: &OperatorConfig,
) -> Result<()> {
    let Some(monitor) = db.spec.monitor.as_ref() else {
        return Ok(());
    };
    if monitor.prometheus.is_none() {
        return Err(Error::ValidationError(format!(
            "monitor agent {:?} requires a prometheus spec",
            monitor.agent
        )));
    }

    let stats = generate_stats_service(db, monitor.agent, exporter_port(db, config));
    ensure_service(client, db, &stats).await?;

    match monitor.agent {
        MonitorAgent::PrometheusOperator => {
            client
                .apply_service_monitor(&generate_service_monitor(db, monitor))
                .await?;
        }
        MonitorAgent::PrometheusBuiltin => {}
    }
    info!(agent = ?monitor.agent, "monitor configured");
    Ok(())
}

/// Remove the monitoring objects configured by `monitor`
pub async fn remove_monitor(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    monitor: &MonitorSpec,
) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    client
        .delete_service(&ns, &stats_service_name(&db.name_any()))
        .await?;
    if monitor.agent == MonitorAgent::PrometheusOperator {
        client
            .delete_service_monitor(&monitor_namespace(db, monitor), &service_monitor_name(db))
            .await?;
    }
    info!(agent = ?monitor.agent, "monitor removed");
    Ok(())
}

/// Converge monitoring after the monitor spec changed from `old` to the current one
pub async fn update_monitor(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    old: Option<&MonitorSpec>,
    config: &OperatorConfig,
) -> Result<()> {
    if let Some(old) = old {
        let agent_changed = db.spec.monitor.as_ref().map(|m| m.agent) != Some(old.agent);
        let namespace_changed = db
            .spec
            .monitor
            .as_ref()
            .is_some_and(|m| monitor_namespace(db, m) != monitor_namespace(db, old));
        if agent_changed || namespace_changed {
            remove_monitor(client, db, old).await?;
        }
    }
    ensure_monitor(client, db, config).await
}
