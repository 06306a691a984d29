//! Service generation for Elasticsearch clusters
//!
//! - `<name>` routes HTTP traffic to client (ingest) nodes
//! - `<name>-discovery` is headless and lets nodes find the masters
//! - `<name>-stats` exposes the exporter sidecar when monitoring is enabled

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::Result;
use crate::crd::{Elasticsearch, MonitorAgent};
use crate::resources::client::KubeClient;
use crate::resources::common::{Verb, check_ownership, object_meta, standard_labels};
use crate::resources::statefulset::{HTTP_PORT, TRANSPORT_PORT};
use crate::resources::topology::{NodeRole, ROLE_LABEL_VALUE, discovery_service_name};

/// Label separating the exporter service from the other services of a database
pub const LABEL_SERVICE_ROLE: &str = "kubedb.com/role";

/// Labels of the exporter service
pub fn stats_service_labels(db_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(db_name);
    labels.insert(LABEL_SERVICE_ROLE.to_string(), "stats".to_string());
    labels
}

/// Name of the exporter service
pub fn stats_service_name(db_name: &str) -> String {
    format!("{}-stats", db_name)
}

fn role_selector(db_name: &str, role: NodeRole) -> BTreeMap<String, String> {
    let mut selector = standard_labels(db_name);
    selector.insert(role.label_key(), ROLE_LABEL_VALUE.to_string());
    selector
}

/// Generate the primary (HTTP) service
pub fn generate_primary_service(db: &Elasticsearch) -> Service {
    let db_name = db.name_any();
    let template = db.spec.service_template.clone().unwrap_or_default();

    let mut metadata = object_meta(db, db_name.clone());
    if !template.annotations.is_empty() {
        metadata.annotations = Some(template.annotations);
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(role_selector(&db_name, NodeRole::Ingest)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::String("http".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some(template.type_.unwrap_or_else(|| "ClusterIP".to_string())),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the headless discovery service selecting master nodes
pub fn generate_discovery_service(db: &Elasticsearch) -> Service {
    let db_name = db.name_any();
    Service {
        metadata: object_meta(db, discovery_service_name(&db_name)),
        spec: Some(ServiceSpec {
            selector: Some(role_selector(&db_name, NodeRole::Master)),
            ports: Some(vec![ServicePort {
                name: Some("transport".to_string()),
                port: TRANSPORT_PORT,
                target_port: Some(IntOrString::String("transport".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the exporter service
///
/// The builtin Prometheus agent discovers it through scrape annotations; the
/// Prometheus operator selects it from a ServiceMonitor.
pub fn generate_stats_service(db: &Elasticsearch, agent: MonitorAgent, port: i32) -> Service {
    let db_name = db.name_any();
    let mut metadata = object_meta(db, stats_service_name(&db_name));
    metadata.labels = Some(stats_service_labels(&db_name));
    if agent == MonitorAgent::PrometheusBuiltin {
        metadata.annotations = Some(BTreeMap::from([
            ("prometheus.io/scrape".to_string(), "true".to_string()),
            ("prometheus.io/port".to_string(), port.to_string()),
            ("prometheus.io/path".to_string(), "/metrics".to_string()),
        ]));
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(role_selector(&db_name, NodeRole::Ingest)),
            ports: Some(vec![ServicePort {
                name: Some("metrics".to_string()),
                port,
                target_port: Some(IntOrString::String("metrics".to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether the fields the operator owns differ between two services
pub fn needs_patch(existing: &Service, desired: &Service) -> bool {
    let spec_fields = |svc: &Service| {
        svc.spec
            .as_ref()
            .map(|s| (s.selector.clone(), s.ports.clone(), s.type_.clone()))
    };
    let annotations = |svc: &Service| svc.metadata.annotations.clone().unwrap_or_default();

    let (existing_spec, desired_spec) = (spec_fields(existing), spec_fields(desired));
    let type_drift = match (&existing_spec, &desired_spec) {
        (Some((_, _, Some(_))), Some((_, _, None))) => false,
        (Some((_, _, a)), Some((_, _, b))) => a != b,
        _ => true,
    };
    let selector_or_ports = existing_spec.as_ref().map(|(s, p, _)| (s, p))
        != desired_spec.as_ref().map(|(s, p, _)| (s, p));

    // Extra annotations added by other controllers are left alone
    let desired_annotations = annotations(desired);
    let existing_annotations = annotations(existing);
    let annotations_drift = desired_annotations
        .iter()
        .any(|(k, v)| existing_annotations.get(k) != Some(v));

    type_drift || selector_or_ports || annotations_drift
}

/// Create or converge a service
///
/// An existing service without the database's kind and name labels is never
/// adopted.
pub async fn ensure_service(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    desired: &Service,
) -> Result<Verb> {
    let ns = db.namespace().unwrap_or_default();
    let name = desired.name_any();

    match client.get_service(&ns, &name).await? {
        None => {
            client.create_service(desired).await?;
            info!(service = %name, "created service");
            Ok(Verb::Created)
        }
        Some(existing) => {
            check_ownership(&existing.metadata, &db.name_any(), "service")?;
            if needs_patch(&existing, desired) {
                client.patch_service(desired).await?;
                info!(service = %name, "patched service");
                Ok(Verb::Patched)
            } else {
                debug!(service = %name, "service unchanged");
                Ok(Verb::Unchanged)
            }
        }
    }
}

/// Ensure the primary and discovery services
pub async fn ensure_services(client: &dyn KubeClient, db: &Elasticsearch) -> Result<Verb> {
    let primary = ensure_service(client, db, &generate_primary_service(db)).await?;
    let discovery = ensure_service(client, db, &generate_discovery_service(db)).await?;
    Ok(match (primary, discovery) {
        (Verb::Created, _) | (_, Verb::Created) => Verb::Created,
        (Verb::Patched, _) | (_, Verb::Patched) => Verb::Patched,
        _ => Verb::Unchanged,
    })
}
