//! Validation of Elasticsearch specs and spec changes
//!
//! Everything here runs before the first mutating call of a reconcile. The
//! pure checks live in [`validate_spec`]; [`validate`] adds the lookups that
//! need the API (catalog entry, storage classes, backup secret).

use std::collections::BTreeSet;
use std::str::FromStr;

use kube::ResourceExt;
use semver::Version;

use crate::controller::error::{Error, Result};
use crate::crd::{
    BackupScheduleSpec, Elasticsearch, ElasticsearchClusterTopology, ElasticsearchSpec,
    ElasticsearchVersion, StorageSpec, StorageType,
};
use crate::resources::client::KubeClient;
use crate::resources::topology::{self, NodeRole, parse_version};

/// Smallest accepted replica count; zero is normalized to one by the planner
pub const MIN_REPLICAS: i32 = 0;

/// Largest accepted replica count per node group
///
/// Bounds the `cluster.initial_master_nodes` list and the seed hosts rendered
/// into every pod.
pub const MAX_REPLICAS: i32 = 100;

/// Resolve and validate everything `db` refers to
///
/// Returns the catalog entry so callers don't look it up twice.
pub async fn validate(client: &dyn KubeClient, db: &Elasticsearch) -> Result<ElasticsearchVersion> {
    let spec = &db.spec;
    if spec.version.trim().is_empty() {
        return Err(Error::ValidationError("spec.version is missing".to_string()));
    }

    let version = client
        .get_elasticsearch_version(&spec.version)
        .await?
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "ElasticsearchVersion \"{}\" not found",
                spec.version
            ))
        })?;
    validate_spec(db, &version)?;

    for class in storage_class_names(spec) {
        if !client.storage_class_exists(&class).await? {
            return Err(Error::ValidationError(format!(
                "StorageClass \"{}\" not found",
                class
            )));
        }
    }

    if let Some(schedule) = spec.backup_schedule.as_ref() {
        let ns = db.namespace().unwrap_or_default();
        if client
            .get_secret(&ns, &schedule.storage_secret_name)
            .await?
            .is_none()
        {
            return Err(Error::ValidationError(format!(
                "backup storage secret \"{}\" not found",
                schedule.storage_secret_name
            )));
        }
    }

    Ok(version)
}

/// Checks that need no API access
pub fn validate_spec(db: &Elasticsearch, version: &ElasticsearchVersion) -> Result<Version> {
    let spec = &db.spec;

    if version.spec.deprecated {
        return Err(Error::ValidationError(format!(
            "ElasticsearchVersion \"{}\" is deprecated",
            version.name_any()
        )));
    }
    let parsed = parse_version(&version.spec.version)?;

    validate_replicas(spec)?;
    validate_storage(spec)?;
    if let Some(schedule) = spec.backup_schedule.as_ref() {
        validate_backup_schedule(schedule)?;
    }
    if let Some(monitor) = spec.monitor.as_ref() {
        if monitor.prometheus.is_none() {
            return Err(Error::ValidationError(format!(
                "monitor agent {:?} requires a prometheus spec",
                monitor.agent
            )));
        }
    }

    // The planner enforces the master requirement and the tier gates
    topology::plan(db, &parsed)?;
    Ok(parsed)
}

fn validate_replicas(spec: &ElasticsearchSpec) -> Result<()> {
    check_replica_range("replica count", spec.replicas)?;
    if let Some(topology) = spec.topology.as_ref() {
        for role in NodeRole::ALL {
            if let Some(r) = role.node_spec(topology).and_then(|n| n.replicas) {
                check_replica_range(&format!("{} node replica count", role), r)?;
            }
        }
    }
    Ok(())
}

fn check_replica_range(what: &str, replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "{} {} is below minimum {}",
            what, replicas, MIN_REPLICAS
        )));
    }
    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "{} {} exceeds maximum {}",
            what, replicas, MAX_REPLICAS
        )));
    }
    Ok(())
}

fn validate_storage(spec: &ElasticsearchSpec) -> Result<()> {
    match spec.storage_type {
        StorageType::Ephemeral => {
            let node_storage = spec
                .topology
                .as_ref()
                .is_some_and(|t| node_storages(t).next().is_some());
            if spec.storage.is_some() || node_storage {
                return Err(Error::ValidationError(
                    "storage must not be set when storageType is Ephemeral".to_string(),
                ));
            }
        }
        StorageType::Durable => match spec.topology.as_ref() {
            None if spec.storage.is_none() => {
                return Err(Error::ValidationError(
                    "storage is required when storageType is Durable".to_string(),
                ));
            }
            None => {}
            Some(topology) => {
                for role in NodeRole::ALL {
                    let Some(node) = role.node_spec(topology) else {
                        continue;
                    };
                    if node.storage.is_none() && spec.storage.is_none() {
                        return Err(Error::ValidationError(format!(
                            "{} node requires storage when storageType is Durable",
                            role
                        )));
                    }
                }
            }
        },
    }
    Ok(())
}

fn node_storages(
    topology: &ElasticsearchClusterTopology,
) -> impl Iterator<Item = &StorageSpec> {
    NodeRole::ALL
        .into_iter()
        .filter_map(move |role| role.node_spec(topology))
        .filter_map(|node| node.storage.as_ref())
}

/// Storage classes named anywhere in the spec
pub fn storage_class_names(spec: &ElasticsearchSpec) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = spec
        .storage
        .iter()
        .filter_map(|s| s.storage_class_name.clone())
        .collect();
    if let Some(topology) = spec.topology.as_ref() {
        names.extend(node_storages(topology).filter_map(|s| s.storage_class_name.clone()));
    }
    names
}

fn validate_backup_schedule(schedule: &BackupScheduleSpec) -> Result<()> {
    cron::Schedule::from_str(&schedule.cron_expression).map_err(|e| {
        Error::ValidationError(format!(
            "invalid cron expression \"{}\": {}",
            schedule.cron_expression, e
        ))
    })?;
    if schedule.storage_secret_name.is_empty() {
        return Err(Error::ValidationError(
            "backup storage secret name is missing".to_string(),
        ));
    }
    if schedule.destination.location().is_empty() {
        return Err(Error::ValidationError(
            "backup destination has no bucket or container".to_string(),
        ));
    }
    Ok(())
}

/// Sub-sections that differ between the last reconciled spec and the current one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDiff {
    pub service_template_changed: bool,
    /// Replicas, resources, pod template or topology sizing
    pub node_groups_changed: bool,
    /// Security switch, TLS or config secret
    pub security_changed: bool,
    pub monitor_changed: bool,
    pub backup_schedule_changed: bool,
    pub termination_policy_changed: bool,
}

impl SpecDiff {
    pub fn has_changes(&self) -> bool {
        self.service_template_changed
            || self.node_groups_changed
            || self.security_changed
            || self.monitor_changed
            || self.backup_schedule_changed
            || self.termination_policy_changed
    }

    /// StatefulSets must be regenerated and patched
    pub fn requires_statefulset_sync(&self) -> bool {
        self.node_groups_changed || self.security_changed || self.monitor_changed
    }
}

/// Compare two specs, rejecting changes to fields fixed at creation
pub fn validate_spec_change(old: &ElasticsearchSpec, new: &ElasticsearchSpec) -> Result<SpecDiff> {
    let immutable = |field: &str| {
        Err(Error::ValidationError(format!(
            "spec.{} cannot be changed after creation",
            field
        )))
    };

    if old.version != new.version {
        return immutable("version");
    }
    if old.storage_type != new.storage_type {
        return immutable("storageType");
    }
    if old.storage != new.storage {
        return immutable("storage");
    }
    if old.topology.is_some() != new.topology.is_some() {
        return immutable("topology");
    }
    if let (Some(a), Some(b)) = (old.topology.as_ref(), new.topology.as_ref()) {
        for role in NodeRole::ALL {
            let (x, y) = (role.node_spec(a), role.node_spec(b));
            if x.is_some() != y.is_some() {
                return immutable(&format!("topology.{}", role.role_name()));
            }
            if let (Some(x), Some(y)) = (x, y) {
                if x.prefix != y.prefix || x.storage != y.storage {
                    return immutable(&format!("topology.{}", role.role_name()));
                }
            }
        }
    }
    if old.database_secret != new.database_secret {
        return immutable("databaseSecret");
    }
    if old.certificate_secret != new.certificate_secret {
        return immutable("certificateSecret");
    }

    Ok(SpecDiff {
        service_template_changed: old.service_template != new.service_template,
        node_groups_changed: old.replicas != new.replicas
            || old.topology != new.topology
            || old.resources != new.resources
            || old.pod_template != new.pod_template,
        security_changed: old.disable_security != new.disable_security
            || old.enable_ssl != new.enable_ssl
            || old.config_secret != new.config_secret,
        monitor_changed: old.monitor != new.monitor,
        backup_schedule_changed: old.backup_schedule != new.backup_schedule,
        termination_policy_changed: old.termination_policy != new.termination_policy,
    })
}
