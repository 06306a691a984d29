use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Elasticsearch is the Schema for the elasticsearches API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    namespaced,
    status = "ElasticsearchStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Name of the ElasticsearchVersion catalog entry (e.g. "7.10.2-xpack")
    pub version: String,

    /// Number of combined-role nodes, used when no topology is given
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Dedicated node groups per role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<ElasticsearchClusterTopology>,

    /// Durable storage uses PVCs, Ephemeral uses emptyDir volumes
    #[serde(default)]
    pub storage_type: StorageType,

    /// Storage for combined nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Resources for combined nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Run without the security plugin. Explicitly insecure.
    #[serde(default)]
    pub disable_security: bool,

    /// Enable TLS on the HTTP layer
    #[serde(default)]
    pub enable_ssl: bool,

    /// Pre-existing certificate secret; generated as `<name>-cert` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret: Option<String>,

    /// Credential secret; generated as `<name>-auth` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret: Option<String>,

    /// User supplied configuration merged by the container entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret: Option<String>,

    /// What happens to data and credentials when the object is deleted
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Bootstrap data from a snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,

    /// Periodic snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    /// Metrics exporter configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,

    /// Pod level overrides
    #[serde(default)]
    pub pod_template: PodTemplateSpec,

    /// Primary service overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceTemplateSpec>,
}

fn default_replicas() -> i32 {
    1
}

/// Dedicated node groups. Master and ingest are required when a topology is set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchClusterTopology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<ElasticsearchNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest: Option<ElasticsearchNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ElasticsearchNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml: Option<ElasticsearchNode>,

    /// Requires Elasticsearch 7.10 or later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hot: Option<ElasticsearchNode>,

    /// Requires Elasticsearch 7.10 or later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_warm: Option<ElasticsearchNode>,

    /// Requires Elasticsearch 7.10 or later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_cold: Option<ElasticsearchNode>,

    /// Requires Elasticsearch 7.12 or later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_frozen: Option<ElasticsearchNode>,
}

/// A node group within the topology
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNode {
    /// StatefulSet name suffix; defaults to the role name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Defaults to 1; zero is treated as 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StorageType {
    #[default]
    Durable,
    Ephemeral,
}

/// Persistent volume claim template parameters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses the cluster default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Defaults to ReadWriteOnce
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// Size of the persistent volume (e.g., "10Gi")
    pub size: String,
}

/// Resource requirements for Elasticsearch pods
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Data retention contract applied when the object is deleted
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TerminationPolicy {
    /// Deletion is reverted and the object recreated
    DoNotTerminate,
    /// Compute is removed; PVCs, secrets and a dormant record are kept
    #[default]
    Halt,
    /// Compute and PVCs are removed; secrets are kept
    Delete,
    /// Everything is removed
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Halt => write!(f, "Halt"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSourceSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceSpec {
    /// Defaults to the namespace of the Elasticsearch object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,
}

/// Periodic snapshot configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Six-field cron expression (sec min hour day month weekday)
    pub cron_expression: String,

    /// Secret holding credentials for the destination
    pub storage_secret_name: String,

    pub destination: BackupDestination,
}

/// Snapshot destination
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackupDestination {
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    #[serde(rename = "gcs")]
    Gcs {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    Azure {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

impl BackupDestination {
    /// Bucket or container name
    pub fn location(&self) -> &str {
        match self {
            BackupDestination::S3 { bucket, .. } | BackupDestination::Gcs { bucket, .. } => bucket,
            BackupDestination::Azure { container, .. } => container,
        }
    }
}

/// Monitoring agent configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub agent: MonitorAgent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MonitorAgent {
    /// Scrape annotations on the stats service
    #[serde(rename = "prometheus.io/builtin")]
    PrometheusBuiltin,
    /// ServiceMonitor for the Prometheus operator
    #[serde(rename = "prometheus.io/coreos-operator")]
    PrometheusOperator,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Exporter port; defaults to 56790
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Namespace of the ServiceMonitor (coreos-operator agent only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Labels the Prometheus instance selects ServiceMonitors by
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Scrape interval (e.g. "10s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Pod level overrides applied to every node group
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Overrides operator computed environment variables with the same name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Passed through to the pod spec unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// ClusterIP (default), NodePort or LoadBalancer
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

fn preserve_unknown_fields(_: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}

/// Status of the Elasticsearch object
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    /// Set once when the create path starts; its absence marks a new object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    /// Cause of the last failure
    ///
    /// Always serialized so a merge patch without a failure clears it.
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase shared by Elasticsearch objects and their dormant records
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum DatabasePhase {
    /// Not yet observed by the operator
    #[default]
    Pending,
    Creating,
    /// Restoring from a snapshot
    Initializing,
    Running,
    Failed,
    /// Being deleted; termination policy in progress
    Terminating,
    /// Compute removed, data retained in a dormant record
    Halted,
    Resuming,
    WipingOut,
    WipedOut,
}

impl DatabasePhase {
    pub const ALL: [DatabasePhase; 10] = [
        DatabasePhase::Pending,
        DatabasePhase::Creating,
        DatabasePhase::Initializing,
        DatabasePhase::Running,
        DatabasePhase::Failed,
        DatabasePhase::Terminating,
        DatabasePhase::Halted,
        DatabasePhase::Resuming,
        DatabasePhase::WipingOut,
        DatabasePhase::WipedOut,
    ];
}

impl std::fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePhase::Pending => write!(f, "Pending"),
            DatabasePhase::Creating => write!(f, "Creating"),
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Failed => write!(f, "Failed"),
            DatabasePhase::Terminating => write!(f, "Terminating"),
            DatabasePhase::Halted => write!(f, "Halted"),
            DatabasePhase::Resuming => write!(f, "Resuming"),
            DatabasePhase::WipingOut => write!(f, "WipingOut"),
            DatabasePhase::WipedOut => write!(f, "WipedOut"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False, or Unknown
    pub status: String,

    pub reason: String,

    pub message: String,

    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ElasticsearchSpec {
    /// Copy of the spec with `init` removed, as recorded in dormant records
    pub fn without_init(&self) -> ElasticsearchSpec {
        ElasticsearchSpec {
            init: None,
            ..self.clone()
        }
    }

    /// Credential secret name for a database called `name`
    pub fn database_secret_name(&self, name: &str) -> String {
        self.database_secret
            .clone()
            .unwrap_or_else(|| format!("{}-auth", name))
    }

    /// Certificate secret name for a database called `name`
    pub fn certificate_secret_name(&self, name: &str) -> String {
        self.certificate_secret
            .clone()
            .unwrap_or_else(|| format!("{}-cert", name))
    }
}
