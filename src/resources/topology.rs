//! Topology planning for Elasticsearch node groups
//!
//! [`plan`] turns a spec and a resolved server version into the list of
//! node groups to materialize, one StatefulSet each. It is a pure function:
//! the same inputs always produce the same plans in the same order.
//!
//! Version-dependent settings are looked up in a single capability table so
//! the gates for node roles, bootstrap settings and data tiers live together.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::ResourceExt;
use semver::Version;

use crate::controller::error::{Error, Result};
use crate::crd::{
    Elasticsearch, ElasticsearchClusterTopology, ElasticsearchNode, ResourceRequirements,
    StorageSpec,
};
use crate::resources::common::standard_labels;

/// Smallest heap handed to the JVM (128 MiB)
pub const MIN_HEAP_BYTES: i64 = 128 * 1024 * 1024;

/// Value of role labels on pods
pub const ROLE_LABEL_VALUE: &str = "set";

/// A single Elasticsearch node role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    Master,
    Ingest,
    Data,
    Ml,
    DataHot,
    DataWarm,
    DataCold,
    DataFrozen,
}

impl NodeRole {
    /// Topology roles in planning order
    pub const ALL: [NodeRole; 8] = [
        NodeRole::Master,
        NodeRole::Ingest,
        NodeRole::Data,
        NodeRole::Ml,
        NodeRole::DataHot,
        NodeRole::DataWarm,
        NodeRole::DataCold,
        NodeRole::DataFrozen,
    ];

    /// StatefulSet suffix used when the node spec has no prefix
    pub fn default_prefix(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Ingest => "ingest",
            NodeRole::Data => "data",
            NodeRole::Ml => "ml",
            NodeRole::DataHot => "data-hot",
            NodeRole::DataWarm => "data-warm",
            NodeRole::DataCold => "data-cold",
            NodeRole::DataFrozen => "data-frozen",
        }
    }

    /// Role name as understood by `node.roles`
    pub fn role_name(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Ingest => "ingest",
            NodeRole::Data => "data",
            NodeRole::Ml => "ml",
            NodeRole::DataHot => "data_hot",
            NodeRole::DataWarm => "data_warm",
            NodeRole::DataCold => "data_cold",
            NodeRole::DataFrozen => "data_frozen",
        }
    }

    /// Pod label key marking membership in this role
    pub fn label_key(&self) -> String {
        format!("node.role.{}", self.role_name())
    }

    /// Capability a version needs before this role may be planned
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            NodeRole::DataHot | NodeRole::DataWarm | NodeRole::DataCold => {
                Some(Capability::DataTiers)
            }
            NodeRole::DataFrozen => Some(Capability::FrozenTier),
            _ => None,
        }
    }

    /// Whether pods with this role hold shard data
    pub fn holds_data(&self) -> bool {
        matches!(
            self,
            NodeRole::Data
                | NodeRole::DataHot
                | NodeRole::DataWarm
                | NodeRole::DataCold
                | NodeRole::DataFrozen
        )
    }

    /// The node spec declared for this role, if any
    pub fn node_spec(self, topology: &ElasticsearchClusterTopology) -> Option<&ElasticsearchNode> {
        match self {
            NodeRole::Master => topology.master.as_ref(),
            NodeRole::Ingest => topology.ingest.as_ref(),
            NodeRole::Data => topology.data.as_ref(),
            NodeRole::Ml => topology.ml.as_ref(),
            NodeRole::DataHot => topology.data_hot.as_ref(),
            NodeRole::DataWarm => topology.data_warm.as_ref(),
            NodeRole::DataCold => topology.data_cold.as_ref(),
            NodeRole::DataFrozen => topology.data_frozen.as_ref(),
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_prefix())
    }
}

/// Version-gated server features
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// `cluster.initial_master_nodes` replaces `discovery.zen.minimum_master_nodes`
    InitialMasterNodes,
    /// `node.roles` replaces the legacy `node.master` style booleans
    NodeRoles,
    /// Hot, warm and cold data tiers
    DataTiers,
    /// Frozen data tier
    FrozenTier,
}

/// Minimum server version for each capability
const CAPABILITIES: &[(Capability, u64, u64)] = &[
    (Capability::InitialMasterNodes, 7, 0),
    (Capability::NodeRoles, 7, 9),
    (Capability::DataTiers, 7, 10),
    (Capability::FrozenTier, 7, 12),
];

/// Lowest version that has `capability`
pub fn minimum_version(capability: Capability) -> Version {
    CAPABILITIES
        .iter()
        .find(|(c, _, _)| *c == capability)
        .map(|(_, major, minor)| Version::new(*major, *minor, 0))
        .unwrap_or_else(|| Version::new(u64::MAX, 0, 0))
}

/// Whether `version` has `capability`
pub fn supports(version: &Version, capability: Capability) -> bool {
    let min = minimum_version(capability);
    (version.major, version.minor) >= (min.major, min.minor)
}

/// Parse a catalog version, accepting a leading `v` and missing components
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Ok(v);
    }
    let mut parts = trimmed
        .split(|c: char| c == '.' || c == '-')
        .map(|p| p.parse::<u64>());
    let major = match parts.next() {
        Some(Ok(m)) => m,
        _ => {
            return Err(Error::ValidationError(format!(
                "invalid Elasticsearch version \"{}\"",
                raw
            )));
        }
    };
    let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    Ok(Version::new(major, minor, patch))
}

/// One node group: a single StatefulSet and its configuration
#[derive(Clone, Debug, PartialEq)]
pub struct NodeGroupPlan {
    /// Roles served by the group's pods
    pub roles: Vec<NodeRole>,
    /// True for the single group used when no topology is declared
    pub combined: bool,
    pub statefulset_name: String,
    /// Pod and selector labels
    pub labels: BTreeMap<String, String>,
    /// Always at least 1
    pub replicas: i32,
    pub resources: Option<ResourceRequirements>,
    pub storage: Option<StorageSpec>,
    /// Main container environment, user overrides applied
    pub env: Vec<EnvVar>,
    /// Init container environment
    pub init_env: Vec<EnvVar>,
    pub heap_bytes: i64,
}

impl NodeGroupPlan {
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// Client groups serve HTTP and receive the primary service traffic
    pub fn is_client(&self) -> bool {
        self.has_role(NodeRole::Ingest)
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }
}

/// Quorum for `masters` master-eligible nodes
pub fn quorum(masters: i32) -> i32 {
    (masters / 2) + 1
}

/// Normalize a replica count: absent or non-positive becomes 1
pub fn normalize_replicas(replicas: Option<i32>) -> i32 {
    match replicas {
        Some(r) if r > 0 => r,
        _ => 1,
    }
}

/// Parse a Kubernetes memory quantity into bytes
pub fn parse_memory_bytes(quantity: &str) -> Option<i64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((quantity, 1.0));

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier) as i64)
}

/// JVM heap for a memory limit
///
/// The heap equals the limit one-to-one, with no headroom ratio applied.
/// Without a limit, or below it, [`MIN_HEAP_BYTES`] is used.
pub fn heap_size(resources: Option<&ResourceRequirements>) -> i64 {
    resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.memory.as_deref())
        .and_then(parse_memory_bytes)
        .filter(|bytes| *bytes > 0)
        .map(|bytes| bytes.max(MIN_HEAP_BYTES))
        .unwrap_or(MIN_HEAP_BYTES)
}

/// StatefulSet name of the master-eligible group
pub fn master_statefulset_name(db: &Elasticsearch) -> String {
    let name = db.name_any();
    match db.spec.topology.as_ref().and_then(|t| t.master.as_ref()) {
        Some(node) => group_name(&name, NodeRole::Master, node),
        None => name,
    }
}

/// Name of the headless discovery service
pub fn discovery_service_name(db_name: &str) -> String {
    format!("{}-discovery", db_name)
}

fn group_name(db_name: &str, role: NodeRole, node: &ElasticsearchNode) -> String {
    let prefix = node
        .prefix
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(role.default_prefix());
    format!("{}-{}", db_name, prefix)
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Insert or replace an environment variable by name, keeping order
pub fn upsert_env(env: &mut Vec<EnvVar>, var: EnvVar) {
    match env.iter_mut().find(|e| e.name == var.name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Plan the node groups for `db` running `version`
pub fn plan(db: &Elasticsearch, version: &Version) -> Result<Vec<NodeGroupPlan>> {
    let name = db.name_any();

    let Some(topology) = db.spec.topology.as_ref() else {
        let replicas = normalize_replicas(Some(db.spec.replicas));
        let roles = vec![NodeRole::Master, NodeRole::Ingest, NodeRole::Data];
        let plan = build_plan(
            db,
            version,
            roles,
            true,
            name.clone(),
            replicas,
            db.spec.resources.clone(),
            db.spec.storage.clone(),
            replicas,
        );
        return Ok(vec![plan]);
    };

    let master = topology.master.as_ref().ok_or_else(|| {
        Error::ValidationError("topology requires a master node specification".to_string())
    })?;
    let master_replicas = normalize_replicas(master.replicas);

    let mut plans = Vec::new();
    for role in NodeRole::ALL {
        let Some(node) = role.node_spec(topology) else {
            continue;
        };
        if let Some(capability) = role.required_capability() {
            if !supports(version, capability) {
                let min = minimum_version(capability);
                return Err(Error::ValidationError(format!(
                    "{} node isn't supported; The {} node is introduced at version {}.{}",
                    role, role, min.major, min.minor
                )));
            }
        }
        plans.push(build_plan(
            db,
            version,
            vec![role],
            false,
            group_name(&name, role, node),
            normalize_replicas(node.replicas),
            node.resources.clone(),
            node.storage.clone(),
            master_replicas,
        ));
    }
    Ok(plans)
}

#[allow(clippy::too_many_arguments)]
fn build_plan(
    db: &Elasticsearch,
    version: &Version,
    roles: Vec<NodeRole>,
    combined: bool,
    statefulset_name: String,
    replicas: i32,
    resources: Option<ResourceRequirements>,
    storage: Option<StorageSpec>,
    master_replicas: i32,
) -> NodeGroupPlan {
    let db_name = db.name_any();

    let mut labels = standard_labels(&db_name);
    for role in &roles {
        labels.insert(role.label_key(), ROLE_LABEL_VALUE.to_string());
    }

    let heap_bytes = heap_size(resources.as_ref());
    let mut env = vec![plain_env(
        "ES_JAVA_OPTS",
        format!("-Xms{} -Xmx{}", heap_bytes, heap_bytes),
    )];

    let is_master = roles.contains(&NodeRole::Master);
    let is_ingest = roles.contains(&NodeRole::Ingest);
    let is_data = roles.iter().any(NodeRole::holds_data);
    if is_master {
        if supports(version, Capability::InitialMasterNodes) {
            let master_sts = master_statefulset_name(db);
            let nodes: Vec<String> = (0..master_replicas)
                .map(|i| format!("{}-{}", master_sts, i))
                .collect();
            upsert_env(
                &mut env,
                plain_env("cluster.initial_master_nodes", nodes.join(",")),
            );
        } else {
            upsert_env(
                &mut env,
                plain_env(
                    "discovery.zen.minimum_master_nodes",
                    quorum(master_replicas).to_string(),
                ),
            );
        }
    }

    if supports(version, Capability::NodeRoles) {
        let value = if combined {
            "master, data, ingest".to_string()
        } else {
            roles
                .iter()
                .flat_map(|r| match r {
                    NodeRole::Ml => vec!["ml", "remote_cluster_client"],
                    other => vec![other.role_name()],
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        upsert_env(&mut env, plain_env("NODE_ROLES", value));
    } else {
        upsert_env(&mut env, plain_env("node.ingest", is_ingest.to_string()));
        upsert_env(&mut env, plain_env("node.master", is_master.to_string()));
        upsert_env(&mut env, plain_env("node.data", is_data.to_string()));
        if !combined {
            let is_ml = roles.contains(&NodeRole::Ml);
            upsert_env(&mut env, plain_env("node.ml", is_ml.to_string()));
        }
    }

    upsert_env(&mut env, plain_env("CLUSTER_NAME", db_name.clone()));
    upsert_env(
        &mut env,
        plain_env("DISCOVERY_SERVICE", discovery_service_name(&db_name)),
    );
    upsert_env(&mut env, plain_env("SSL_ENABLE", db.spec.enable_ssl.to_string()));

    for user in &db.spec.pod_template.env {
        upsert_env(&mut env, plain_env(&user.name, user.value.clone()));
    }

    let init_env = vec![
        plain_env("NODE_MASTER", is_master.to_string()),
        plain_env("NODE_DATA", is_data.to_string()),
        plain_env("NODE_INGEST", is_ingest.to_string()),
    ];

    NodeGroupPlan {
        roles,
        combined,
        statefulset_name,
        labels,
        replicas,
        resources,
        storage,
        env,
        init_env,
        heap_bytes,
    }
}
