use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::elasticsearch::{DatabasePhase, ElasticsearchSpec};

/// DormantDatabase retains the identity and spec of a halted Elasticsearch
/// object so it can be resumed or wiped out later.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    /// Recreate the origin object and drop this record
    #[serde(default)]
    pub resume: bool,

    /// Delete retained PVCs, secrets and snapshots
    #[serde(default)]
    pub wipe_out: bool,

    pub origin: Origin,
}

/// Metadata and spec of the object this record was taken from
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub name: String,

    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Spec with `init` removed
    pub spec: ElasticsearchSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default)]
    pub phase: DatabasePhase,

    /// Serialized as `null` when unset so status merge patches clear it
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiped_out_time: Option<String>,
}
