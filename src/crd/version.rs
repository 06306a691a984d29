use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ElasticsearchVersion is a cluster-scoped catalog entry that maps a
/// version name to images and a security plugin distribution.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "catalog.kubedb.com",
    version = "v1alpha1",
    kind = "ElasticsearchVersion",
    plural = "elasticsearchversions",
    shortname = "esversion",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Distribution", "type":"string", "jsonPath":".spec.distribution"}"#,
    printcolumn = r#"{"name":"Deprecated", "type":"boolean", "jsonPath":".spec.deprecated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchVersionSpec {
    /// Semantic version of the Elasticsearch server (e.g. "7.10.2")
    pub version: String,

    #[serde(default)]
    pub distribution: Distribution,

    pub db: ImageRef,

    pub exporter: ImageRef,

    pub init_container: ImageRef,

    /// Dump and restore tooling used by restore jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ImageRef>,

    /// Deprecated versions are rejected for new databases
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ImageRef {
    pub image: String,
}

/// Security plugin bundled with the image
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Distribution {
    /// Upstream image with X-Pack security
    #[default]
    ElasticStack,
    SearchGuard,
    OpenDistro,
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Distribution::ElasticStack => write!(f, "ElasticStack"),
            Distribution::SearchGuard => write!(f, "SearchGuard"),
            Distribution::OpenDistro => write!(f, "OpenDistro"),
        }
    }
}
