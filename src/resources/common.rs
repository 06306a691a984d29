//! Common utilities for Kubernetes resource generation
//!
//! Every object the operator manages carries the kind and name labels so it
//! can be found again and its ownership checked. Owner references are not
//! set: a `Halt` or `DoNotTerminate` deletion must leave children in place.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::Elasticsearch;

/// Kind label value for Elasticsearch objects
pub const KIND: &str = "Elasticsearch";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "elasticsearch-operator";

/// Label naming the kind of database that owns an object
pub const LABEL_KIND: &str = "kubedb.com/kind";

/// Label naming the database that owns an object
pub const LABEL_NAME: &str = "kubedb.com/name";

/// Label marking objects created by this operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation that skips the termination policy on delete
pub const ANNOTATION_IGNORE: &str = "kubedb.com/ignore";

/// Annotation holding the JSON init spec on dormant records
pub const ANNOTATION_INIT_SPEC: &str = "kubedb.com/init-spec";

/// Annotation holding the last reconciled spec as JSON
pub const ANNOTATION_LAST_APPLIED: &str = "kubedb.com/last-applied-spec";

/// Outcome of an ensure call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Created,
    Patched,
    Unchanged,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Created => write!(f, "created"),
            Verb::Patched => write!(f, "patched"),
            Verb::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Generate standard labels for all objects belonging to a database
pub fn standard_labels(db_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_KIND.to_string(), KIND.to_string()),
        (LABEL_NAME.to_string(), db_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
    ])
}

/// Label selector string matching every object of a database
pub fn selector_string(db_name: &str) -> String {
    format!("{}={},{}={}", LABEL_KIND, KIND, LABEL_NAME, db_name)
}

/// Metadata for an object owned by `db`
pub fn object_meta(db: &Elasticsearch, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: db.namespace(),
        labels: Some(standard_labels(&db.name_any())),
        ..Default::default()
    }
}

/// Whether an existing object carries the kind and name labels of `db_name`
pub fn is_owned_by(meta: &ObjectMeta, db_name: &str) -> bool {
    let Some(labels) = meta.labels.as_ref() else {
        return false;
    };
    labels.get(LABEL_KIND).map(String::as_str) == Some(KIND)
        && labels.get(LABEL_NAME).map(String::as_str) == Some(db_name)
}

/// Fail closed when an object with the intended name belongs to something else
pub fn check_ownership(meta: &ObjectMeta, db_name: &str, kind: &str) -> Result<()> {
    if is_owned_by(meta, db_name) {
        return Ok(());
    }
    Err(Error::ConflictError(format!(
        "intended {} \"{}\" already exists",
        kind,
        meta.name.clone().unwrap_or_default()
    )))
}
