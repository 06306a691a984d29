//! Per-database service account, role and binding
//!
//! Pods run under a service account named after the database. The role only
//! grants read access to the database's own pods and StatefulSets.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;

use crate::controller::error::Result;
use crate::crd::Elasticsearch;
use crate::resources::client::KubeClient;
use crate::resources::common::object_meta;

/// Generate the ServiceAccount used by Elasticsearch pods
pub fn generate_service_account(db: &Elasticsearch) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(db, db.name_any()),
        ..Default::default()
    }
}

/// Generate the Role bound to the database service account
pub fn generate_role(db: &Elasticsearch) -> Role {
    let read = vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    Role {
        metadata: object_meta(db, db.name_any()),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: read.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["apps".to_string()]),
                resources: Some(vec!["statefulsets".to_string()]),
                verbs: read,
                ..Default::default()
            },
        ]),
    }
}

/// Generate the RoleBinding for the database service account
pub fn generate_role_binding(db: &Elasticsearch) -> RoleBinding {
    let name = db.name_any();
    RoleBinding {
        metadata: object_meta(db, name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: db.namespace(),
            ..Default::default()
        }]),
    }
}

/// Apply the service account, role and binding
pub async fn ensure_rbac(client: &dyn KubeClient, db: &Elasticsearch) -> Result<()> {
    client
        .apply_service_account(&generate_service_account(db))
        .await?;
    client.apply_role(&generate_role(db)).await?;
    client.apply_role_binding(&generate_role_binding(db)).await?;
    Ok(())
}
