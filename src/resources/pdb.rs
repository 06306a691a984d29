//! PodDisruptionBudget generation for Elasticsearch node groups
//!
//! Each node group gets its own PDB so that node maintenance drains at most
//! one pod of a group at a time.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::error::Result;
use crate::crd::Elasticsearch;
use crate::resources::client::KubeClient;
use crate::resources::common::standard_labels;
use crate::resources::topology::NodeGroupPlan;

/// Minimum available pods for a group of `replicas`
///
/// - 1 replica: 0 (allow disruption, will cause downtime)
/// - 2 replicas: 1
/// - 3+ replicas: replicas - 1 (one disruption at a time)
pub fn min_available(replicas: i32) -> i32 {
    match replicas {
        i32::MIN..=1 => 0,
        2 => 1,
        n => n - 1,
    }
}

/// Generate the PodDisruptionBudget for a node group
pub fn generate_pdb(db: &Elasticsearch, plan: &NodeGroupPlan) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(plan.statefulset_name.clone()),
            namespace: db.namespace(),
            labels: Some(standard_labels(&db.name_any())),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available(plan.replicas))),
            selector: Some(LabelSelector {
                match_labels: Some(plan.labels.clone()),
                ..Default::default()
            }),
            // Use IfHealthyBudget to allow eviction if pod is unhealthy
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Apply one PDB per node group
pub async fn ensure_pdbs(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    plans: &[NodeGroupPlan],
) -> Result<()> {
    for plan in plans {
        client.apply_pdb(&generate_pdb(db, plan)).await?;
    }
    Ok(())
}
