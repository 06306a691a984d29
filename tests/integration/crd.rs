//! CRD installation helpers for integration tests
//!
//! Definitions come straight from the derived types, so the cluster always
//! sees the schema the tests were compiled against.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use std::time::Duration;
use thiserror::Error;

use elasticsearch_operator::crd::{DormantDatabase, Elasticsearch, ElasticsearchVersion, Snapshot};

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD establishment timeout: {0}")]
    EstablishmentTimeout(String),

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

/// Definitions owned by the operator
///
/// ServiceMonitor belongs to the Prometheus operator and is left out.
pub fn operator_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Elasticsearch::crd(),
        DormantDatabase::crd(),
        Snapshot::crd(),
        ElasticsearchVersion::crd(),
    ]
}

/// Server-side apply the operator CRDs and wait until each is established
pub async fn install_crds(client: Client) -> Result<(), CrdError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("integration-test").force();

    for crd in operator_crds() {
        let name = crd.name_any();
        tracing::info!("Installing CRD {}...", name);
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;

        let establish = await_condition(crds.clone(), &name, conditions::is_crd_established());
        tokio::time::timeout(Duration::from_secs(30), establish)
            .await
            .map_err(|_| CrdError::EstablishmentTimeout(name.clone()))??;
    }

    tracing::info!("CRDs installed and established");
    Ok(())
}
