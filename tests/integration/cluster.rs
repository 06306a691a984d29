//! Connection to the cluster named by the current kubeconfig
//!
//! The config is inferred once per test binary; each test builds its own
//! client from it because clients are bound to the runtime that created them.

use elasticsearch_operator::crd::{Distribution, ElasticsearchVersion};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Config};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{CrdError, elasticsearch_version, install_crds};

/// Catalog entry every integration test database refers to
pub const TEST_VERSION: &str = "7.10.2";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("kubeconfig could not be inferred: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("CRD installation failed: {0}")]
    Crd(#[from] CrdError),
}

static CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();
static PREREQUISITES: OnceCell<()> = OnceCell::const_new();

pub struct SharedTestCluster {
    config: Config,
}

impl SharedTestCluster {
    pub async fn get() -> Result<Arc<SharedTestCluster>, ClusterError> {
        CLUSTER
            .get_or_try_init(|| async {
                let cluster = SharedTestCluster {
                    config: Config::infer().await?,
                };
                let info = cluster.new_client().await?.apiserver_version().await?;
                tracing::info!(
                    platform = %info.platform,
                    version = %info.git_version,
                    "using cluster"
                );
                Ok(Arc::new(cluster))
            })
            .await
            .cloned()
    }

    pub async fn new_client(&self) -> Result<Client, ClusterError> {
        Ok(Client::try_from(self.config.clone())?)
    }
}

/// Install the CRDs and the test catalog entry once per run
pub async fn ensure_crds_installed(cluster: &SharedTestCluster) -> Result<(), ClusterError> {
    PREREQUISITES
        .get_or_try_init(|| async {
            let client = cluster.new_client().await?;
            install_crds(client.clone()).await?;
            install_catalog(client).await
        })
        .await
        .map(|_| ())
}

async fn install_catalog(client: Client) -> Result<(), ClusterError> {
    let versions: Api<ElasticsearchVersion> = Api::all(client);
    let version = elasticsearch_version(TEST_VERSION, TEST_VERSION, Distribution::ElasticStack);
    versions
        .patch(
            TEST_VERSION,
            &PatchParams::apply("integration-test").force(),
            &Patch::Apply(&version),
        )
        .await?;
    tracing::info!(version = TEST_VERSION, "catalog entry applied");
    Ok(())
}
