//! Lifecycle integration tests
//!
//! These tests verify what the operator writes to the cluster: finalizers,
//! StatefulSets, Services, secrets, dormant records and phases. They do not
//! wait for Elasticsearch itself to start.

use elasticsearch_operator::controller::FINALIZER;
use elasticsearch_operator::crd::{
    DatabasePhase, DormantDatabase, Elasticsearch, TerminationPolicy,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::Api;
use kube::api::{DeleteParams, ListParams, PostParams};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    ElasticsearchBuilder, ScopedOperator, SharedTestCluster, TEST_VERSION, TestNamespace,
    dormant_phase, ensure_crds_installed, failed_with, has_finalizer, wait_for,
    wait_for_deletion, wait_for_resource,
};

/// Object creation and finalizer handling
const FAST_TIMEOUT: Duration = Duration::from_secs(30);
/// Covers the readiness timeout of the test operator plus termination
const SLOW_TIMEOUT: Duration = Duration::from_secs(90);

const DB_NAME: &str = "es";

struct TestContext {
    ns: TestNamespace,
    _operator: ScopedOperator,
    _cluster: Arc<SharedTestCluster>,
}

impl TestContext {
    fn databases(&self) -> Api<Elasticsearch> {
        self.ns.api()
    }
}

async fn setup(prefix: &str) -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn")
        .with_test_writer()
        .try_init();

    let cluster = SharedTestCluster::get()
        .await
        .expect("Failed to get cluster");
    ensure_crds_installed(&cluster)
        .await
        .expect("Failed to install CRDs");

    let client = cluster.new_client().await.expect("Failed to create client");
    let ns = TestNamespace::create(client.clone(), prefix)
        .await
        .expect("Failed to create namespace");
    let operator = ScopedOperator::start(client, ns.name()).await;

    TestContext {
        ns,
        _operator: operator,
        _cluster: cluster,
    }
}

async fn create_database(ctx: &TestContext, db: &Elasticsearch) {
    ctx.databases()
        .create(&PostParams::default(), db)
        .await
        .expect("Failed to create Elasticsearch");
    wait_for(&ctx.databases(), DB_NAME, has_finalizer(FINALIZER), FAST_TIMEOUT)
        .await
        .expect("finalizer was not added");
}

/// Wait until the create path has given up on readiness, so deletion is
/// handled without waiting behind it
async fn wait_until_settled(ctx: &TestContext) {
    wait_for(
        &ctx.databases(),
        DB_NAME,
        |obj: Option<&Elasticsearch>| {
            obj.and_then(|db| db.status.as_ref())
                .is_some_and(|s| matches!(s.phase, DatabasePhase::Running | DatabasePhase::Failed))
        },
        SLOW_TIMEOUT,
    )
    .await
    .expect("create path did not finish");
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_create_provisions_objects() {
    let ctx = setup("es-create").await;
    let db = ElasticsearchBuilder::new(DB_NAME, ctx.ns.name())
        .with_version(TEST_VERSION)
        .with_replicas(3)
        .build();
    create_database(&ctx, &db).await;

    let sts = wait_for_resource(&ctx.ns.api::<StatefulSet>(), DB_NAME, FAST_TIMEOUT)
        .await
        .expect("StatefulSet not created");
    assert_eq!(sts.spec.unwrap().replicas, Some(3));

    let services: Api<Service> = ctx.ns.api();
    wait_for_resource(&services, DB_NAME, FAST_TIMEOUT)
        .await
        .expect("primary service not created");
    let discovery = wait_for_resource(&services, "es-discovery", FAST_TIMEOUT)
        .await
        .expect("discovery service not created");
    assert_eq!(discovery.spec.unwrap().cluster_ip.as_deref(), Some("None"));

    let secrets: Api<Secret> = ctx.ns.api();
    for name in ["es-auth", "es-cert", "es-config"] {
        wait_for_resource(&secrets, name, FAST_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("secret {} not created: {}", name, e));
    }

    let _ = ctx.ns.cleanup().await;
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_dedicated_topology_creates_groups() {
    let ctx = setup("es-topology").await;
    let db = ElasticsearchBuilder::new(DB_NAME, ctx.ns.name())
        .with_version(TEST_VERSION)
        .with_topology(1, 1, 1)
        .build();
    create_database(&ctx, &db).await;

    let statefulsets: Api<StatefulSet> = ctx.ns.api();
    for name in ["es-master", "es-ingest", "es-data"] {
        wait_for_resource(&statefulsets, name, SLOW_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("StatefulSet {} not created: {}", name, e));
    }

    let _ = ctx.ns.cleanup().await;
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_unknown_version_fails() {
    let ctx = setup("es-invalid").await;
    let db = ElasticsearchBuilder::new(DB_NAME, ctx.ns.name())
        .with_version("0.0.1")
        .build();
    create_database(&ctx, &db).await;

    wait_for(&ctx.databases(), DB_NAME, failed_with("0.0.1"), FAST_TIMEOUT)
        .await
        .expect("database did not fail validation");

    let statefulsets: Api<StatefulSet> = ctx.ns.api();
    let list = statefulsets.list(&ListParams::default()).await.unwrap();
    assert!(list.items.is_empty());

    let _ = ctx.ns.cleanup().await;
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_halt_writes_dormant_record() {
    let ctx = setup("es-halt").await;
    let db = ElasticsearchBuilder::new(DB_NAME, ctx.ns.name())
        .with_version(TEST_VERSION)
        .with_termination_policy(TerminationPolicy::Halt)
        .build();
    create_database(&ctx, &db).await;
    wait_until_settled(&ctx).await;

    ctx.databases()
        .delete(DB_NAME, &DeleteParams::default())
        .await
        .expect("Failed to delete Elasticsearch");
    wait_for_deletion(&ctx.databases(), DB_NAME, SLOW_TIMEOUT)
        .await
        .expect("Elasticsearch was not released");

    let dormants: Api<DormantDatabase> = ctx.ns.api();
    let dormant = wait_for(&dormants, DB_NAME, dormant_phase(DatabasePhase::Halted), FAST_TIMEOUT)
        .await
        .expect("dormant record not written");
    assert_eq!(dormant.spec.origin.spec.version, TEST_VERSION);

    wait_for_deletion(&ctx.ns.api::<StatefulSet>(), DB_NAME, FAST_TIMEOUT)
        .await
        .expect("StatefulSet not removed");
    let secrets: Api<Secret> = ctx.ns.api();
    assert!(secrets.get_opt("es-auth").await.unwrap().is_some());

    let _ = ctx.ns.cleanup().await;
}

#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_wipe_out_removes_secrets() {
    let ctx = setup("es-wipeout").await;
    let db = ElasticsearchBuilder::new(DB_NAME, ctx.ns.name())
        .with_version(TEST_VERSION)
        .with_termination_policy(TerminationPolicy::WipeOut)
        .build();
    create_database(&ctx, &db).await;
    wait_until_settled(&ctx).await;

    ctx.databases()
        .delete(DB_NAME, &DeleteParams::default())
        .await
        .expect("Failed to delete Elasticsearch");
    wait_for_deletion(&ctx.databases(), DB_NAME, SLOW_TIMEOUT)
        .await
        .expect("Elasticsearch was not released");

    let secrets: Api<Secret> = ctx.ns.api();
    for name in ["es-auth", "es-cert", "es-config"] {
        wait_for_deletion(&secrets, name, FAST_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("secret {} not removed: {}", name, e));
    }
    let dormants: Api<DormantDatabase> = ctx.ns.api();
    assert!(dormants.get_opt(DB_NAME).await.unwrap().is_none());

    let _ = ctx.ns.cleanup().await;
}
