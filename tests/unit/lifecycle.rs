//! End-to-end reconcile flows against the in-memory cluster
//!
//! Each test drives `reconcile` the way the controller runtime would: the
//! object is re-read from the store before every call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use elasticsearch_operator::controller::{
    Context, FINALIZER, OperatorConfig, reconcile, reconcile_dormant,
};
use elasticsearch_operator::crd::{
    DatabasePhase, Distribution, Elasticsearch, Snapshot, SnapshotSpec, TerminationPolicy,
};
use elasticsearch_operator::resources::{ANNOTATION_LAST_APPLIED, standard_labels};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::common::{
    ElasticsearchBuilder, FakeClient, RecordingEvents, elasticsearch_version, s3_destination,
};

const NS: &str = "demo";
const NAME: &str = "es";

fn test_config() -> OperatorConfig {
    OperatorConfig {
        settle_delay: Duration::ZERO,
        readiness_poll_interval: Duration::from_millis(10),
        readiness_timeout: Duration::from_secs(1),
        restore_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn setup() -> (Arc<FakeClient>, Arc<Context>) {
    let client = Arc::new(FakeClient::new());
    client.add_version(elasticsearch_version("7.10.2", "7.10.2", Distribution::ElasticStack));
    let ctx = Arc::new(Context::without_events(client.clone(), test_config()));
    (client, ctx)
}

fn setup_with_events() -> (Arc<FakeClient>, Arc<Context>, Arc<RecordingEvents>) {
    let client = Arc::new(FakeClient::new());
    client.add_version(elasticsearch_version("7.10.2", "7.10.2", Distribution::ElasticStack));
    let events = Arc::new(RecordingEvents::default());
    let ctx = Arc::new(Context::new(client.clone(), events.clone(), test_config()));
    (client, ctx, events)
}

async fn reconcile_current(
    client: &FakeClient,
    ctx: &Arc<Context>,
) -> elasticsearch_operator::controller::Result<kube::runtime::controller::Action> {
    let db = client.elasticsearch(NS, NAME).expect("object exists");
    reconcile(Arc::new(db), ctx.clone()).await
}

fn phase(client: &FakeClient) -> Option<DatabasePhase> {
    client
        .elasticsearch(NS, NAME)
        .and_then(|db| db.status)
        .map(|s| s.phase)
}

/// Add the finalizer, then run the create path
async fn create_running(client: &FakeClient, ctx: &Arc<Context>, db: &Elasticsearch) {
    client.add_elasticsearch(db);
    reconcile_current(client, ctx).await.unwrap();
    assert!(
        client
            .elasticsearch(NS, NAME)
            .unwrap()
            .finalizers()
            .contains(&FINALIZER.to_string())
    );
    reconcile_current(client, ctx).await.unwrap();
    assert_eq!(phase(client), Some(DatabasePhase::Running));
}

type SecretContents = (Option<BTreeMap<String, ByteString>>, Option<BTreeMap<String, String>>);

fn secret_contents(client: &FakeClient, name: &str) -> SecretContents {
    client.with_state(|s| {
        let secret = &s.secrets[&(NS.to_string(), name.to_string())];
        (secret.data.clone(), secret.string_data.clone())
    })
}

/// Leave the objects in place but mark the database as failed mid-create
fn fail_after_create(client: &FakeClient, reason: &str) {
    client.with_state(|s| {
        let stored = s
            .elasticsearches
            .get_mut(&(NS.to_string(), NAME.to_string()))
            .unwrap();
        stored.annotations_mut().remove(ANNOTATION_LAST_APPLIED);
        let status = stored.status.as_mut().unwrap();
        status.phase = DatabasePhase::Failed;
        status.reason = Some(reason.to_string());
    });
}

fn data_pvc() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data-es-0".to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(standard_labels(NAME)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owned_snapshot(name: &str) -> Snapshot {
    let mut snapshot = Snapshot::new(
        name,
        SnapshotSpec {
            database_name: NAME.to_string(),
            storage_secret_name: "s3-creds".to_string(),
            destination: s3_destination(),
        },
    );
    snapshot.metadata.namespace = Some(NS.to_string());
    snapshot.metadata.labels = Some(standard_labels(NAME));
    snapshot
}

fn storage_secret() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("s3-creds".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_combined_database_reaches_running() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).with_replicas(3).build();
        create_running(&client, &ctx, &db).await;

        assert_eq!(client.statefulset_names(NS), vec!["es".to_string()]);
        assert_eq!(
            client.service_names(NS),
            vec!["es".to_string(), "es-discovery".to_string()]
        );
        assert_eq!(
            client.secret_names(NS),
            vec!["es-auth".to_string(), "es-cert".to_string(), "es-config".to_string()]
        );
        assert_eq!(client.pdb_count(NS), 1);

        let stored = client.elasticsearch(NS, NAME).unwrap();
        assert!(stored.annotations().contains_key(ANNOTATION_LAST_APPLIED));
        assert!(stored.status.unwrap().creation_time.is_some());
    }

    #[tokio::test]
    async fn test_dedicated_topology_creates_group_per_role() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS)
            .with_topology(3, 2, 1)
            .build();
        create_running(&client, &ctx, &db).await;

        assert_eq!(
            client.statefulset_names(NS),
            vec![
                "es-data".to_string(),
                "es-ingest".to_string(),
                "es-master".to_string()
            ]
        );
        assert_eq!(client.pdb_count(NS), 3);
    }

    #[tokio::test]
    async fn test_unknown_version_fails_database() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).with_version("1.0.0").build();
        client.add_elasticsearch(&db);

        reconcile_current(&client, &ctx).await.unwrap();
        assert!(reconcile_current(&client, &ctx).await.is_err());

        let status = client.elasticsearch(NS, NAME).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Failed);
        assert!(status.reason.unwrap().contains("1.0.0"));
        assert!(client.statefulset_names(NS).is_empty());
    }

    #[tokio::test]
    async fn test_retried_create_reuses_existing_objects() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).with_replicas(3).build();
        create_running(&client, &ctx, &db).await;
        let auth = secret_contents(&client, "es-auth");
        let cert = secret_contents(&client, "es-cert");

        fail_after_create(&client, "node group es was not ready");
        reconcile_current(&client, &ctx).await.unwrap();

        assert_eq!(phase(&client), Some(DatabasePhase::Running));
        assert_eq!(client.statefulset_names(NS), vec!["es".to_string()]);
        assert_eq!(
            client.service_names(NS),
            vec!["es".to_string(), "es-discovery".to_string()]
        );
        assert_eq!(
            client.secret_names(NS),
            vec!["es-auth".to_string(), "es-cert".to_string(), "es-config".to_string()]
        );
        assert_eq!(client.pdb_count(NS), 1);
        assert_eq!(secret_contents(&client, "es-auth"), auth);
        assert_eq!(secret_contents(&client, "es-cert"), cert);
    }

    #[tokio::test]
    async fn test_recovery_clears_failure_reason() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).build();
        create_running(&client, &ctx, &db).await;

        fail_after_create(&client, "node group es was not ready");
        reconcile_current(&client, &ctx).await.unwrap();

        let status = client.elasticsearch(NS, NAME).unwrap().status.unwrap();
        assert_eq!(status.phase, DatabasePhase::Running);
        assert_eq!(status.reason, None);
    }

    #[tokio::test]
    async fn test_snapshot_source_restores_then_runs() {
        let (client, ctx) = setup();
        client.add_snapshot(owned_snapshot("snap"));
        client.add_secret(storage_secret());
        let db = ElasticsearchBuilder::new(NAME, NS)
            .with_snapshot_source("snap", None)
            .build();
        create_running(&client, &ctx, &db).await;

        let jobs = client.with_state(|s| s.jobs.keys().cloned().collect::<Vec<_>>());
        assert_eq!(jobs, vec![(NS.to_string(), "es-restore-snap".to_string())]);
    }
}

mod update_tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_spec_is_noop() {
        let (client, ctx, events) = setup_with_events();
        let db = ElasticsearchBuilder::new(NAME, NS).build();
        create_running(&client, &ctx, &db).await;

        let before = client.with_state(|s| s.statefulsets.clone());
        let writes = client.write_count();
        let published = events.reasons().len();
        reconcile_current(&client, &ctx).await.unwrap();

        assert_eq!(client.write_count(), writes);
        assert_eq!(events.reasons().len(), published);
        let after = client.with_state(|s| s.statefulsets.clone());
        assert_eq!(before, after);
        assert_eq!(phase(&client), Some(DatabasePhase::Running));
    }

    #[tokio::test]
    async fn test_scaling_patches_statefulset() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).with_replicas(1).build();
        create_running(&client, &ctx, &db).await;

        client.with_state(|s| {
            let stored = s
                .elasticsearches
                .get_mut(&(NS.to_string(), NAME.to_string()))
                .unwrap();
            stored.spec.replicas = 3;
        });
        reconcile_current(&client, &ctx).await.unwrap();

        let replicas = client.with_state(|s| {
            s.statefulsets[&(NS.to_string(), NAME.to_string())]
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
        });
        assert_eq!(replicas, Some(3));
    }

    #[tokio::test]
    async fn test_immutable_change_is_rejected() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS).build();
        create_running(&client, &ctx, &db).await;

        client.with_state(|s| {
            let stored = s
                .elasticsearches
                .get_mut(&(NS.to_string(), NAME.to_string()))
                .unwrap();
            stored.spec.version = "7.13.0".to_string();
        });
        assert!(reconcile_current(&client, &ctx).await.is_err());
        assert_eq!(phase(&client), Some(DatabasePhase::Failed));
    }
}

mod termination_tests {
    use super::*;

    async fn create_and_delete(policy: TerminationPolicy) -> (Arc<FakeClient>, Arc<Context>) {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS)
            .with_termination_policy(policy)
            .build();
        create_running(&client, &ctx, &db).await;
        client.add_pvc(data_pvc());
        client.add_snapshot(owned_snapshot("snap"));

        client.delete_elasticsearch(NS, NAME);
        reconcile_current(&client, &ctx).await.unwrap();
        (client, ctx)
    }

    #[tokio::test]
    async fn test_halt_keeps_data_and_writes_dormant_record() {
        let (client, _ctx) = create_and_delete(TerminationPolicy::Halt).await;

        assert!(client.elasticsearch(NS, NAME).is_none());
        assert!(client.statefulset_names(NS).is_empty());
        assert!(client.service_names(NS).is_empty());
        assert_eq!(client.pdb_count(NS), 0);
        assert_eq!(client.pvc_count(NS), 1);
        assert_eq!(client.secret_names(NS).len(), 3);
        assert_eq!(client.snapshot_count(NS), 1);

        let dormant = client.dormant(NS, NAME).unwrap();
        assert_eq!(dormant.status.unwrap().phase, DatabasePhase::Halted);
        assert!(!dormant.spec.resume);
        assert_eq!(dormant.spec.origin.spec.version, "7.10.2");
    }

    #[tokio::test]
    async fn test_delete_removes_pvcs_but_keeps_secrets() {
        let (client, _ctx) = create_and_delete(TerminationPolicy::Delete).await;

        assert!(client.elasticsearch(NS, NAME).is_none());
        assert!(client.dormant(NS, NAME).is_none());
        assert_eq!(client.pvc_count(NS), 0);
        assert_eq!(client.secret_names(NS).len(), 3);
        assert_eq!(client.snapshot_count(NS), 1);
    }

    #[tokio::test]
    async fn test_wipe_out_removes_everything() {
        let (client, _ctx) = create_and_delete(TerminationPolicy::WipeOut).await;

        assert!(client.elasticsearch(NS, NAME).is_none());
        assert!(client.dormant(NS, NAME).is_none());
        assert_eq!(client.pvc_count(NS), 0);
        assert!(client.secret_names(NS).is_empty());
        assert_eq!(client.snapshot_count(NS), 0);
    }

    #[tokio::test]
    async fn test_do_not_terminate_recreates_object() {
        let (client, _ctx) = create_and_delete(TerminationPolicy::DoNotTerminate).await;

        let db = client.elasticsearch(NS, NAME).unwrap();
        assert!(db.metadata.deletion_timestamp.is_none());
        assert!(db.finalizers().contains(&FINALIZER.to_string()));
        assert_eq!(db.status.unwrap().phase, DatabasePhase::Running);
        assert_eq!(client.statefulset_names(NS), vec!["es".to_string()]);
        assert_eq!(client.pvc_count(NS), 1);
    }

    #[tokio::test]
    async fn test_ignore_annotation_skips_policy() {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS)
            .with_termination_policy(TerminationPolicy::WipeOut)
            .with_annotation("kubedb.com/ignore", "manual cleanup")
            .build();
        create_running(&client, &ctx, &db).await;
        client.add_pvc(data_pvc());

        client.delete_elasticsearch(NS, NAME);
        reconcile_current(&client, &ctx).await.unwrap();

        assert!(client.elasticsearch(NS, NAME).is_none());
        assert_eq!(client.pvc_count(NS), 1);
        assert_eq!(client.secret_names(NS).len(), 3);
    }
}

mod dormant_tests {
    use super::*;

    async fn halted() -> (Arc<FakeClient>, Arc<Context>) {
        let (client, ctx) = setup();
        let db = ElasticsearchBuilder::new(NAME, NS)
            .with_termination_policy(TerminationPolicy::Halt)
            .build();
        create_running(&client, &ctx, &db).await;
        client.add_pvc(data_pvc());
        client.delete_elasticsearch(NS, NAME);
        reconcile_current(&client, &ctx).await.unwrap();
        assert!(client.dormant(NS, NAME).is_some());
        (client, ctx)
    }

    async fn reconcile_record(client: &FakeClient, ctx: &Arc<Context>) {
        let dormant = client.dormant(NS, NAME).unwrap();
        reconcile_dormant(Arc::new(dormant), ctx.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_untouched_record_stays_halted() {
        let (client, ctx) = halted().await;
        reconcile_record(&client, &ctx).await;
        let dormant = client.dormant(NS, NAME).unwrap();
        assert_eq!(dormant.status.unwrap().phase, DatabasePhase::Halted);
    }

    #[tokio::test]
    async fn test_resume_recreates_database() {
        let (client, ctx) = halted().await;
        let auth = secret_contents(&client, "es-auth");
        let cert = secret_contents(&client, "es-cert");
        client.with_state(|s| {
            s.dormants
                .get_mut(&(NS.to_string(), NAME.to_string()))
                .unwrap()
                .spec
                .resume = true;
        });
        reconcile_record(&client, &ctx).await;

        assert!(client.dormant(NS, NAME).is_none());
        let db = client.elasticsearch(NS, NAME).unwrap();
        assert_eq!(db.spec.version, "7.10.2");

        reconcile_current(&client, &ctx).await.unwrap();
        reconcile_current(&client, &ctx).await.unwrap();
        assert_eq!(phase(&client), Some(DatabasePhase::Running));
        assert_eq!(client.pvc_count(NS), 1);
        assert_eq!(secret_contents(&client, "es-auth"), auth);
        assert_eq!(secret_contents(&client, "es-cert"), cert);
    }

    #[tokio::test]
    async fn test_recreated_object_claims_record() {
        let (client, ctx) = halted().await;
        let db = ElasticsearchBuilder::new(NAME, NS).build();
        create_running(&client, &ctx, &db).await;

        let dormant = client.dormant(NS, NAME).unwrap();
        assert!(dormant.spec.resume);

        reconcile_record(&client, &ctx).await;
        assert!(client.dormant(NS, NAME).is_none());
        assert!(client.elasticsearch(NS, NAME).is_some());
    }

    #[tokio::test]
    async fn test_diverging_spec_cannot_claim_record() {
        let (client, ctx) = halted().await;
        let db = ElasticsearchBuilder::new(NAME, NS).with_replicas(5).build();
        client.add_elasticsearch(&db);

        reconcile_current(&client, &ctx).await.unwrap();
        assert!(reconcile_current(&client, &ctx).await.is_err());
        assert_eq!(phase(&client), Some(DatabasePhase::Failed));
        assert!(!client.dormant(NS, NAME).unwrap().spec.resume);
    }

    #[tokio::test]
    async fn test_wipe_out_deletes_retained_data() {
        let (client, ctx) = halted().await;
        client.with_state(|s| {
            s.dormants
                .get_mut(&(NS.to_string(), NAME.to_string()))
                .unwrap()
                .spec
                .wipe_out = true;
        });
        reconcile_record(&client, &ctx).await;

        let dormant = client.dormant(NS, NAME).unwrap();
        let status = dormant.status.unwrap();
        assert_eq!(status.phase, DatabasePhase::WipedOut);
        assert!(status.wiped_out_time.is_some());
        assert_eq!(client.pvc_count(NS), 0);
        assert!(client.secret_names(NS).is_empty());
    }
}
