//! Unit tests for spec validation

use elasticsearch_operator::controller::validation::{
    MAX_REPLICAS, validate, validate_spec, validate_spec_change,
};
use elasticsearch_operator::controller::Error;
use elasticsearch_operator::crd::{
    Distribution, ElasticsearchClusterTopology, ElasticsearchNode, MonitorAgent, StorageSpec,
    TerminationPolicy,
};
use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;

use crate::common::{ElasticsearchBuilder, FakeClient, elasticsearch_version};

fn version_7_10() -> elasticsearch_operator::crd::ElasticsearchVersion {
    elasticsearch_version("7.10.2", "7.10.2", Distribution::ElasticStack)
}

fn assert_validation_error(err: Error, needle: &str) {
    match err {
        Error::ValidationError(msg) => assert!(msg.contains(needle), "unexpected message: {}", msg),
        other => panic!("expected validation error, got {:?}", other),
    }
}

mod api_lookup_tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_database_returns_catalog_entry() {
        let client = FakeClient::new();
        client.add_version(version_7_10());
        let db = ElasticsearchBuilder::new("es", "demo").build();

        let version = validate(&client, &db).await.unwrap();
        assert_eq!(version.spec.version, "7.10.2");
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let client = FakeClient::new();
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_version("9.9.9")
            .build();

        let err = validate(&client, &db).await.unwrap_err();
        assert_validation_error(err, "ElasticsearchVersion \"9.9.9\" not found");
    }

    #[tokio::test]
    async fn test_missing_storage_class_rejected() {
        let client = FakeClient::new();
        client.add_version(version_7_10());
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_storage("1Gi", Some("fast"))
            .build();

        let err = validate(&client, &db).await.unwrap_err();
        assert_validation_error(err, "StorageClass \"fast\" not found");

        client.add_storage_class("fast");
        assert!(validate(&client, &db).await.is_ok());
    }

    #[tokio::test]
    async fn test_backup_secret_must_exist() {
        let client = FakeClient::new();
        client.add_version(version_7_10());
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_backup_schedule("0 0 * * * *", "s3-creds")
            .build();

        let err = validate(&client, &db).await.unwrap_err();
        assert_validation_error(err, "s3-creds");

        client.add_secret(Secret {
            metadata: ObjectMeta {
                name: Some("s3-creds".to_string()),
                namespace: Some("demo".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(validate(&client, &db).await.is_ok());
    }
}

mod spec_tests {
    use super::*;

    #[test]
    fn test_topology_without_master_rejected() {
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_topology_spec(ElasticsearchClusterTopology {
                data: Some(ElasticsearchNode {
                    replicas: Some(2),
                    storage: Some(StorageSpec {
                        storage_class_name: None,
                        access_modes: Vec::new(),
                        size: "1Gi".to_string(),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .build();

        let err = validate_spec(&db, &version_7_10()).unwrap_err();
        assert_validation_error(err, "master");
    }

    #[test]
    fn test_frozen_tier_gated_on_7_12() {
        let node = || ElasticsearchNode {
            replicas: Some(1),
            storage: Some(StorageSpec {
                storage_class_name: None,
                access_modes: Vec::new(),
                size: "1Gi".to_string(),
            }),
            ..Default::default()
        };
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_topology_spec(ElasticsearchClusterTopology {
                master: Some(node()),
                ingest: Some(node()),
                data_frozen: Some(node()),
                ..Default::default()
            })
            .build();

        let err = validate_spec(&db, &version_7_10()).unwrap_err();
        assert_validation_error(err, "7.12");

        let newer = elasticsearch_version("7.13.0", "7.13.0", Distribution::ElasticStack);
        assert!(validate_spec(&db, &newer).is_ok());
    }

    #[test]
    fn test_oversized_master_group_rejected() {
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_topology(MAX_REPLICAS + 1, 1, 1)
            .build();
        let err = validate_spec(&db, &version_7_10()).unwrap_err();
        assert_validation_error(err, "master node replica count");

        let db = ElasticsearchBuilder::new("es", "demo")
            .with_topology(3, MAX_REPLICAS, 1)
            .build();
        assert!(validate_spec(&db, &version_7_10()).is_ok());
    }

    #[test]
    fn test_ephemeral_without_storage_accepted() {
        let db = ElasticsearchBuilder::new("es", "demo").ephemeral().build();
        assert!(validate_spec(&db, &version_7_10()).is_ok());
    }

    #[test]
    fn test_monitor_with_prometheus_accepted() {
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_monitor(MonitorAgent::PrometheusOperator)
            .build();
        assert!(validate_spec(&db, &version_7_10()).is_ok());
    }
}

mod spec_change_tests {
    use super::*;

    #[test]
    fn test_identical_specs_have_no_changes() {
        let db = ElasticsearchBuilder::new("es", "demo").build();
        let diff = validate_spec_change(&db.spec, &db.spec).unwrap();
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_replica_change_requires_statefulset_sync() {
        let old = ElasticsearchBuilder::new("es", "demo").with_replicas(1).build();
        let new = ElasticsearchBuilder::new("es", "demo").with_replicas(3).build();
        let diff = validate_spec_change(&old.spec, &new.spec).unwrap();
        assert!(diff.node_groups_changed);
        assert!(diff.requires_statefulset_sync());
    }

    #[test]
    fn test_termination_policy_change_is_mutable() {
        let old = ElasticsearchBuilder::new("es", "demo").build();
        let new = ElasticsearchBuilder::new("es", "demo")
            .with_termination_policy(TerminationPolicy::WipeOut)
            .build();
        let diff = validate_spec_change(&old.spec, &new.spec).unwrap();
        assert!(diff.termination_policy_changed);
        assert!(!diff.requires_statefulset_sync());
    }

    #[test]
    fn test_version_is_immutable() {
        let old = ElasticsearchBuilder::new("es", "demo").build();
        let new = ElasticsearchBuilder::new("es", "demo")
            .with_version("7.13.0")
            .build();
        let err = validate_spec_change(&old.spec, &new.spec).unwrap_err();
        assert_validation_error(err, "spec.version");
    }

    #[test]
    fn test_storage_is_immutable() {
        let old = ElasticsearchBuilder::new("es", "demo").build();
        let new = ElasticsearchBuilder::new("es", "demo")
            .with_storage("5Gi", None)
            .build();
        let err = validate_spec_change(&old.spec, &new.spec).unwrap_err();
        assert_validation_error(err, "spec.storage");
    }

    #[test]
    fn test_database_secret_is_immutable() {
        let old = ElasticsearchBuilder::new("es", "demo").build();
        let new = ElasticsearchBuilder::new("es", "demo")
            .with_database_secret("custom-auth")
            .build();
        let err = validate_spec_change(&old.spec, &new.spec).unwrap_err();
        assert_validation_error(err, "databaseSecret");
    }
}
