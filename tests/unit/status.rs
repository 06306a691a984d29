//! Unit tests for status management

use std::sync::Arc;

use elasticsearch_operator::controller::status::{
    ConditionBuilder, StatusManager, condition_status, condition_types,
};
use elasticsearch_operator::controller::{
    Context, LifecycleEvent, OperatorConfig, TransitionContext,
};
use elasticsearch_operator::crd::{DatabasePhase, TerminationPolicy};

use crate::common::{FakeClient, create_test_database};

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_builder_is_empty() {
        assert!(ConditionBuilder::new(Some(1)).build().is_empty());
    }

    #[test]
    fn test_ready_progressing_degraded() {
        let conditions = ConditionBuilder::new(Some(3))
            .ready(true, "DatabaseReady", "ready")
            .progressing(false, "Stable", "stable")
            .degraded(false, "Healthy", "healthy")
            .build();
        assert_eq!(conditions.len(), 3);

        let ready = conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
            .unwrap();
        assert_eq!(ready.status, condition_status::TRUE);
        assert_eq!(ready.observed_generation, Some(3));
    }

    #[test]
    fn test_set_condition_replaces_by_type() {
        let conditions = ConditionBuilder::new(None)
            .ready(false, "Creating", "creating")
            .ready(true, "DatabaseReady", "ready")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "DatabaseReady");
        assert_eq!(conditions[0].status, condition_status::TRUE);
    }

    #[test]
    fn test_from_existing_keeps_other_conditions() {
        let existing = ConditionBuilder::new(Some(1))
            .degraded(true, "ReconcileError", "boom")
            .build();
        let conditions = ConditionBuilder::from_existing(existing, Some(2))
            .ready(true, "DatabaseReady", "ready")
            .build();
        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().any(|c| c.type_ == condition_types::DEGRADED));
    }
}

mod status_manager_tests {
    use super::*;

    fn setup() -> (Arc<FakeClient>, Context) {
        let client = Arc::new(FakeClient::new());
        let ctx = Context::without_events(client.clone(), OperatorConfig::default());
        (client, ctx)
    }

    #[tokio::test]
    async fn test_create_started_sets_creation_time() {
        let (client, ctx) = setup();
        let db = create_test_database("es", "demo", 1);
        client.add_elasticsearch(&db);

        let mut status = StatusManager::new(&db, &ctx);
        let tctx = TransitionContext::new(TerminationPolicy::Halt);
        let phase = status
            .transition(LifecycleEvent::CreateStarted, &tctx)
            .await
            .unwrap();
        assert_eq!(phase, Some(DatabasePhase::Creating));

        let stored = client.elasticsearch("demo", "es").unwrap().status.unwrap();
        assert_eq!(stored.phase, DatabasePhase::Creating);
        assert!(stored.creation_time.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_writes_nothing() {
        let (client, ctx) = setup();
        let db = create_test_database("es", "demo", 1);
        client.add_elasticsearch(&db);

        let mut status = StatusManager::new(&db, &ctx);
        let tctx = TransitionContext::new(TerminationPolicy::Halt).ready();
        let phase = status
            .transition(LifecycleEvent::InitFinished, &tctx)
            .await
            .unwrap();
        assert_eq!(phase, None);
        assert_eq!(status.phase(), DatabasePhase::Pending);
        assert!(client.elasticsearch("demo", "es").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let (client, ctx) = setup();
        let db = create_test_database("es", "demo", 1);
        client.add_elasticsearch(&db);

        let mut status = StatusManager::new(&db, &ctx);
        let tctx = TransitionContext::new(TerminationPolicy::Halt);
        status
            .transition(LifecycleEvent::CreateStarted, &tctx)
            .await
            .unwrap();
        status.fail("StorageClass \"fast\" not found").await.unwrap();

        let stored = client.elasticsearch("demo", "es").unwrap().status.unwrap();
        assert_eq!(stored.phase, DatabasePhase::Failed);
        assert_eq!(stored.reason.as_deref(), Some("StorageClass \"fast\" not found"));
        let degraded = stored
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::DEGRADED)
            .unwrap();
        assert_eq!(degraded.status, condition_status::TRUE);
    }

    #[tokio::test]
    async fn test_creation_time_survives_retry() {
        let (client, ctx) = setup();
        let db = create_test_database("es", "demo", 1);
        client.add_elasticsearch(&db);

        let tctx = TransitionContext::new(TerminationPolicy::Halt);
        let mut status = StatusManager::new(&db, &ctx);
        status
            .transition(LifecycleEvent::CreateStarted, &tctx)
            .await
            .unwrap();
        status.fail("boom").await.unwrap();
        let first = status.status().creation_time.clone();

        status
            .transition(LifecycleEvent::CreateStarted, &tctx)
            .await
            .unwrap();
        assert_eq!(status.phase(), DatabasePhase::Creating);
        assert_eq!(status.status().creation_time, first);
        assert!(status.status().reason.is_none());
    }
}
