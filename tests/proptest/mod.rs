// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for Elasticsearch validation and node group planning
//!
//! These tests use proptest to generate random configurations and verify that:
//! 1. Valid specs always plan node groups without panicking
//! 2. Sizing helpers keep their bounds for any input
//! 3. The state machine never panics on any event sequence
//! 4. Planning is deterministic (same input = same output)

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;

use elasticsearch_operator::controller::state_machine::{
    DatabaseStateMachine, LifecycleEvent, TransitionContext,
};
use elasticsearch_operator::controller::validation::{
    MAX_REPLICAS, validate_spec, validate_spec_change,
};
use elasticsearch_operator::crd::{
    DatabasePhase, Distribution, ResourceList, ResourceRequirements, TerminationPolicy,
};
use elasticsearch_operator::resources::topology::{
    MIN_HEAP_BYTES, heap_size, normalize_replicas, parse_memory_bytes, parse_version, plan, quorum,
};

use common::{ElasticsearchBuilder, elasticsearch_version};

// =============================================================================
// Strategy generators
// =============================================================================

/// Catalog versions that support every feature of the combined layout
fn valid_version() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("7.10.2"), Just("7.13.0"), Just("7.16.3")]
}

fn distribution() -> impl Strategy<Value = Distribution> {
    prop_oneof![
        Just(Distribution::ElasticStack),
        Just(Distribution::SearchGuard),
        Just(Distribution::OpenDistro),
    ]
}

fn termination_policy() -> impl Strategy<Value = TerminationPolicy> {
    prop_oneof![
        Just(TerminationPolicy::DoNotTerminate),
        Just(TerminationPolicy::Halt),
        Just(TerminationPolicy::Delete),
        Just(TerminationPolicy::WipeOut),
    ]
}

/// Storage sizes in the units Kubernetes quantities accept (shrinks toward 1Gi)
fn storage_size() -> impl Strategy<Value = String> {
    prop_oneof![
        (1..=500u32).prop_map(|n| format!("{}Gi", n)),
        (100..=999u32).prop_map(|n| format!("{}Mi", n)),
    ]
}

fn lifecycle_event() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        Just(LifecycleEvent::CreateStarted),
        Just(LifecycleEvent::ResourcesReady),
        Just(LifecycleEvent::InitStarted),
        Just(LifecycleEvent::InitFinished),
        Just(LifecycleEvent::ReconcileError),
        Just(LifecycleEvent::DeletionRequested),
        Just(LifecycleEvent::DeletionReverted),
        Just(LifecycleEvent::Halted),
        Just(LifecycleEvent::WipeOutStarted),
        Just(LifecycleEvent::WipedOut),
        Just(LifecycleEvent::ResumeRequested),
    ]
}

fn memory_limit(quantity: String) -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(ResourceList {
            cpu: None,
            memory: Some(quantity),
        }),
        requests: None,
    }
}

// =============================================================================
// Sizing properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn quorum_is_strict_majority(masters in 1..=99i32) {
        let q = quorum(masters);
        prop_assert!(q * 2 > masters);
        prop_assert!(q <= masters);
    }

    #[test]
    fn replicas_are_always_positive(replicas in proptest::option::of(-100..=100i32)) {
        let normalized = normalize_replicas(replicas);
        prop_assert!(normalized >= 1);
        if let Some(r) = replicas.filter(|r| *r > 0) {
            prop_assert_eq!(normalized, r);
        }
    }

    #[test]
    fn heap_matches_limits_above_floor(mi in 128..=65536i64) {
        let limit = memory_limit(format!("{}Mi", mi));
        let heap = heap_size(Some(&limit));
        prop_assert_eq!(heap, mi * 1024 * 1024);
        prop_assert!(heap >= MIN_HEAP_BYTES);
    }

    #[test]
    fn heap_never_below_floor(quantity in "[0-9]{0,6}(Ki|Mi|Gi|k|M|G)?") {
        let limit = memory_limit(quantity.clone());
        let heap = heap_size(Some(&limit));
        prop_assert!(heap >= MIN_HEAP_BYTES);
        if let Some(bytes) = parse_memory_bytes(&quantity).filter(|b| *b >= MIN_HEAP_BYTES) {
            prop_assert_eq!(heap, bytes);
        }
    }

    #[test]
    fn parse_memory_never_panics(quantity in "\\PC{0,12}") {
        let _ = parse_memory_bytes(&quantity);
    }

    #[test]
    fn parse_version_never_panics(raw in "v?[0-9]{0,2}(\\.[0-9]{0,2}){0,3}(-[a-z]{0,6})?") {
        let _ = parse_version(&raw);
    }
}

// =============================================================================
// Planning properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn combined_spec_validates_and_plans(
        version in valid_version(),
        dist in distribution(),
        replicas in 1..=20i32,
        size in storage_size(),
        policy in termination_policy(),
    ) {
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_version(version)
            .with_replicas(replicas)
            .with_storage(&size, None)
            .with_termination_policy(policy)
            .build();
        let catalog = elasticsearch_version(version, version, dist);

        let parsed = validate_spec(&db, &catalog).unwrap();
        let plans = plan(&db, &parsed).unwrap();
        prop_assert_eq!(plans.len(), 1);
        prop_assert_eq!(plans[0].replicas, replicas);
        prop_assert!(plans[0].is_client());
    }

    #[test]
    fn dedicated_plan_is_deterministic(
        masters in 1..=7i32,
        data in 0..=10i32,
        ingest in 1..=5i32,
    ) {
        let db = ElasticsearchBuilder::new("es", "demo")
            .with_topology(masters, data, ingest)
            .build();
        let version = parse_version("7.10.2").unwrap();

        let first = plan(&db, &version).unwrap();
        let second = plan(&db, &version).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.iter().all(|p| p.replicas >= 1));
        prop_assert!(first.iter().any(|p| p.is_client()));

        let expected_masters: Vec<String> =
            (0..masters).map(|i| format!("es-master-{}", i)).collect();
        let expected_masters = expected_masters.join(",");
        let master = first.iter().find(|p| p.statefulset_name == "es-master").unwrap();
        prop_assert_eq!(
            master.env_value("cluster.initial_master_nodes"),
            Some(expected_masters.as_str())
        );
    }

    #[test]
    fn oversized_replica_counts_rejected(replicas in (MAX_REPLICAS + 1)..=i32::MAX) {
        let db = ElasticsearchBuilder::new("es", "demo").with_replicas(replicas).build();
        let catalog = elasticsearch_version("7.10.2", "7.10.2", Distribution::ElasticStack);
        prop_assert!(validate_spec(&db, &catalog).is_err());
    }

    #[test]
    fn replica_changes_never_rejected(old in 1..=20i32, new in 1..=20i32) {
        let before = ElasticsearchBuilder::new("es", "demo").with_replicas(old).build();
        let after = ElasticsearchBuilder::new("es", "demo").with_replicas(new).build();
        let diff = validate_spec_change(&before.spec, &after.spec).unwrap();
        prop_assert_eq!(diff.node_groups_changed, old != new);
    }
}

// =============================================================================
// State machine properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn random_event_sequences_stay_in_lifecycle(
        events in prop::collection::vec(lifecycle_event(), 0..30),
        policy in termination_policy(),
        ready in any::<bool>(),
        snapshot in any::<bool>(),
    ) {
        let sm = DatabaseStateMachine::new();
        let mut tctx = TransitionContext::new(policy);
        if ready {
            tctx = tctx.ready();
        }
        if snapshot {
            tctx = tctx.with_snapshot_source();
        }

        let mut phase = DatabasePhase::Pending;
        for event in events {
            let allowed = sm.can_transition(&phase, &event);
            match sm.transition(&phase, event, &tctx).target() {
                Some(next) => {
                    prop_assert!(allowed);
                    prop_assert_ne!(phase, DatabasePhase::WipedOut);
                    phase = next;
                }
                None => {}
            }
        }
        prop_assert!(DatabasePhase::ALL.contains(&phase));
    }

    #[test]
    fn wiped_out_accepts_nothing(event in lifecycle_event(), policy in termination_policy()) {
        let sm = DatabaseStateMachine::new();
        let tctx = TransitionContext::new(policy).ready();
        prop_assert_eq!(
            sm.transition(&DatabasePhase::WipedOut, event, &tctx).target(),
            None
        );
    }
}
