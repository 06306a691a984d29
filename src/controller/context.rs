use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;

use crate::controller::config::OperatorConfig;
use crate::controller::events::{EventPublisher, NoopEventPublisher};
use crate::controller::locks::KeyLocks;
use crate::controller::scheduler::BackupScheduler;
use crate::health::HealthState;
use crate::resources::client::KubeClient;

/// Shared context for the Elasticsearch and dormant controllers
#[derive(Clone)]
pub struct Context {
    /// Orchestration API
    pub client: Arc<dyn KubeClient>,
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
    /// Running backup schedules
    pub scheduler: Arc<BackupScheduler>,
    /// Per `namespace/name` serialization across both controllers
    pub locks: Arc<KeyLocks>,
    /// Cancelled on shutdown; bounded waits observe it
    pub cancel: CancellationToken,
    /// Metrics sink, absent in tests
    pub health: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            scheduler: Arc::new(BackupScheduler::new(client.clone(), cancel.clone())),
            client,
            events,
            config,
            locks: Arc::new(KeyLocks::new()),
            cancel,
            health: None,
        }
    }

    /// Context with events dropped, for tests and tooling
    pub fn without_events(client: Arc<dyn KubeClient>, config: OperatorConfig) -> Self {
        Self::new(client, Arc::new(NoopEventPublisher), config)
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Replace the shutdown token; backup schedules follow the new token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.scheduler = Arc::new(BackupScheduler::new(self.client.clone(), cancel.clone()));
        self.cancel = cancel;
        self
    }

    /// Publish a Normal event on `obj`
    pub async fn normal<K>(&self, obj: &K, reason: &str, action: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj.object_ref(&()), EventType::Normal, reason, action, note.into())
            .await;
    }

    /// Publish a Warning event on `obj`
    pub async fn warning<K>(&self, obj: &K, reason: &str, action: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(obj.object_ref(&()), EventType::Warning, reason, action, note.into())
            .await;
    }

    async fn publish(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&reference, type_, reason, action, Some(note))
            .await;
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(health) = &self.health {
            health.metrics.record_reconcile(namespace, name, duration_secs);
        }
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        if let Some(health) = &self.health {
            health.metrics.record_error(namespace, name);
        }
    }
}
