//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Publishes Kubernetes Events on database objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const CREATING: &str = "Creating";
    pub const SUCCESSFUL_VALIDATE: &str = "SuccessfulValidate";
    pub const INVALID: &str = "Invalid";
    pub const SUCCESSFUL: &str = "Successful";
    pub const FAILED: &str = "Failed";
    pub const INITIALIZING: &str = "Initializing";
    pub const SUCCESSFUL_INITIALIZE: &str = "SuccessfulInitialize";
    pub const FAILED_TO_INITIALIZE: &str = "FailedToInitialize";
    pub const HALTED: &str = "Halted";
    pub const RESUMED: &str = "Resumed";
    pub const WIPED_OUT: &str = "WipedOut";
    pub const RECREATED: &str = "Recreated";
    pub const IGNORED: &str = "Ignored";
    pub const SCHEDULED: &str = "Scheduled";
}

/// Event actions
pub mod actions {
    pub const CREATE: &str = "Create";
    pub const UPDATE: &str = "Update";
    pub const INITIALIZE: &str = "Initialize";
    pub const DELETE: &str = "Delete";
    pub const RESUME: &str = "Resume";
    pub const WIPE_OUT: &str = "WipeOut";
    pub const BACKUP: &str = "Backup";
}
