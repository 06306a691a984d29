//! Status and conditions management for Elasticsearch objects
//!
//! Phases only change through the lifecycle state machine. The manager keeps
//! its own copy of the status so several transitions within one reconcile
//! see each other.

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{
    DatabaseStateMachine, LifecycleEvent, TransitionContext, TransitionResult,
};
use crate::crd::{Condition, DatabasePhase, Elasticsearch, ElasticsearchStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Database accepts connections
    pub const READY: &str = "Ready";
    /// Database is moving towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Last reconciliation failed
    pub const DEGRADED: &str = "Degraded";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            bool_status(is_degraded),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Status manager for one Elasticsearch object
pub struct StatusManager<'a> {
    db: &'a Elasticsearch,
    ctx: &'a Context,
    status: ElasticsearchStatus,
    machine: DatabaseStateMachine,
}

impl<'a> StatusManager<'a> {
    pub fn new(db: &'a Elasticsearch, ctx: &'a Context) -> Self {
        Self {
            db,
            ctx,
            status: db.status.clone().unwrap_or_default(),
            machine: DatabaseStateMachine::new(),
        }
    }

    pub fn phase(&self) -> DatabasePhase {
        self.status.phase
    }

    pub fn status(&self) -> &ElasticsearchStatus {
        &self.status
    }

    /// Apply `event` and persist the new phase
    ///
    /// Invalid or guarded transitions leave the phase unchanged and return
    /// `None`.
    pub async fn transition(
        &mut self,
        event: LifecycleEvent,
        tctx: &TransitionContext,
    ) -> Result<Option<DatabasePhase>> {
        match self.machine.transition(&self.status.phase, event, tctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(%from, %to, %event, "{}", description);
                self.status = self.next_status(to, tctx.error_message.as_deref());
                self.persist().await?;
                Ok(Some(to))
            }
            TransitionResult::InvalidTransition { current, event } => {
                debug!(%current, %event, "no transition");
                Ok(None)
            }
            TransitionResult::GuardFailed {
                from, to, reason, ..
            } => {
                debug!(%from, %to, %reason, "transition guard failed");
                Ok(None)
            }
        }
    }

    /// Record a failure, moving to Failed when the machine allows it
    pub async fn fail(&mut self, message: &str) -> Result<()> {
        let tctx = TransitionContext::new(self.db.spec.termination_policy).with_error(message);
        if self.status.phase == DatabasePhase::Failed {
            if self.status.reason.as_deref() != Some(message) {
                self.status = self.next_status(DatabasePhase::Failed, Some(message));
                self.persist().await?;
            }
            return Ok(());
        }
        self.transition(LifecycleEvent::ReconcileError, &tctx)
            .await
            .map(|_| ())
    }

    async fn persist(&self) -> Result<()> {
        self.ctx
            .client
            .patch_elasticsearch_status(
                &self.db.namespace().unwrap_or_default(),
                &self.db.name_any(),
                &self.status,
            )
            .await
    }

    fn next_status(&self, phase: DatabasePhase, error: Option<&str>) -> ElasticsearchStatus {
        let generation = self.db.metadata.generation;
        let builder =
            ConditionBuilder::from_existing(self.status.conditions.clone(), generation);

        let conditions = match phase {
            DatabasePhase::Creating => builder
                .ready(false, "Creating", "Database is being created")
                .progressing(true, "CreatingResources", "Creating database resources")
                .degraded(false, "NotApplicable", "Database is being created"),
            DatabasePhase::Initializing => builder
                .ready(false, "Initializing", "Restoring data from a snapshot")
                .progressing(true, "Restoring", "Restore job is running"),
            DatabasePhase::Running => builder
                .ready(true, "DatabaseReady", "All node groups are ready")
                .progressing(false, "Stable", "Database is stable")
                .degraded(false, "Healthy", "Database is healthy"),
            DatabasePhase::Failed => {
                let message = error.unwrap_or("reconciliation failed");
                builder
                    .ready(false, "Failed", message)
                    .progressing(false, "Failed", message)
                    .degraded(true, "ReconcileError", message)
            }
            _ => builder
                .ready(false, "Terminating", "Database is being deleted")
                .progressing(true, "Terminating", "Termination policy in progress"),
        }
        .build();

        let creation_time = self
            .status
            .creation_time
            .clone()
            .or_else(|| (phase == DatabasePhase::Creating).then(|| Utc::now().to_rfc3339()));

        ElasticsearchStatus {
            phase,
            creation_time,
            reason: (phase == DatabasePhase::Failed)
                .then(|| error.unwrap_or_default().to_string()),
            observed_generation: generation,
            conditions,
        }
    }
}
