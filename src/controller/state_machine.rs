//! Finite state machine for the database lifecycle
//!
//! Every phase written to the status of an Elasticsearch object or of its
//! dormant record goes through [`DatabaseStateMachine::transition`]. The
//! table below is the complete set of legal moves; anything else is
//! reported as an invalid transition and the phase is left alone.

use std::fmt;

use crate::crd::{DatabasePhase, TerminationPolicy};

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The create path started (first observation, or a retry after failure)
    CreateStarted,
    /// StatefulSets are ready and the settle delay has passed
    ResourcesReady,
    /// A snapshot restore is about to run
    InitStarted,
    /// The restore job finished, whatever its outcome
    InitFinished,
    /// Validation or reconciliation failed
    ReconcileError,
    /// The deletion timestamp is set on the object
    DeletionRequested,
    /// A `DoNotTerminate` deletion was reverted
    DeletionReverted,
    /// Compute was removed and a dormant record written
    Halted,
    /// Data removal started
    WipeOutStarted,
    /// Data removal finished
    WipedOut,
    /// A dormant record was claimed by a new object
    ResumeRequested,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::CreateStarted => write!(f, "CreateStarted"),
            LifecycleEvent::ResourcesReady => write!(f, "ResourcesReady"),
            LifecycleEvent::InitStarted => write!(f, "InitStarted"),
            LifecycleEvent::InitFinished => write!(f, "InitFinished"),
            LifecycleEvent::ReconcileError => write!(f, "ReconcileError"),
            LifecycleEvent::DeletionRequested => write!(f, "DeletionRequested"),
            LifecycleEvent::DeletionReverted => write!(f, "DeletionReverted"),
            LifecycleEvent::Halted => write!(f, "Halted"),
            LifecycleEvent::WipeOutStarted => write!(f, "WipeOutStarted"),
            LifecycleEvent::WipedOut => write!(f, "WipedOut"),
            LifecycleEvent::ResumeRequested => write!(f, "ResumeRequested"),
        }
    }
}

/// Facts the guards look at
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Every StatefulSet of the database reports all replicas ready
    pub statefulsets_ready: bool,
    /// `spec.init.snapshotSource` is set
    pub has_snapshot_source: bool,
    pub termination_policy: TerminationPolicy,
    pub error_message: Option<String>,
}

impl TransitionContext {
    pub fn new(termination_policy: TerminationPolicy) -> Self {
        Self {
            statefulsets_ready: false,
            has_snapshot_source: false,
            termination_policy,
            error_message: None,
        }
    }

    pub fn ready(mut self) -> Self {
        self.statefulsets_ready = true;
        self
    }

    pub fn with_snapshot_source(mut self) -> Self {
        self.has_snapshot_source = true;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: DatabasePhase,
    pub to: DatabasePhase,
    pub event: LifecycleEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: DatabasePhase,
        to: DatabasePhase,
        event: LifecycleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: DatabasePhase,
        to: DatabasePhase,
        event: LifecycleEvent,
        description: &'static str,
    },
    /// No transition for this event out of the current phase
    InvalidTransition {
        current: DatabasePhase,
        event: LifecycleEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: DatabasePhase,
        to: DatabasePhase,
        event: LifecycleEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase of a successful transition
    pub fn target(&self) -> Option<DatabasePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Lifecycle state machine shared by Elasticsearch objects and dormant records
pub struct DatabaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DatabaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseStateMachine {
    pub fn new() -> Self {
        use DatabasePhase::*;
        use LifecycleEvent as E;

        Self {
            transitions: vec![
                // === Pending ===
                Transition::new(Pending, Creating, E::CreateStarted, "Starting creation"),
                Transition::new(
                    Pending,
                    Terminating,
                    E::DeletionRequested,
                    "Deleted before creation started",
                ),
                // === Creating ===
                Transition::new(
                    Creating,
                    Initializing,
                    E::InitStarted,
                    "Restoring data from a snapshot",
                ),
                Transition::new(
                    Creating,
                    Running,
                    E::ResourcesReady,
                    "All node groups are ready",
                ),
                Transition::new(Creating, Failed, E::ReconcileError, "Creation failed"),
                Transition::new(
                    Creating,
                    Terminating,
                    E::DeletionRequested,
                    "Deleted during creation",
                ),
                // === Initializing ===
                Transition::new(
                    Initializing,
                    Running,
                    E::InitFinished,
                    "Initialization finished",
                ),
                Transition::new(
                    Initializing,
                    Failed,
                    E::ReconcileError,
                    "Initialization could not be started",
                ),
                Transition::new(
                    Initializing,
                    Terminating,
                    E::DeletionRequested,
                    "Deleted during initialization",
                ),
                // === Running ===
                Transition::new(Running, Failed, E::ReconcileError, "Update failed"),
                Transition::new(
                    Running,
                    Terminating,
                    E::DeletionRequested,
                    "Deletion requested",
                ),
                // === Failed ===
                Transition::new(Failed, Creating, E::CreateStarted, "Retrying creation"),
                Transition::new(
                    Failed,
                    Running,
                    E::ResourcesReady,
                    "Recovered after a successful reconciliation",
                ),
                Transition::new(
                    Failed,
                    Terminating,
                    E::DeletionRequested,
                    "Deleted while failed",
                ),
                // === Terminating ===
                Transition::new(
                    Terminating,
                    Running,
                    E::DeletionReverted,
                    "Deletion reverted by the termination policy",
                ),
                Transition::new(
                    Terminating,
                    Halted,
                    E::Halted,
                    "Compute removed, data kept in a dormant record",
                ),
                Transition::new(
                    Terminating,
                    WipingOut,
                    E::WipeOutStarted,
                    "Removing all data",
                ),
                // === Halted (dormant records) ===
                Transition::new(
                    Halted,
                    Resuming,
                    E::ResumeRequested,
                    "Dormant database claimed by a new object",
                ),
                Transition::new(Halted, WipingOut, E::WipeOutStarted, "Wipe-out requested"),
                Transition::new(Halted, Failed, E::ReconcileError, "Dormant record failed"),
                // === Resuming ===
                Transition::new(Resuming, Failed, E::ReconcileError, "Resume failed"),
                // === WipingOut ===
                Transition::new(WipingOut, WipedOut, E::WipedOut, "All data removed"),
                Transition::new(WipingOut, Failed, E::ReconcileError, "Wipe-out failed"),
                // WipedOut is terminal
            ],
        }
    }

    /// Attempt to transition out of `current` on `event`
    pub fn transition(
        &self,
        current: &DatabasePhase,
        event: LifecycleEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition exists (ignoring guards)
    pub fn can_transition(&self, from: &DatabasePhase, event: &LifecycleEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// All events with a transition out of `state`
    pub fn valid_events(&self, state: &DatabasePhase) -> Vec<&LifecycleEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.from, &transition.event) {
            (DatabasePhase::Creating, LifecycleEvent::ResourcesReady)
            | (DatabasePhase::Failed, LifecycleEvent::ResourcesReady) => {
                if !ctx.statefulsets_ready {
                    Some("StatefulSets are not ready".to_string())
                } else if ctx.has_snapshot_source && transition.from == DatabasePhase::Creating {
                    Some("snapshot source must be restored first".to_string())
                } else {
                    None
                }
            }
            (DatabasePhase::Creating, LifecycleEvent::InitStarted) => {
                if !ctx.has_snapshot_source {
                    Some("no snapshot source to restore".to_string())
                } else if !ctx.statefulsets_ready {
                    Some("StatefulSets are not ready".to_string())
                } else {
                    None
                }
            }
            (DatabasePhase::Terminating, LifecycleEvent::DeletionReverted) => {
                policy_guard(ctx, TerminationPolicy::DoNotTerminate)
            }
            (DatabasePhase::Terminating, LifecycleEvent::Halted) => {
                policy_guard(ctx, TerminationPolicy::Halt)
            }
            (DatabasePhase::Terminating, LifecycleEvent::WipeOutStarted) => {
                policy_guard(ctx, TerminationPolicy::WipeOut)
            }
            _ => None,
        }
    }
}

fn policy_guard(ctx: &TransitionContext, required: TerminationPolicy) -> Option<String> {
    if ctx.termination_policy == required {
        None
    } else {
        Some(format!(
            "termination policy is {}, not {}",
            ctx.termination_policy, required
        ))
    }
}

/// Event describing how the deletion of an object resolves under its policy
///
/// `Delete` has no phase of its own: the object is gone once its finalizer
/// is released.
pub fn termination_event(policy: TerminationPolicy) -> Option<LifecycleEvent> {
    match policy {
        TerminationPolicy::DoNotTerminate => Some(LifecycleEvent::DeletionReverted),
        TerminationPolicy::Halt => Some(LifecycleEvent::Halted),
        TerminationPolicy::WipeOut => Some(LifecycleEvent::WipeOutStarted),
        TerminationPolicy::Delete => None,
    }
}
