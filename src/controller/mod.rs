pub mod config;
pub mod context;
pub mod create;
pub mod dormant;
pub mod error;
pub mod events;
pub mod locks;
pub mod reconciler;
pub mod scheduler;
pub mod state_machine;
pub mod status;
pub mod termination;
pub mod update;
pub mod validation;

pub use config::OperatorConfig;
pub use context::Context;
pub use dormant::{dormant_error_policy, reconcile_dormant};
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use reconciler::{DORMANT_FINALIZER, FINALIZER, error_policy, reconcile};
pub use scheduler::BackupScheduler;
pub use state_machine::{DatabaseStateMachine, LifecycleEvent, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager};
pub use validation::{SpecDiff, validate, validate_spec, validate_spec_change};
