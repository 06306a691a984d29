//! Reconciliation entry point for Elasticsearch objects
//!
//! Dispatches each observation to the create, update or termination path.
//! Objects from the watch cache are never mutated; every change goes out as
//! a patch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::Context;
use crate::controller::create::{create, needs_create};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::termination::terminate;
use crate::controller::update::update;
use crate::crd::Elasticsearch;

/// Finalizer guarding the termination policy of Elasticsearch objects
pub const FINALIZER: &str = "kubedb.com/elasticsearch";

/// Finalizer on dormant records
pub const DORMANT_FINALIZER: &str = "kubedb.com/dormant-database";

/// Main reconciliation function
#[instrument(skip(db, ctx), fields(name = %db.name_any(), namespace = db.namespace().unwrap_or_default()))]
pub async fn reconcile(db: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = db.namespace().unwrap_or_default();
    let name = db.name_any();

    let guard = ctx.locks.lock(&ns, &name).await;
    let result = reconcile_locked(&db, &ctx).await;
    drop(guard);

    match &result {
        Ok(_) => {
            ctx.record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
            if db.metadata.deletion_timestamp.is_some() {
                ctx.locks.forget(&ns, &name);
            }
        }
        Err(e) => {
            ctx.record_error(&ns, &name);
            error!(error = %e, "reconciliation failed");
        }
    }
    result
}

async fn reconcile_locked(db: &Elasticsearch, ctx: &Context) -> Result<Action> {
    if db.metadata.deletion_timestamp.is_some() {
        if !has_finalizer(db) {
            debug!("deleted without finalizer");
            return Ok(Action::await_change());
        }
        return terminate(db, ctx).await;
    }

    if !has_finalizer(db) {
        add_finalizer(db, ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if needs_create(db) {
        info!("creating Elasticsearch");
        create(db, ctx).await
    } else {
        update(db, ctx).await
    }
}

fn has_finalizer(db: &Elasticsearch) -> bool {
    db.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(db: &Elasticsearch, ctx: &Context) -> Result<()> {
    let mut finalizers = db.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    ctx.client
        .set_elasticsearch_finalizers(&db.namespace().unwrap_or_default(), &db.name_any(), finalizers)
        .await
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(db: Arc<Elasticsearch>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = db.name_any();
    // The runtime does not expose a retry count, so every failure starts the curve
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(%name, %error, ?delay, "retryable error, requeuing");
    } else {
        error!(%name, %error, ?delay, "non-retryable error, requeuing for manual intervention");
    }
    Action::requeue(delay)
}
