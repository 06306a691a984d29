//! Reconciliation of DormantDatabase records
//!
//! A record is written when an Elasticsearch object is deleted under the
//! `Halt` policy. Setting `spec.resume` recreates the object from the
//! recorded origin and removes the record; setting `spec.wipeOut` deletes the
//! retained PVCs, secrets and snapshots.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::reconciler::DORMANT_FINALIZER;
use crate::controller::state_machine::{DatabaseStateMachine, LifecycleEvent, TransitionContext};
use crate::controller::termination::wipe_out_data;
use crate::crd::{DatabasePhase, DormantDatabase, DormantDatabaseStatus, Elasticsearch};

/// Reconcile a dormant record
#[instrument(skip(dormant, ctx), fields(name = %dormant.name_any(), namespace = dormant.namespace().unwrap_or_default()))]
pub async fn reconcile_dormant(dormant: Arc<DormantDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = dormant.namespace().unwrap_or_default();
    let name = dormant.name_any();
    let _guard = ctx.locks.lock(&ns, &name).await;

    let result = reconcile_locked(&dormant, &ctx).await;
    match &result {
        Ok(_) => ctx.record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
        Err(_) => ctx.record_error(&ns, &name),
    }
    result
}

async fn reconcile_locked(dormant: &DormantDatabase, ctx: &Context) -> Result<Action> {
    let ns = dormant.namespace().unwrap_or_default();
    let name = dormant.name_any();

    if dormant.metadata.deletion_timestamp.is_some() {
        debug!("dormant database deleted, releasing finalizer");
        release_finalizer(dormant, ctx).await?;
        return Ok(Action::await_change());
    }

    if !dormant.finalizers().iter().any(|f| f == DORMANT_FINALIZER) {
        let mut finalizers = dormant.finalizers().to_vec();
        finalizers.push(DORMANT_FINALIZER.to_string());
        ctx.client
            .set_dormant_database_finalizers(&ns, &name, finalizers)
            .await?;
    }

    let mut status = dormant.status.clone().unwrap_or_default();
    if status.phase == DatabasePhase::Pending {
        status.phase = DatabasePhase::Halted;
        status.halted_time = Some(Utc::now().to_rfc3339());
        ctx.client
            .patch_dormant_database_status(&ns, &name, &status)
            .await?;
    }

    let result = if dormant.spec.wipe_out {
        wipe_out(dormant, ctx, status).await
    } else if dormant.spec.resume {
        resume(dormant, ctx, status).await
    } else {
        Ok(Action::await_change())
    };

    if let Err(e) = &result {
        if !matches!(e, Error::Cancelled) {
            fail(dormant, ctx, e).await;
        }
    }
    result
}

/// Phase after `event`, if the lifecycle allows it
fn next_phase(phase: DatabasePhase, event: LifecycleEvent) -> Option<DatabasePhase> {
    // Dormant records have no termination policy of their own
    let tctx = TransitionContext::new(Default::default());
    DatabaseStateMachine::new()
        .transition(&phase, event, &tctx)
        .target()
}

async fn advance(
    dormant: &DormantDatabase,
    ctx: &Context,
    status: &mut DormantDatabaseStatus,
    event: LifecycleEvent,
) -> Result<bool> {
    let Some(to) = next_phase(status.phase, event) else {
        return Ok(false);
    };
    info!(from = %status.phase, %to, %event, "dormant database transition");
    status.phase = to;
    status.reason = None;
    if to == DatabasePhase::WipedOut {
        status.wiped_out_time = Some(Utc::now().to_rfc3339());
    }
    ctx.client
        .patch_dormant_database_status(
            &dormant.namespace().unwrap_or_default(),
            &dormant.name_any(),
            status,
        )
        .await?;
    Ok(true)
}

async fn wipe_out(
    dormant: &DormantDatabase,
    ctx: &Context,
    mut status: DormantDatabaseStatus,
) -> Result<Action> {
    if status.phase == DatabasePhase::WipedOut {
        return Ok(Action::await_change());
    }
    advance(dormant, ctx, &mut status, LifecycleEvent::WipeOutStarted).await?;
    if status.phase != DatabasePhase::WipingOut {
        return Err(Error::ValidationError(format!(
            "DormantDatabase \"{}\" cannot be wiped out in phase {}",
            dormant.name_any(),
            status.phase
        )));
    }

    wipe_out_data(
        ctx.client.as_ref(),
        &dormant.namespace().unwrap_or_default(),
        &dormant.name_any(),
        &dormant.spec.origin.spec,
    )
    .await?;
    advance(dormant, ctx, &mut status, LifecycleEvent::WipedOut).await?;
    ctx.normal(
        dormant,
        reasons::WIPED_OUT,
        actions::WIPE_OUT,
        "Removed all data of the dormant database",
    )
    .await;
    Ok(Action::await_change())
}

async fn resume(
    dormant: &DormantDatabase,
    ctx: &Context,
    mut status: DormantDatabaseStatus,
) -> Result<Action> {
    let ns = dormant.namespace().unwrap_or_default();
    let name = dormant.name_any();

    if status.phase != DatabasePhase::Resuming {
        advance(dormant, ctx, &mut status, LifecycleEvent::ResumeRequested).await?;
        if status.phase != DatabasePhase::Resuming {
            return Err(Error::ValidationError(format!(
                "DormantDatabase \"{}\" cannot be resumed in phase {}",
                name, status.phase
            )));
        }
    }

    // A claiming object may already exist; otherwise recreate it from the origin
    if ctx.client.get_elasticsearch(&ns, &name).await?.is_none() {
        let origin = &dormant.spec.origin;
        let db = Elasticsearch {
            metadata: ObjectMeta {
                name: Some(origin.name.clone()),
                namespace: Some(origin.namespace.clone()),
                labels: Some(origin.labels.clone()).filter(|l| !l.is_empty()),
                annotations: Some(origin.annotations.clone()).filter(|a| !a.is_empty()),
                ..Default::default()
            },
            spec: origin.spec.clone(),
            status: None,
        };
        match ctx.client.create_elasticsearch(&db).await {
            Ok(_) | Err(Error::AlreadyExists(_)) => info!("recreated Elasticsearch from origin"),
            Err(e) => return Err(e),
        }
    }

    ctx.normal(
        dormant,
        reasons::RESUMED,
        actions::RESUME,
        format!("Resumed Elasticsearch \"{}\"", name),
    )
    .await;
    release_finalizer(dormant, ctx).await?;
    ctx.client.delete_dormant_database(&ns, &name).await?;
    Ok(Action::await_change())
}

async fn release_finalizer(dormant: &DormantDatabase, ctx: &Context) -> Result<()> {
    let remaining: Vec<String> = dormant
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != DORMANT_FINALIZER)
        .cloned()
        .collect();
    match ctx
        .client
        .set_dormant_database_finalizers(
            &dormant.namespace().unwrap_or_default(),
            &dormant.name_any(),
            remaining,
        )
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

async fn fail(dormant: &DormantDatabase, ctx: &Context, error: &Error) {
    warn!(error = %error, "dormant database reconciliation failed");
    ctx.warning(dormant, reasons::FAILED, actions::UPDATE, error.to_string())
        .await;

    let mut status = dormant.status.clone().unwrap_or_default();
    let phase = next_phase(status.phase, LifecycleEvent::ReconcileError).unwrap_or(status.phase);
    status.phase = phase;
    status.reason = Some(error.to_string());
    if let Err(e) = ctx
        .client
        .patch_dormant_database_status(
            &dormant.namespace().unwrap_or_default(),
            &dormant.name_any(),
            &status,
        )
        .await
    {
        warn!(error = %e, "failed to record dormant database failure");
    }
}

/// Error policy for the dormant controller
pub fn dormant_error_policy(dormant: Arc<DormantDatabase>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    if error.is_retryable() {
        warn!(name = %dormant.name_any(), %error, ?delay, "retryable dormant database error");
    } else {
        error!(name = %dormant.name_any(), %error, ?delay, "dormant database needs manual intervention");
    }
    Action::requeue(delay)
}
