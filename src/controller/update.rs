//! Update path for created Elasticsearch objects
//!
//! The spec recorded after the last successful reconcile is diffed against
//! the current one and only the affected sub-procedures run.

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::create::{
    RUNNING_REQUEUE, record_applied_spec, report_failure, schedule_backups, sync_node_groups,
};
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::state_machine::{LifecycleEvent, TransitionContext};
use crate::controller::status::StatusManager;
use crate::controller::validation::{SpecDiff, validate, validate_spec_change};
use crate::crd::{DatabasePhase, Elasticsearch, ElasticsearchSpec};
use crate::resources::common::ANNOTATION_LAST_APPLIED;
use crate::resources::{certificate, monitor, pdb, security, service, topology};

/// Spec recorded by the last successful reconcile
pub fn last_applied_spec(db: &Elasticsearch) -> Result<ElasticsearchSpec> {
    let raw = db
        .annotations()
        .get(ANNOTATION_LAST_APPLIED)
        .ok_or(Error::MissingObjectKey(ANNOTATION_LAST_APPLIED))?;
    Ok(serde_json::from_str(raw)?)
}

/// Diff that re-runs every sub-procedure, used to recover a failed database
fn full_resync() -> SpecDiff {
    SpecDiff {
        service_template_changed: true,
        node_groups_changed: true,
        security_changed: true,
        monitor_changed: true,
        backup_schedule_changed: true,
        termination_policy_changed: false,
    }
}

/// Converge `db` on its current spec
pub async fn update(db: &Elasticsearch, ctx: &Context) -> Result<Action> {
    let mut status = StatusManager::new(db, ctx);
    match run(db, ctx, &mut status).await {
        Ok(action) => Ok(action),
        Err(e) => {
            report_failure(db, ctx, &mut status, &e, actions::UPDATE).await;
            Err(e)
        }
    }
}

async fn run(db: &Elasticsearch, ctx: &Context, status: &mut StatusManager<'_>) -> Result<Action> {
    let client = ctx.client.as_ref();
    let old = last_applied_spec(db)?;
    let mut diff = validate_spec_change(&old, &db.spec)?;
    let failed = status.phase() == DatabasePhase::Failed;

    if !diff.has_changes() && !failed {
        debug!("spec unchanged");
        // The registry is in memory and empty after an operator restart
        schedule_backups(db, ctx).await;
        return Ok(Action::requeue(RUNNING_REQUEUE));
    }
    if failed {
        diff = full_resync();
    }
    info!(?diff, "spec changed");

    let version = validate(client, db).await?;
    ctx.normal(
        db,
        reasons::SUCCESSFUL_VALIDATE,
        actions::UPDATE,
        "Successfully validated Elasticsearch",
    )
    .await;

    if diff.service_template_changed {
        service::ensure_services(client, db).await?;
    }

    let distribution = version.spec.distribution;
    if diff.security_changed {
        if !db.spec.disable_security {
            certificate::ensure_cert_secrets(client, db, distribution).await?;
        }
        security::ensure_default_config(client, db, distribution).await?;
    }

    if diff.requires_statefulset_sync() {
        let plans = topology::plan(db, &topology::parse_version(&version.spec.version)?)?;
        sync_node_groups(db, ctx, &version, &plans).await?;
        pdb::ensure_pdbs(client, db, &plans).await?;
    }

    if diff.backup_schedule_changed {
        schedule_backups(db, ctx).await;
    }

    if diff.monitor_changed {
        if let Err(e) =
            monitor::update_monitor(client, db, old.monitor.as_ref(), &ctx.config).await
        {
            warn!(error = %e, "failed to update monitoring");
            ctx.warning(
                db,
                reasons::FAILED,
                actions::UPDATE,
                format!("Failed to update monitoring system. Reason: {}", e),
            )
            .await;
        }
    }

    if failed {
        let tctx = TransitionContext::new(db.spec.termination_policy).ready();
        status
            .transition(LifecycleEvent::ResourcesReady, &tctx)
            .await?;
    }

    ctx.normal(
        db,
        reasons::SUCCESSFUL,
        actions::UPDATE,
        "Successfully updated Elasticsearch",
    )
    .await;
    record_applied_spec(db, ctx).await?;
    Ok(Action::requeue(RUNNING_REQUEUE))
}
