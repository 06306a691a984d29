//! Create path for Elasticsearch objects
//!
//! Runs on first observation and again after a failed creation. Every step
//! is idempotent, so a retry converges on the objects the previous attempt
//! left behind instead of duplicating them.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::state_machine::{LifecycleEvent, TransitionContext};
use crate::controller::status::StatusManager;
use crate::controller::validation::validate;
use crate::crd::{
    DatabasePhase, DormantDatabase, Elasticsearch, ElasticsearchVersion, InitSpec,
};
use crate::resources::common::{
    ANNOTATION_INIT_SPEC, ANNOTATION_LAST_APPLIED, KIND, LABEL_KIND, Verb, object_meta,
};
use crate::resources::restore::{self, JobOutcome};
use crate::resources::topology::{self, NodeGroupPlan};
use crate::resources::{certificate, monitor, pdb, rbac, secret, security, service, statefulset};

/// Requeue interval once a database is running
pub const RUNNING_REQUEUE: Duration = Duration::from_secs(300);

/// Whether `db` still has to go through the create path
pub fn needs_create(db: &Elasticsearch) -> bool {
    let created = db
        .status
        .as_ref()
        .is_some_and(|s| s.creation_time.is_some());
    !created || !db.annotations().contains_key(ANNOTATION_LAST_APPLIED)
}

/// Create every object of `db` and drive it to Running
pub async fn create(db: &Elasticsearch, ctx: &Context) -> Result<Action> {
    let mut status = StatusManager::new(db, ctx);
    match run(db, ctx, &mut status).await {
        Ok(action) => Ok(action),
        Err(e) => {
            report_failure(db, ctx, &mut status, &e, actions::CREATE).await;
            Err(e)
        }
    }
}

async fn run(db: &Elasticsearch, ctx: &Context, status: &mut StatusManager<'_>) -> Result<Action> {
    let client = ctx.client.as_ref();
    let tctx = TransitionContext::new(db.spec.termination_policy);

    status.transition(LifecycleEvent::CreateStarted, &tctx).await?;

    let version = validate(client, db).await?;
    ctx.normal(
        db,
        reasons::SUCCESSFUL_VALIDATE,
        actions::CREATE,
        "Successfully validated Elasticsearch",
    )
    .await;

    if match_dormant(db, ctx).await? {
        info!("resuming from dormant database");
    }

    ctx.normal(db, reasons::CREATING, actions::CREATE, "Creating Kubernetes objects")
        .await;

    if ctx.config.enable_rbac {
        rbac::ensure_rbac(client, db).await?;
    }
    service::ensure_services(client, db).await?;

    let distribution = version.spec.distribution;
    if !db.spec.disable_security {
        certificate::ensure_cert_secrets(client, db, distribution).await?;
    }
    secret::ensure_database_secret(client, db, distribution, ctx.config.password_length).await?;
    security::ensure_default_config(client, db, distribution).await?;

    let plans = topology::plan(db, &topology::parse_version(&version.spec.version)?)?;
    let changed = sync_node_groups(db, ctx, &version, &plans).await?;
    pdb::ensure_pdbs(client, db, &plans).await?;
    if changed {
        settle(ctx).await?;
    }

    let mut ready = tctx.ready();
    if db.spec.init.as_ref().is_some_and(|i| i.snapshot_source.is_some()) {
        ready = ready.with_snapshot_source();
        status.transition(LifecycleEvent::InitStarted, &ready).await?;
        if status.phase() == DatabasePhase::Initializing {
            initialize(db, ctx, &version).await?;
            status.transition(LifecycleEvent::InitFinished, &ready).await?;
        }
    } else {
        status.transition(LifecycleEvent::ResourcesReady, &ready).await?;
    }

    ctx.normal(
        db,
        reasons::SUCCESSFUL,
        actions::CREATE,
        "Successfully created Elasticsearch",
    )
    .await;

    schedule_backups(db, ctx).await;
    if db.spec.monitor.is_some() {
        if let Err(e) = monitor::ensure_monitor(client, db, &ctx.config).await {
            warn!(error = %e, "failed to add monitoring");
            ctx.warning(
                db,
                reasons::FAILED,
                actions::CREATE,
                format!("Failed to add monitoring system. Reason: {}", e),
            )
            .await;
        }
    }

    record_applied_spec(db, ctx).await?;
    Ok(Action::requeue(RUNNING_REQUEUE))
}

/// Ensure one StatefulSet per node group and wait for each to be ready
///
/// Returns true when any StatefulSet was created or patched.
pub(crate) async fn sync_node_groups(
    db: &Elasticsearch,
    ctx: &Context,
    version: &ElasticsearchVersion,
    plans: &[NodeGroupPlan],
) -> Result<bool> {
    let client = ctx.client.as_ref();
    let ns = db.namespace().unwrap_or_default();
    let mut changed = false;

    for plan in plans {
        let desired = statefulset::generate_statefulset(db, plan, version, &ctx.config)?;
        let verb = statefulset::ensure_statefulset(client, db, &desired).await?;
        changed |= verb != Verb::Unchanged;

        statefulset::wait_for_ready(
            client,
            &ns,
            &plan.statefulset_name,
            plan.replicas,
            ctx.config.readiness_poll_interval,
            ctx.config.readiness_timeout,
            &ctx.cancel,
        )
        .await?;
        debug!(statefulset = %plan.statefulset_name, %verb, "node group ready");
    }
    Ok(changed)
}

/// Give freshly started nodes time to form a cluster
async fn settle(ctx: &Context) -> Result<()> {
    if ctx.config.settle_delay.is_zero() {
        return Ok(());
    }
    debug!(delay = ?ctx.config.settle_delay, "waiting for nodes to join");
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(ctx.config.settle_delay) => Ok(()),
    }
}

/// Claim a dormant record with the same name, if there is one
///
/// Returns true when a record was found and marked for resume. A record of
/// another kind, a mismatching init annotation or a diverging origin spec is
/// a conflict and nothing is adopted.
pub async fn match_dormant(db: &Elasticsearch, ctx: &Context) -> Result<bool> {
    let ns = db.namespace().unwrap_or_default();
    let name = db.name_any();
    let Some(dormant) = ctx.client.get_dormant_database(&ns, &name).await? else {
        return Ok(false);
    };

    check_dormant_compatible(db, &dormant)?;

    if !dormant.spec.resume {
        let mut spec = dormant.spec.clone();
        spec.resume = true;
        ctx.client
            .patch_dormant_database_spec(&ns, &name, &spec)
            .await?;
    }
    Ok(true)
}

/// Resume rules for a dormant record claimed by `db`
pub fn check_dormant_compatible(db: &Elasticsearch, dormant: &DormantDatabase) -> Result<()> {
    let name = db.name_any();
    let conflict = |reason: &str| {
        Err(Error::ConflictError(format!(
            "Elasticsearch \"{}\" cannot resume DormantDatabase \"{}\": {}",
            name,
            dormant.name_any(),
            reason
        )))
    };

    if dormant.labels().get(LABEL_KIND).map(String::as_str) != Some(KIND) {
        return conflict("it belongs to a different kind");
    }
    let phase = dormant.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if dormant.spec.wipe_out
        || matches!(phase, DatabasePhase::WipingOut | DatabasePhase::WipedOut)
    {
        return conflict("its data is wiped out");
    }

    if let Some(raw) = dormant
        .annotations()
        .get(ANNOTATION_INIT_SPEC)
        .filter(|raw| !raw.is_empty())
    {
        let recorded: InitSpec = serde_json::from_str(raw)?;
        if db.spec.init.as_ref().is_some_and(|init| *init != recorded) {
            return conflict("init spec mismatches the recorded one");
        }
    }

    if dormant.spec.origin.spec != db.spec.without_init() {
        return conflict("spec mismatches the origin spec");
    }
    Ok(())
}

/// Restore data from the snapshot named in `spec.init`
///
/// Restore failures are reported as events only; the database still moves
/// to Running afterwards.
async fn initialize(db: &Elasticsearch, ctx: &Context, version: &ElasticsearchVersion) -> Result<()> {
    let Some(source) = db.spec.init.as_ref().and_then(|i| i.snapshot_source.as_ref()) else {
        return Ok(());
    };
    ctx.normal(
        db,
        reasons::INITIALIZING,
        actions::INITIALIZE,
        format!("Initializing from Snapshot: \"{}\"", source.name),
    )
    .await;

    match restore_from_snapshot(db, ctx, version).await {
        Ok(JobOutcome::Succeeded) => {
            ctx.normal(
                db,
                reasons::SUCCESSFUL_INITIALIZE,
                actions::INITIALIZE,
                "Successfully completed initialization",
            )
            .await;
            Ok(())
        }
        Ok(outcome) => {
            warn!(?outcome, "restore job did not succeed");
            ctx.warning(
                db,
                reasons::FAILED_TO_INITIALIZE,
                actions::INITIALIZE,
                format!("Failed to complete initialization: restore job {:?}", outcome),
            )
            .await;
            Ok(())
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!(error = %e, "initialization failed");
            ctx.warning(
                db,
                reasons::FAILED_TO_INITIALIZE,
                actions::INITIALIZE,
                format!("Failed to initialize. Reason: {}", e),
            )
            .await;
            Ok(())
        }
    }
}

async fn restore_from_snapshot(
    db: &Elasticsearch,
    ctx: &Context,
    version: &ElasticsearchVersion,
) -> Result<JobOutcome> {
    let client = ctx.client.as_ref();
    let ns = db.namespace().unwrap_or_default();
    let source = db
        .spec
        .init
        .as_ref()
        .and_then(|i| i.snapshot_source.as_ref())
        .ok_or(Error::MissingObjectKey("spec.init.snapshotSource"))?;
    let snapshot_ns = source.namespace.clone().unwrap_or_else(|| ns.clone());

    let snapshot = client
        .get_snapshot(&snapshot_ns, &source.name)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("Snapshot \"{}/{}\"", snapshot_ns, source.name))
        })?;

    ensure_storage_secret(ctx, db, &snapshot_ns, &snapshot.spec.storage_secret_name).await?;

    let job = restore::generate_restore_job(db, version, &snapshot)?;
    restore::ensure_restore_job(client, &job).await?;
    restore::wait_for_job(
        client,
        &ns,
        &job.name_any(),
        ctx.config.readiness_poll_interval,
        ctx.config.restore_timeout,
        &ctx.cancel,
    )
    .await
}

/// Make the snapshot storage secret available in the database namespace
async fn ensure_storage_secret(
    ctx: &Context,
    db: &Elasticsearch,
    snapshot_ns: &str,
    secret_name: &str,
) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    if ctx.client.get_secret(&ns, secret_name).await?.is_some() {
        return Ok(());
    }
    let missing = || Error::NotFound(format!("storage secret \"{}\"", secret_name));
    if snapshot_ns == ns {
        return Err(missing());
    }

    let source = ctx
        .client
        .get_secret(snapshot_ns, secret_name)
        .await?
        .ok_or_else(missing)?;
    let copy = Secret {
        metadata: object_meta(db, secret_name),
        type_: source.type_,
        data: source.data,
        string_data: source.string_data,
        ..Default::default()
    };
    match ctx.client.create_secret(&copy).await {
        Ok(_) | Err(Error::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Start, replace or stop the backup schedule of `db`; failures are events
pub(crate) async fn schedule_backups(db: &Elasticsearch, ctx: &Context) {
    match ctx.scheduler.schedule(db) {
        Ok(true) => {
            ctx.normal(
                db,
                reasons::SCHEDULED,
                actions::BACKUP,
                "Scheduled periodic snapshots",
            )
            .await
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "failed to schedule backups");
            ctx.warning(
                db,
                reasons::FAILED,
                actions::BACKUP,
                format!("Failed to schedule snapshot. Reason: {}", e),
            )
            .await;
        }
    }
}

/// Record the spec just converged on, for diffing on the next update
pub(crate) async fn record_applied_spec(db: &Elasticsearch, ctx: &Context) -> Result<()> {
    let applied = serde_json::to_string(&db.spec)?;
    ctx.client
        .patch_elasticsearch_annotations(
            &db.namespace().unwrap_or_default(),
            &db.name_any(),
            BTreeMap::from([(ANNOTATION_LAST_APPLIED.to_string(), Some(applied))]),
        )
        .await
}

/// Emit a Warning event and move the status to Failed
///
/// Cancellation is a shutdown, not a failure of the database.
pub(crate) async fn report_failure(
    db: &Elasticsearch,
    ctx: &Context,
    status: &mut StatusManager<'_>,
    error: &Error,
    action: &str,
) {
    if matches!(error, Error::Cancelled) {
        return;
    }
    let reason = match error {
        Error::ValidationError(_) | Error::InvalidConfig(_) => reasons::INVALID,
        _ => reasons::FAILED,
    };
    ctx.warning(db, reason, action, error.to_string()).await;
    if let Err(e) = status.fail(&error.to_string()).await {
        warn!(error = %e, "failed to record failure in status");
    }
}
