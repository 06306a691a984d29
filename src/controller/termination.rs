//! Deletion handling per termination policy
//!
//! | policy          | compute | PVCs    | secrets | snapshots | dormant record |
//! |-----------------|---------|---------|---------|-----------|----------------|
//! | DoNotTerminate  | kept    | kept    | kept    | kept      | no (recreated) |
//! | Halt            | removed | kept    | kept    | kept      | yes            |
//! | Delete          | removed | removed | kept    | kept      | no             |
//! | WipeOut         | removed | removed | removed | removed   | no             |

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::reconciler::{DORMANT_FINALIZER, FINALIZER};
use crate::controller::state_machine::{LifecycleEvent, TransitionContext, termination_event};
use crate::controller::status::StatusManager;
use crate::crd::{
    DatabasePhase, DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, Elasticsearch,
    ElasticsearchSpec, Origin, TerminationPolicy,
};
use crate::resources::client::KubeClient;
use crate::resources::common::{
    ANNOTATION_IGNORE, ANNOTATION_INIT_SPEC, ANNOTATION_LAST_APPLIED, is_owned_by,
    selector_string, standard_labels,
};
use crate::resources::monitor;
use crate::resources::secret::security_config_secret_name;
use crate::resources::service::stats_service_name;
use crate::resources::topology::discovery_service_name;

/// Bound on waiting for the deleted object to disappear before recreating it
const RECREATE_TIMEOUT: Duration = Duration::from_secs(30);
const RECREATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Apply the termination policy of `db` and release its finalizer
pub async fn terminate(db: &Elasticsearch, ctx: &Context) -> Result<Action> {
    if let Some(note) = db.annotations().get(ANNOTATION_IGNORE) {
        info!("ignore annotation set, skipping termination policy");
        ctx.normal(db, reasons::IGNORED, actions::DELETE, note.clone())
            .await;
        release_finalizer(db, ctx).await?;
        return Ok(Action::await_change());
    }

    let policy = db.spec.termination_policy;
    let tctx = TransitionContext::new(policy);
    let mut status = StatusManager::new(db, ctx);
    status
        .transition(LifecycleEvent::DeletionRequested, &tctx)
        .await?;
    info!(%policy, "applying termination policy");

    if let Err(e) = apply_policy(db, ctx, &mut status, &tctx).await {
        ctx.warning(
            db,
            reasons::FAILED,
            actions::DELETE,
            format!("Failed to apply termination policy {}. Reason: {}", policy, e),
        )
        .await;
        return Err(e);
    }
    Ok(Action::await_change())
}

async fn apply_policy(
    db: &Elasticsearch,
    ctx: &Context,
    status: &mut StatusManager<'_>,
    tctx: &TransitionContext,
) -> Result<()> {
    let client = ctx.client.as_ref();
    let ns = db.namespace().unwrap_or_default();
    let name = db.name_any();
    let policy = tctx.termination_policy;

    if let Some(event) = termination_event(policy) {
        status.transition(event, tctx).await?;
    }

    // The admission webhook refuses these deletes; this covers clusters
    // where it is not registered
    if policy == TerminationPolicy::DoNotTerminate {
        ctx.warning(
            db,
            reasons::RECREATED,
            actions::DELETE,
            format!("Elasticsearch \"{}\" is locked and will be recreated", name),
        )
        .await;
        release_finalizer(db, ctx).await?;
        return recreate(db, ctx, status).await;
    }

    ctx.scheduler.unschedule(&ns, &name);
    if let Some(spec) = db.spec.monitor.as_ref() {
        if let Err(e) = monitor::remove_monitor(client, db, spec).await {
            warn!(error = %e, "failed to remove monitoring");
        }
    }

    if policy == TerminationPolicy::Halt {
        write_dormant_record(db, ctx).await?;
        ctx.normal(
            db,
            reasons::HALTED,
            actions::DELETE,
            format!("Successfully created DormantDatabase \"{}\"", name),
        )
        .await;
    }

    remove_compute(client, &ns, &name).await?;

    match policy {
        TerminationPolicy::Delete => {
            client.delete_pvcs(&ns, &selector_string(&name)).await?;
        }
        TerminationPolicy::WipeOut => {
            wipe_out_data(client, &ns, &name, &db.spec).await?;
            status.transition(LifecycleEvent::WipedOut, tctx).await?;
            ctx.normal(
                db,
                reasons::WIPED_OUT,
                actions::WIPE_OUT,
                "Removed all data of Elasticsearch",
            )
            .await;
        }
        _ => {}
    }

    release_finalizer(db, ctx).await
}

/// Remove the operator finalizer from `db`
pub async fn release_finalizer(db: &Elasticsearch, ctx: &Context) -> Result<()> {
    let remaining: Vec<String> = db
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    match ctx
        .client
        .set_elasticsearch_finalizers(
            &db.namespace().unwrap_or_default(),
            &db.name_any(),
            remaining,
        )
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Recreate a `DoNotTerminate` object once the deleted one is gone
async fn recreate(db: &Elasticsearch, ctx: &Context, status: &StatusManager<'_>) -> Result<()> {
    let ns = db.namespace().unwrap_or_default();
    let name = db.name_any();
    let fresh = Elasticsearch {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.clone()),
            labels: db.metadata.labels.clone(),
            annotations: db.metadata.annotations.clone(),
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: db.spec.clone(),
        status: None,
    };

    let deadline = Instant::now() + RECREATE_TIMEOUT;
    loop {
        match ctx.client.create_elasticsearch(&fresh).await {
            Ok(_) => break,
            Err(Error::AlreadyExists(_)) if Instant::now() < deadline => {
                debug!("previous object still terminating");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(RECREATE_POLL_INTERVAL) => {}
                }
            }
            Err(Error::AlreadyExists(_)) => {
                return Err(Error::TimeoutError(format!(
                    "Elasticsearch \"{}\" still exists after {:?}",
                    name, RECREATE_TIMEOUT
                )));
            }
            Err(e) => return Err(e),
        }
    }

    ctx.client
        .patch_elasticsearch_status(&ns, &name, status.status())
        .await?;
    info!("recreated Elasticsearch");
    Ok(())
}

/// Dormant record for a halted `db`
pub fn dormant_record(db: &Elasticsearch) -> Result<DormantDatabase> {
    let name = db.name_any();
    let ns = db.namespace().unwrap_or_default();

    let mut annotations = BTreeMap::new();
    if let Some(init) = db.spec.init.as_ref() {
        annotations.insert(ANNOTATION_INIT_SPEC.to_string(), serde_json::to_string(init)?);
    }
    let mut origin_annotations = db.annotations().clone();
    origin_annotations.remove(ANNOTATION_LAST_APPLIED);

    let mut record = DormantDatabase::new(
        &name,
        DormantDatabaseSpec {
            resume: false,
            wipe_out: false,
            origin: Origin {
                name: name.clone(),
                namespace: ns.clone(),
                labels: db.labels().clone(),
                annotations: origin_annotations,
                spec: db.spec.without_init(),
            },
        },
    );
    record.metadata.namespace = Some(ns);
    record.metadata.labels = Some(standard_labels(&name));
    record.metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    record.metadata.finalizers = Some(vec![DORMANT_FINALIZER.to_string()]);
    Ok(record)
}

async fn write_dormant_record(db: &Elasticsearch, ctx: &Context) -> Result<()> {
    let record = dormant_record(db)?;
    match ctx.client.create_dormant_database(&record).await {
        Ok(_) => info!("created dormant database"),
        Err(Error::AlreadyExists(_)) => debug!("dormant database already exists"),
        Err(e) => return Err(e),
    }
    ctx.client
        .patch_dormant_database_status(
            &db.namespace().unwrap_or_default(),
            &db.name_any(),
            &DormantDatabaseStatus {
                phase: DatabasePhase::Halted,
                halted_time: Some(Utc::now().to_rfc3339()),
                ..Default::default()
            },
        )
        .await
}

/// Delete StatefulSets, Services, PDBs and RBAC objects of `db_name`
pub async fn remove_compute(client: &dyn KubeClient, ns: &str, db_name: &str) -> Result<()> {
    for sts in client.list_statefulsets(ns, &selector_string(db_name)).await? {
        let sts_name = sts.name_any();
        client.delete_statefulset(ns, &sts_name).await?;
        client.delete_pdb(ns, &sts_name).await?;
    }
    for svc in [
        db_name.to_string(),
        discovery_service_name(db_name),
        stats_service_name(db_name),
    ] {
        client.delete_service(ns, &svc).await?;
    }
    client.delete_rbac(ns, db_name).await?;
    debug!(database = %db_name, "compute removed");
    Ok(())
}

/// Delete PVCs, owned secrets and snapshots of `db_name`
///
/// Secrets supplied by the user (without the database labels) are left alone.
pub async fn wipe_out_data(
    client: &dyn KubeClient,
    ns: &str,
    db_name: &str,
    spec: &ElasticsearchSpec,
) -> Result<()> {
    let selector = selector_string(db_name);
    client.delete_pvcs(ns, &selector).await?;

    for secret_name in [
        spec.database_secret_name(db_name),
        spec.certificate_secret_name(db_name),
        security_config_secret_name(db_name),
    ] {
        if let Some(secret) = client.get_secret(ns, &secret_name).await? {
            if is_owned_by(&secret.metadata, db_name) {
                client.delete_secret(ns, &secret_name).await?;
            }
        }
    }

    for snapshot in client.list_snapshots(ns, &selector).await? {
        client.delete_snapshot(ns, &snapshot.name_any()).await?;
    }
    info!(database = %db_name, "data wiped out");
    Ok(())
}
