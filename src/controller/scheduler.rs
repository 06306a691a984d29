//! Cron registry for periodic snapshots
//!
//! Each database with a backup schedule owns one tokio task that sleeps
//! until the next cron fire and then creates a `Snapshot` object. The
//! snapshot itself is executed by the backup tooling, not by the operator.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::crd::{BackupScheduleSpec, Elasticsearch, Snapshot, SnapshotPhase, SnapshotSpec};
use crate::resources::client::KubeClient;
use crate::resources::common::{selector_string, standard_labels};

struct ScheduleEntry {
    spec: BackupScheduleSpec,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of running backup schedules keyed by `namespace/name`
pub struct BackupScheduler {
    client: Arc<dyn KubeClient>,
    entries: DashMap<String, ScheduleEntry>,
    shutdown: CancellationToken,
}

impl BackupScheduler {
    /// Schedules stop when `shutdown` is cancelled
    pub fn new(client: Arc<dyn KubeClient>, shutdown: CancellationToken) -> Self {
        Self {
            client,
            entries: DashMap::new(),
            shutdown,
        }
    }

    /// Start or replace the schedule of `db`
    ///
    /// Returns `false` when an identical schedule is already running.
    pub fn schedule(&self, db: &Elasticsearch) -> Result<bool> {
        let ns = db.namespace().unwrap_or_default();
        let name = db.name_any();
        let key = format!("{}/{}", ns, name);

        let Some(spec) = db.spec.backup_schedule.clone() else {
            self.unschedule(&ns, &name);
            return Ok(false);
        };
        if self
            .entries
            .get(&key)
            .is_some_and(|e| e.spec == spec && !e.handle.is_finished())
        {
            return Ok(false);
        }

        let schedule = Schedule::from_str(&spec.cron_expression).map_err(|e| {
            Error::ValidationError(format!(
                "invalid cron expression \"{}\": {}",
                spec.cron_expression, e
            ))
        })?;

        let stop = self.shutdown.child_token();
        let handle = tokio::spawn(run_schedule(
            self.client.clone(),
            ns,
            name,
            spec.clone(),
            schedule,
            stop.clone(),
        ));
        if let Some(previous) = self.entries.insert(key, ScheduleEntry { spec, stop, handle }) {
            previous.stop.cancel();
        }
        Ok(true)
    }

    /// Stop the schedule of `namespace/name`, if any
    pub fn unschedule(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        if let Some((_, entry)) = self.entries.remove(&key) {
            entry.stop.cancel();
            info!(database = %key, "backup schedule stopped");
        }
    }

    pub fn is_scheduled(&self, namespace: &str, name: &str) -> bool {
        self.entries.contains_key(&format!("{}/{}", namespace, name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn run_schedule(
    client: Arc<dyn KubeClient>,
    ns: String,
    db_name: String,
    spec: BackupScheduleSpec,
    schedule: Schedule,
    stop: CancellationToken,
) {
    info!(database = %db_name, cron = %spec.cron_expression, "backup schedule started");
    loop {
        let now = Utc::now();
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(database = %db_name, "cron expression has no upcoming fire time");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
        debug!(database = %db_name, next_fire = %next, "waiting for next backup");

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                match take_snapshot(client.as_ref(), &ns, &db_name, &spec).await {
                    Ok(Some(snapshot)) => {
                        info!(database = %db_name, snapshot = %snapshot.name_any(), "snapshot created")
                    }
                    Ok(None) => {}
                    Err(e) => warn!(database = %db_name, error = %e, "failed to create snapshot"),
                }
            }
        }
    }
}

/// Name of a scheduled snapshot taken at `at`
pub fn snapshot_name(db_name: &str, at: chrono::DateTime<Utc>) -> String {
    format!("{}-{}", db_name, at.format("%Y%m%d-%H%M%S"))
}

/// Create a snapshot object for `db_name` unless one is still in flight
pub async fn take_snapshot(
    client: &dyn KubeClient,
    ns: &str,
    db_name: &str,
    spec: &BackupScheduleSpec,
) -> Result<Option<Snapshot>> {
    let snapshots = client.list_snapshots(ns, &selector_string(db_name)).await?;
    let active = snapshots.iter().any(|s| {
        matches!(
            s.status.as_ref().map(|st| st.phase).unwrap_or_default(),
            SnapshotPhase::Pending | SnapshotPhase::Running
        )
    });
    if active {
        debug!(database = %db_name, "previous snapshot still running, skipping");
        return Ok(None);
    }

    let mut snapshot = Snapshot::new(
        &snapshot_name(db_name, Utc::now()),
        SnapshotSpec {
            database_name: db_name.to_string(),
            storage_secret_name: spec.storage_secret_name.clone(),
            destination: spec.destination.clone(),
        },
    );
    snapshot.metadata.namespace = Some(ns.to_string());
    snapshot.metadata.labels = Some(standard_labels(db_name));

    match client.create_snapshot(&snapshot).await {
        Ok(created) => Ok(Some(created)),
        Err(Error::AlreadyExists(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
