//! Restore job for databases bootstrapped from a snapshot
//!
//! The job runs the dump tooling against the primary service, reading the
//! snapshot from its destination with the snapshot's storage credentials.
//! The operator only creates the job and waits for its outcome.

use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use kube::ResourceExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::crd::{Elasticsearch, ElasticsearchVersion, Snapshot};
use crate::resources::client::KubeClient;
use crate::resources::common::object_meta;
use crate::resources::secret::{KEY_ADMIN_PASSWORD, KEY_ADMIN_USERNAME};

/// Label distinguishing restore jobs from backup jobs
pub const LABEL_JOB_TYPE: &str = "kubedb.com/job-type";

const CREDENTIALS_MOUNT_PATH: &str = "/var/credentials";
const DUMP_MOUNT_PATH: &str = "/var/dump-restore";

/// Deterministic job name so a retried initialization finds the same job
pub fn restore_job_name(db_name: &str, snapshot_name: &str) -> String {
    format!("{}-restore-{}", db_name, snapshot_name)
}

/// Outcome of a restore job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Generate the restore job for `db` from `snapshot`
pub fn generate_restore_job(
    db: &Elasticsearch,
    version: &ElasticsearchVersion,
    snapshot: &Snapshot,
) -> Result<Job> {
    let db_name = db.name_any();
    let snapshot_name = snapshot.name_any();
    let image = version
        .spec
        .tools
        .as_ref()
        .map(|t| t.image.clone())
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "ElasticsearchVersion {} has no tools image for restore",
                version.name_any()
            ))
        })?;

    let mut metadata = object_meta(db, restore_job_name(&db_name, &snapshot_name));
    let mut labels = metadata.labels.take().unwrap_or_default();
    labels.insert(LABEL_JOB_TYPE.to_string(), "restore".to_string());
    metadata.labels = Some(labels.clone());

    let auth_secret = db.spec.database_secret_name(&db_name);
    let secret_env = |name: &str, key: &str| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: auth_secret.clone(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let folder = format!("elasticsearch-{}", snapshot.spec.database_name);

    Ok(Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "restore".to_string(),
                        image: Some(image),
                        args: Some(vec![
                            "--process=restore".to_string(),
                            format!("--host={}", db_name),
                            format!("--bucket={}", snapshot.spec.destination.location()),
                            format!("--folder={}", folder),
                            format!("--snapshot={}", snapshot_name),
                            format!("--enable-ssl={}", db.spec.enable_ssl),
                        ]),
                        env: Some(vec![
                            secret_env("DB_USER", KEY_ADMIN_USERNAME),
                            secret_env("DB_PASSWORD", KEY_ADMIN_PASSWORD),
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "osmconfig".to_string(),
                                mount_path: CREDENTIALS_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "util-volume".to_string(),
                                mount_path: DUMP_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "osmconfig".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(snapshot.spec.storage_secret_name.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "util-volume".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Create the restore job unless it already exists
pub async fn ensure_restore_job(client: &dyn KubeClient, job: &Job) -> Result<()> {
    match client.create_job(job).await {
        Ok(_) | Err(Error::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn outcome(job: &Job) -> Option<JobOutcome> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(JobOutcome::Succeeded);
    }
    let backoff_limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6);
    if status.failed.unwrap_or(0) > backoff_limit {
        return Some(JobOutcome::Failed);
    }
    None
}

/// Poll the restore job until it finishes or `timeout` elapses
pub async fn wait_for_job(
    client: &dyn KubeClient,
    ns: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<JobOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = client.get_job(ns, name).await?.as_ref().and_then(outcome) {
            debug!(job = %name, ?result, "restore job finished");
            return Ok(result);
        }
        if Instant::now() >= deadline {
            warn!(job = %name, "restore job did not finish in {:?}", timeout);
            return Ok(JobOutcome::TimedOut);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
