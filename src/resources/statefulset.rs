//! StatefulSet synthesis for Elasticsearch node groups
//!
//! One StatefulSet is generated per [`NodeGroupPlan`]. Existing StatefulSets
//! are ownership-checked and only patched when the replica count or the main
//! container environment drifted from the plan.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy,
    StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretKeySelector, SecretVolumeSource, SecurityContext,
    Toleration, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{Elasticsearch, ElasticsearchVersion, ResourceList, StorageType};
use crate::resources::client::KubeClient;
use crate::resources::common::{Verb, check_ownership, standard_labels};
use crate::resources::secret::{
    KEY_ADMIN_PASSWORD, KEY_ADMIN_USERNAME, security_config_secret_name,
};
use crate::resources::topology::{NodeGroupPlan, discovery_service_name};

/// Name of the Elasticsearch container
pub const CONTAINER_NAME: &str = "elasticsearch";

/// Name of the exporter sidecar
pub const EXPORTER_CONTAINER_NAME: &str = "exporter";

pub const HTTP_PORT: i32 = 9200;
pub const TRANSPORT_PORT: i32 = 9300;

const DATA_DIR: &str = "/usr/share/elasticsearch/data";
const CERT_DIR: &str = "/usr/share/elasticsearch/config/certs";
const SECURITY_CONFIG_DIR: &str = "/elasticsearch/config";
const CUSTOM_CONFIG_DIR: &str = "/elasticsearch/custom-config";

fn to_quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn to_pod_affinity(value: &serde_json::Value) -> Result<Affinity> {
    serde_json::from_value(value.clone()).map_err(|e| {
        Error::ValidationError(format!("podTemplate.affinity is not a valid affinity: {}", e))
    })
}

fn main_env(plan: &NodeGroupPlan) -> Vec<EnvVar> {
    let mut env = Vec::with_capacity(plan.env.len() + 1);
    if !plan.env.iter().any(|e| e.name == "NODE_NAME") {
        env.push(EnvVar {
            name: "NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    env.extend(plan.env.iter().cloned());
    env
}

fn exporter_container(db: &Elasticsearch, version: &ElasticsearchVersion, port: i32) -> Container {
    let scheme = if db.spec.enable_ssl { "https" } else { "http" };
    let uri = if db.spec.disable_security {
        format!("{}://localhost:{}", scheme, HTTP_PORT)
    } else {
        format!("{}://$(DB_USER):$(DB_PASSWORD)@localhost:{}", scheme, HTTP_PORT)
    };
    let auth_secret = db.spec.database_secret_name(&db.name_any());
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

    Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(version.spec.exporter.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            format!("--es.uri={}", uri),
            format!("--web.listen-address=:{}", port),
            "--web.telemetry-path=/metrics".to_string(),
        ]),
        env: Some(vec![
            secret_env("DB_USER", KEY_ADMIN_USERNAME),
            secret_env("DB_PASSWORD", KEY_ADMIN_PASSWORD),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Exporter port for a monitored database
pub fn exporter_port(db: &Elasticsearch, config: &OperatorConfig) -> i32 {
    db.spec
        .monitor
        .as_ref()
        .and_then(|m| m.prometheus.as_ref())
        .and_then(|p| p.port)
        .unwrap_or(config.exporter_port)
}

/// Generate the StatefulSet for a node group
pub fn generate_statefulset(
    db: &Elasticsearch,
    plan: &NodeGroupPlan,
    version: &ElasticsearchVersion,
    config: &OperatorConfig,
) -> Result<StatefulSet> {
    let db_name = db.name_any();
    let spec = &db.spec;

    let mut ports = vec![ContainerPort {
        name: Some("transport".to_string()),
        container_port: TRANSPORT_PORT,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if plan.is_client() {
        ports.push(ContainerPort {
            name: Some("http".to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    let mut volume_mounts = vec![
        VolumeMount {
            name: "data".to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "security-config".to_string(),
            mount_path: SECURITY_CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    let mut volumes = vec![Volume {
        name: "security-config".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(security_config_secret_name(&db_name)),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if !spec.disable_security {
        volume_mounts.push(VolumeMount {
            name: "certs".to_string(),
            mount_path: CERT_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(spec.certificate_secret_name(&db_name)),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if let Some(config_secret) = &spec.config_secret {
        volume_mounts.push(VolumeMount {
            name: "custom-config".to_string(),
            mount_path: CUSTOM_CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "custom-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(config_secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut volume_claim_templates = None;
    match spec.storage_type {
        StorageType::Durable => {
            let storage = plan.storage.as_ref().or(spec.storage.as_ref()).ok_or_else(|| {
                Error::ValidationError(format!(
                    "storage is required for Durable storage of node group {}",
                    plan.statefulset_name
                ))
            })?;
            let access_modes = if storage.access_modes.is_empty() {
                vec!["ReadWriteOnce".to_string()]
            } else {
                storage.access_modes.clone()
            };
            volume_claim_templates = Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    labels: Some(standard_labels(&db_name)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(access_modes),
                    storage_class_name: storage.storage_class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(storage.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        StorageType::Ephemeral => {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(version.spec.db.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(ports),
        env: Some(main_env(plan)),
        volume_mounts: Some(volume_mounts),
        resources: plan.resources.as_ref().map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(to_quantities),
            requests: r.requests.as_ref().map(to_quantities),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string(), "SYS_RESOURCE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut containers = vec![container];
    if spec.monitor.is_some() && plan.is_client() {
        containers.push(exporter_container(db, version, exporter_port(db, config)));
    }

    let init_containers = vec![
        Container {
            name: "init-sysctl".to_string(),
            image: Some(version.spec.init_container.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec![
                "sysctl".to_string(),
                "-w".to_string(),
                "vm.max_map_count=262144".to_string(),
            ]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        Container {
            name: "config-merger".to_string(),
            image: Some(version.spec.init_container.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(plan.init_env.clone()),
            volume_mounts: Some(vec![VolumeMount {
                name: "security-config".to_string(),
                mount_path: SECURITY_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
    ];

    let pod_template = &spec.pod_template;
    let affinity = pod_template
        .affinity
        .as_ref()
        .map(to_pod_affinity)
        .transpose()?;
    let tolerations: Vec<Toleration> = pod_template
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        })
        .collect();

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(plan.statefulset_name.clone()),
            namespace: db.namespace(),
            labels: Some(plan.labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(discovery_service_name(&db_name)),
            replicas: Some(plan.replicas),
            selector: LabelSelector {
                match_labels: Some(plan.labels.clone()),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(0),
                    ..Default::default()
                }),
            }),
            // Masters must start together to form the initial quorum
            pod_management_policy: Some("Parallel".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(plan.labels.clone()),
                    annotations: if pod_template.annotations.is_empty() {
                        None
                    } else {
                        Some(pod_template.annotations.clone())
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: config.enable_rbac.then(|| db_name.clone()),
                    init_containers: Some(init_containers),
                    containers,
                    volumes: Some(volumes),
                    node_selector: if pod_template.node_selector.is_empty() {
                        None
                    } else {
                        Some(pod_template.node_selector.clone())
                    },
                    affinity,
                    tolerations: if tolerations.is_empty() {
                        None
                    } else {
                        Some(tolerations)
                    },
                    scheduler_name: pod_template.scheduler_name.clone(),
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            volume_claim_templates,
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn container_env(sts: &StatefulSet) -> Option<&Vec<EnvVar>> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)?
        .env
        .as_ref()
}

/// Whether the existing StatefulSet differs from the desired one in the
/// fields the operator keeps converged
pub fn needs_patch(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let replicas = |s: &StatefulSet| s.spec.as_ref().and_then(|spec| spec.replicas);
    replicas(existing) != replicas(desired) || container_env(existing) != container_env(desired)
}

/// Create or converge the StatefulSet for a node group
pub async fn ensure_statefulset(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    desired: &StatefulSet,
) -> Result<Verb> {
    let ns = db.namespace().unwrap_or_default();
    let name = desired.name_any();

    match client.get_statefulset(&ns, &name).await? {
        None => {
            client.create_statefulset(desired).await?;
            info!(statefulset = %name, "created StatefulSet");
            Ok(Verb::Created)
        }
        Some(existing) => {
            check_ownership(&existing.metadata, &db.name_any(), "statefulSet")?;
            if needs_patch(&existing, desired) {
                client.patch_statefulset(desired).await?;
                info!(statefulset = %name, "patched StatefulSet");
                Ok(Verb::Patched)
            } else {
                debug!(statefulset = %name, "StatefulSet unchanged");
                Ok(Verb::Unchanged)
            }
        }
    }
}

/// Whether the StatefulSet controller has observed the current spec and
/// rolled it out to `replicas` ready pods
fn rolled_out(sts: &StatefulSet, replicas: i32) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or(0) >= sts.metadata.generation.unwrap_or(0);
    observed
        && status.updated_replicas.unwrap_or(0) >= replicas
        && status.ready_replicas.unwrap_or(0) >= replicas
}

/// Poll until the StatefulSet has rolled out its latest generation to
/// `replicas` ready pods
///
/// Ready pods of a previous generation do not count. Fails with
/// [`Error::TimeoutError`] after `timeout` and with [`Error::Cancelled`] as
/// soon as `cancel` fires.
pub async fn wait_for_ready(
    client: &dyn KubeClient,
    ns: &str,
    name: &str,
    replicas: i32,
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let sts = client.get_statefulset(ns, name).await?;
        if sts.as_ref().is_some_and(|sts| rolled_out(sts, replicas)) {
            debug!(statefulset = %name, replicas, "StatefulSet ready");
            return Ok(());
        }
        if Instant::now() >= deadline {
            let status = sts.and_then(|sts| sts.status).unwrap_or_default();
            return Err(Error::TimeoutError(format!(
                "StatefulSet {} has {}/{} ready and {}/{} updated pods after {:?}",
                name,
                status.ready_replicas.unwrap_or(0),
                replicas,
                status.updated_replicas.unwrap_or(0),
                replicas,
                timeout
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
