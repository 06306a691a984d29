//! Test fixtures and builders for Elasticsearch and catalog resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let db = create_test_database("es", "demo", 3);
//! let version = elasticsearch_version("7.10.2", "7.10.2", Distribution::ElasticStack);
//! ```
//!
//! For dedicated topologies use the builder:
//! ```rust,ignore
//! let db = ElasticsearchBuilder::new("es", "demo")
//!     .with_topology(3, 2, 1)
//!     .with_termination_policy(TerminationPolicy::WipeOut)
//!     .build();
//! ```

use std::collections::BTreeMap;

use elasticsearch_operator::crd::{
    BackupDestination, BackupScheduleSpec, Distribution, Elasticsearch, ElasticsearchClusterTopology,
    ElasticsearchNode, ElasticsearchSpec, ElasticsearchVersion, ElasticsearchVersionSpec,
    ImageRef, InitSpec, MonitorAgent, MonitorSpec, PrometheusSpec, ResourceList,
    ResourceRequirements, SnapshotSourceSpec, StorageSpec, StorageType, TerminationPolicy,
};
use kube::core::ObjectMeta;

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// A combined-node database with durable storage on the default class
pub fn create_test_database(name: &str, namespace: &str, replicas: i32) -> Elasticsearch {
    ElasticsearchBuilder::new(name, namespace)
        .with_replicas(replicas)
        .build()
}

/// A catalog entry with the standard image set
pub fn elasticsearch_version(name: &str, raw: &str, distribution: Distribution) -> ElasticsearchVersion {
    ElasticsearchVersion::new(
        name,
        ElasticsearchVersionSpec {
            version: raw.to_string(),
            distribution,
            db: ImageRef {
                image: format!("kubedb/elasticsearch:{}", raw),
            },
            exporter: ImageRef {
                image: "kubedb/elasticsearch_exporter:1.1.0".to_string(),
            },
            init_container: ImageRef {
                image: "busybox:1.32".to_string(),
            },
            tools: Some(ImageRef {
                image: format!("kubedb/elasticsearch-tools:{}", raw),
            }),
            deprecated: false,
        },
    )
}

pub fn s3_destination() -> BackupDestination {
    BackupDestination::S3 {
        bucket: "es-backups".to_string(),
        endpoint: None,
        prefix: Some("demo".to_string()),
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for Elasticsearch objects
pub struct ElasticsearchBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    spec: ElasticsearchSpec,
}

impl ElasticsearchBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: ElasticsearchSpec {
                version: "7.10.2".to_string(),
                replicas: 1,
                topology: None,
                storage_type: StorageType::Durable,
                storage: Some(storage("1Gi", None)),
                resources: None,
                disable_security: false,
                enable_ssl: false,
                certificate_secret: None,
                database_secret: None,
                config_secret: None,
                termination_policy: TerminationPolicy::Halt,
                init: None,
                backup_schedule: None,
                monitor: None,
                pod_template: Default::default(),
                service_template: None,
            },
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.spec.version = version.to_string();
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.spec.replicas = replicas;
        self
    }

    pub fn with_storage(mut self, size: &str, class: Option<&str>) -> Self {
        self.spec.storage = Some(storage(size, class));
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.spec.storage_type = StorageType::Ephemeral;
        self.spec.storage = None;
        self
    }

    pub fn with_memory_limit(mut self, memory: &str) -> Self {
        self.spec.resources = Some(ResourceRequirements {
            limits: Some(ResourceList {
                cpu: None,
                memory: Some(memory.to_string()),
            }),
            requests: None,
        });
        self
    }

    /// Dedicated master, data and ingest groups
    pub fn with_topology(mut self, master: i32, data: i32, ingest: i32) -> Self {
        let node = |replicas: i32| ElasticsearchNode {
            prefix: None,
            replicas: Some(replicas),
            storage: Some(storage("1Gi", None)),
            resources: None,
        };
        self.spec.topology = Some(ElasticsearchClusterTopology {
            master: Some(node(master)),
            data: Some(node(data)),
            ingest: Some(node(ingest)),
            ..Default::default()
        });
        self.spec.storage = None;
        self
    }

    pub fn with_topology_spec(mut self, topology: ElasticsearchClusterTopology) -> Self {
        self.spec.topology = Some(topology);
        self.spec.storage = None;
        self
    }

    pub fn without_security(mut self) -> Self {
        self.spec.disable_security = true;
        self
    }

    pub fn with_ssl(mut self) -> Self {
        self.spec.enable_ssl = true;
        self
    }

    pub fn with_database_secret(mut self, name: &str) -> Self {
        self.spec.database_secret = Some(name.to_string());
        self
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.spec.termination_policy = policy;
        self
    }

    pub fn with_snapshot_source(mut self, snapshot: &str, namespace: Option<&str>) -> Self {
        self.spec.init = Some(InitSpec {
            snapshot_source: Some(SnapshotSourceSpec {
                namespace: namespace.map(str::to_string),
                name: snapshot.to_string(),
            }),
        });
        self
    }

    pub fn with_backup_schedule(mut self, cron: &str, secret: &str) -> Self {
        self.spec.backup_schedule = Some(BackupScheduleSpec {
            cron_expression: cron.to_string(),
            storage_secret_name: secret.to_string(),
            destination: s3_destination(),
        });
        self
    }

    pub fn with_monitor(mut self, agent: MonitorAgent) -> Self {
        self.spec.monitor = Some(MonitorSpec {
            agent,
            prometheus: Some(PrometheusSpec::default()),
        });
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Elasticsearch {
        Elasticsearch {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                labels: Some(self.labels).filter(|l| !l.is_empty()),
                annotations: Some(self.annotations).filter(|a| !a.is_empty()),
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}

fn storage(size: &str, class: Option<&str>) -> StorageSpec {
    StorageSpec {
        storage_class_name: class.map(str::to_string),
        access_modes: Vec::new(),
        size: size.to_string(),
    }
}
