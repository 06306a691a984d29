//! Orchestration API seam
//!
//! Every read and write the controllers perform goes through [`KubeClient`],
//! so reconciliation can run against the real API server, a mock, or an
//! in-memory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::crd::{
    DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, Elasticsearch,
    ElasticsearchStatus, ElasticsearchVersion, ServiceMonitor, Snapshot,
};
use crate::resources::common::FIELD_MANAGER;

/// Trait abstracting the Kubernetes API operations used by the controllers
///
/// `get_*` returns `None` for missing objects, `create_*` fails with
/// [`Error::AlreadyExists`] on a name clash and `delete_*` tolerates
/// objects that are already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_elasticsearch(&self, ns: &str, name: &str) -> Result<Option<Elasticsearch>>;

    async fn create_elasticsearch(&self, db: &Elasticsearch) -> Result<Elasticsearch>;

    async fn patch_elasticsearch_status(
        &self,
        ns: &str,
        name: &str,
        status: &ElasticsearchStatus,
    ) -> Result<()>;

    /// Set (or remove, with `None`) annotations on an Elasticsearch object
    async fn patch_elasticsearch_annotations(
        &self,
        ns: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn set_elasticsearch_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn get_dormant_database(&self, ns: &str, name: &str)
    -> Result<Option<DormantDatabase>>;

    async fn create_dormant_database(&self, dormant: &DormantDatabase) -> Result<DormantDatabase>;

    async fn patch_dormant_database_spec(
        &self,
        ns: &str,
        name: &str,
        spec: &DormantDatabaseSpec,
    ) -> Result<()>;

    async fn patch_dormant_database_status(
        &self,
        ns: &str,
        name: &str,
        status: &DormantDatabaseStatus,
    ) -> Result<()>;

    async fn set_dormant_database_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn delete_dormant_database(&self, ns: &str, name: &str) -> Result<()>;

    /// Catalog entries are cluster scoped
    async fn get_elasticsearch_version(&self, name: &str) -> Result<Option<ElasticsearchVersion>>;

    async fn storage_class_exists(&self, name: &str) -> Result<bool>;

    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;

    async fn patch_statefulset(&self, sts: &StatefulSet) -> Result<()>;

    async fn delete_statefulset(&self, ns: &str, name: &str) -> Result<()>;

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> Result<Vec<StatefulSet>>;

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, svc: &Service) -> Result<Service>;

    async fn patch_service(&self, svc: &Service) -> Result<()>;

    async fn delete_service(&self, ns: &str, name: &str) -> Result<()>;

    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn patch_secret(&self, secret: &Secret) -> Result<()>;

    async fn delete_secret(&self, ns: &str, name: &str) -> Result<()>;

    async fn list_pvcs(&self, ns: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    async fn delete_pvcs(&self, ns: &str, selector: &str) -> Result<()>;

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()>;

    async fn apply_role(&self, role: &Role) -> Result<()>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()>;

    /// Remove the service account, role and binding named `name`
    async fn delete_rbac(&self, ns: &str, name: &str) -> Result<()>;

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()>;

    async fn delete_pdb(&self, ns: &str, name: &str) -> Result<()>;

    async fn get_snapshot(&self, ns: &str, name: &str) -> Result<Option<Snapshot>>;

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot>;

    async fn list_snapshots(&self, ns: &str, selector: &str) -> Result<Vec<Snapshot>>;

    async fn delete_snapshot(&self, ns: &str, name: &str) -> Result<()>;

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn apply_service_monitor(&self, monitor: &ServiceMonitor) -> Result<()>;

    async fn delete_service_monitor(&self, ns: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<T>(&self, ns: &str) -> Api<T>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <T as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn create<T>(&self, obj: &T) -> Result<T>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let ns = obj
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<T> = self.api(&ns);
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::AlreadyExists(format!(
                "{} {}/{}",
                T::kind(&Default::default()),
                ns,
                obj.name_any()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-side apply, taking ownership of conflicting fields
    async fn apply<T>(&self, obj: &T) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let ns = obj
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = obj.name_any();
        let api: Api<T> = self.api(&ns);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        let dt = Default::default();
        let kind = T::kind(&dt);
        debug!(%kind, %name, "applied resource");
        Ok(())
    }

    async fn get<T>(&self, ns: &str, name: &str) -> Result<Option<T>>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(ns);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete<T>(&self, ns: &str, name: &str) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list<T>(&self, ns: &str, selector: &str) -> Result<Vec<T>>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(ns);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn merge_patch<T>(&self, ns: &str, name: &str, patch: serde_json::Value) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(ns);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn merge_patch_status<T>(
        &self,
        ns: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(ns);
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// JSON merge patch body replacing `status`
///
/// Unset nullable fields serialize as `null`, which removes them from the
/// stored status instead of leaving a stale value behind.
pub fn status_patch<S: Serialize>(status: &S) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_elasticsearch(&self, ns: &str, name: &str) -> Result<Option<Elasticsearch>> {
        self.get(ns, name).await
    }

    async fn create_elasticsearch(&self, db: &Elasticsearch) -> Result<Elasticsearch> {
        self.create(db).await
    }

    async fn patch_elasticsearch_status(
        &self,
        ns: &str,
        name: &str,
        status: &ElasticsearchStatus,
    ) -> Result<()> {
        self.merge_patch_status::<Elasticsearch>(ns, name, status_patch(status))
            .await
    }

    async fn patch_elasticsearch_annotations(
        &self,
        ns: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.merge_patch::<Elasticsearch>(ns, name, patch).await
    }

    async fn set_elasticsearch_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.merge_patch::<Elasticsearch>(ns, name, patch).await
    }

    async fn get_dormant_database(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<DormantDatabase>> {
        self.get(ns, name).await
    }

    async fn create_dormant_database(&self, dormant: &DormantDatabase) -> Result<DormantDatabase> {
        self.create(dormant).await
    }

    async fn patch_dormant_database_spec(
        &self,
        ns: &str,
        name: &str,
        spec: &DormantDatabaseSpec,
    ) -> Result<()> {
        self.merge_patch::<DormantDatabase>(ns, name, serde_json::json!({ "spec": spec }))
            .await
    }

    async fn patch_dormant_database_status(
        &self,
        ns: &str,
        name: &str,
        status: &DormantDatabaseStatus,
    ) -> Result<()> {
        self.merge_patch_status::<DormantDatabase>(
            ns,
            name,
            status_patch(status),
        )
        .await
    }

    async fn set_dormant_database_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.merge_patch::<DormantDatabase>(ns, name, patch).await
    }

    async fn delete_dormant_database(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<DormantDatabase>(ns, name).await
    }

    async fn get_elasticsearch_version(&self, name: &str) -> Result<Option<ElasticsearchVersion>> {
        let api: Api<ElasticsearchVersion> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn get_statefulset(&self, ns: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get(ns, name).await
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        self.create(sts).await
    }

    async fn patch_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        self.apply(sts).await
    }

    async fn delete_statefulset(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<StatefulSet>(ns, name).await
    }

    async fn list_statefulsets(&self, ns: &str, selector: &str) -> Result<Vec<StatefulSet>> {
        self.list(ns, selector).await
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>> {
        self.get(ns, name).await
    }

    async fn create_service(&self, svc: &Service) -> Result<Service> {
        self.create(svc).await
    }

    async fn patch_service(&self, svc: &Service) -> Result<()> {
        self.apply(svc).await
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<Service>(ns, name).await
    }

    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        self.get(ns, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(secret).await
    }

    async fn patch_secret(&self, secret: &Secret) -> Result<()> {
        self.apply(secret).await
    }

    async fn delete_secret(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<Secret>(ns, name).await
    }

    async fn list_pvcs(&self, ns: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        self.list(ns, selector).await
    }

    async fn delete_pvcs(&self, ns: &str, selector: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(ns);
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(selector),
        )
        .await?;
        Ok(())
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()> {
        self.apply(sa).await
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        self.apply(role).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        self.apply(binding).await
    }

    async fn delete_rbac(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<RoleBinding>(ns, name).await?;
        self.delete::<Role>(ns, name).await?;
        self.delete::<ServiceAccount>(ns, name).await
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        self.apply(pdb).await
    }

    async fn delete_pdb(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<PodDisruptionBudget>(ns, name).await
    }

    async fn get_snapshot(&self, ns: &str, name: &str) -> Result<Option<Snapshot>> {
        self.get(ns, name).await
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<Snapshot> {
        self.create(snapshot).await
    }

    async fn list_snapshots(&self, ns: &str, selector: &str) -> Result<Vec<Snapshot>> {
        self.list(ns, selector).await
    }

    async fn delete_snapshot(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<Snapshot>(ns, name).await
    }

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        self.get(ns, name).await
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        self.create(job).await
    }

    async fn apply_service_monitor(&self, monitor: &ServiceMonitor) -> Result<()> {
        self.apply(monitor).await
    }

    async fn delete_service_monitor(&self, ns: &str, name: &str) -> Result<()> {
        self.delete::<ServiceMonitor>(ns, name).await
    }
}
