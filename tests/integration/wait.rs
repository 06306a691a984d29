//! Wait conditions for Elasticsearch and DormantDatabase objects

use elasticsearch_operator::crd::{DatabasePhase, DormantDatabase, Elasticsearch};
use kube::Api;
use kube::runtime::wait::{Condition, await_condition};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timeout waiting for condition")]
    Timeout,

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::wait::Error),

    #[error("Resource not found after wait")]
    ResourceNotFound,
}

/// Elasticsearch status reached `expected`
pub fn is_phase(expected: DatabasePhase) -> impl Condition<Elasticsearch> {
    move |obj: Option<&Elasticsearch>| {
        obj.and_then(|db| db.status.as_ref())
            .is_some_and(|status| status.phase == expected)
    }
}

/// Failed with a reason containing `needle`
pub fn failed_with(needle: &str) -> impl Condition<Elasticsearch> {
    let needle = needle.to_string();
    move |obj: Option<&Elasticsearch>| {
        obj.and_then(|db| db.status.as_ref()).is_some_and(|status| {
            status.phase == DatabasePhase::Failed
                && status.reason.as_ref().is_some_and(|r| r.contains(&needle))
        })
    }
}

/// Object carries `finalizer`
pub fn has_finalizer(finalizer: &str) -> impl Condition<Elasticsearch> {
    let finalizer = finalizer.to_string();
    move |obj: Option<&Elasticsearch>| {
        obj.and_then(|db| db.metadata.finalizers.as_ref())
            .is_some_and(|f| f.contains(&finalizer))
    }
}

/// Dormant record reached `expected`
pub fn dormant_phase(expected: DatabasePhase) -> impl Condition<DormantDatabase> {
    move |obj: Option<&DormantDatabase>| {
        obj.and_then(|d| d.status.as_ref())
            .is_some_and(|status| status.phase == expected)
    }
}

/// Wait for `name` to satisfy `condition` and return the matching object
pub async fn wait_for<K, C>(api: &Api<K>, name: &str, condition: C, timeout: Duration) -> Result<K, WaitError>
where
    K: kube::Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    C: Condition<K>,
{
    let cond = await_condition(api.clone(), name, condition);
    tokio::time::timeout(timeout, cond)
        .await
        .map_err(|_| WaitError::Timeout)??
        .ok_or(WaitError::ResourceNotFound)
}

/// Wait for `name` to exist
pub async fn wait_for_resource<K>(api: &Api<K>, name: &str, timeout: Duration) -> Result<K, WaitError>
where
    K: kube::Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    wait_for(api, name, |obj: Option<&K>| obj.is_some(), timeout).await
}

/// Wait for `name` to be gone
pub async fn wait_for_deletion<K>(api: &Api<K>, name: &str, timeout: Duration) -> Result<(), WaitError>
where
    K: kube::Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let cond = await_condition(api.clone(), name, |obj: Option<&K>| obj.is_none());
    tokio::time::timeout(timeout, cond)
        .await
        .map_err(|_| WaitError::Timeout)??;
    Ok(())
}
