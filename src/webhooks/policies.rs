//! Admission decisions for Elasticsearch objects

use kube::ResourceExt;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::controller::validation::{validate, validate_spec_change};
use crate::crd::{Elasticsearch, TerminationPolicy};
use crate::resources::client::KubeClient;

/// Decide on one admission request
///
/// Lookup failures deny the request; the API server applies the webhook's
/// failure policy only when the webhook itself is unreachable.
pub async fn admit(
    client: &dyn KubeClient,
    req: &AdmissionRequest<Elasticsearch>,
) -> AdmissionResponse {
    let verdict = match req.operation {
        Operation::Delete => check_delete(client, req).await,
        Operation::Create | Operation::Update => check_write(client, req).await,
        Operation::Connect => Ok(()),
    };
    let response = AdmissionResponse::from(req);
    match verdict {
        Ok(()) => {
            debug!(uid = %req.uid, operation = ?req.operation, "admission allowed");
            response
        }
        Err(e) => {
            warn!(
                uid = %req.uid,
                operation = ?req.operation,
                name = %req.name,
                error = %e,
                "admission denied"
            );
            response.deny(e.to_string())
        }
    }
}

/// Refuse deletion while the policy is `DoNotTerminate`
pub fn check_termination_policy(db: &Elasticsearch) -> Result<()> {
    if db.spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return Err(Error::ValidationError(format!(
            "Elasticsearch \"{}/{}\" can't be terminated. To delete, change spec.terminationPolicy",
            db.namespace().unwrap_or_default(),
            db.name_any()
        )));
    }
    Ok(())
}

async fn check_delete(client: &dyn KubeClient, req: &AdmissionRequest<Elasticsearch>) -> Result<()> {
    if let Some(db) = req.old_object.as_ref() {
        return check_termination_policy(db);
    }
    let ns = req.namespace.as_deref().unwrap_or_default();
    match client.get_elasticsearch(ns, &req.name).await? {
        Some(db) => check_termination_policy(&db),
        None => Ok(()),
    }
}

async fn check_write(client: &dyn KubeClient, req: &AdmissionRequest<Elasticsearch>) -> Result<()> {
    let Some(db) = req.object.as_ref() else {
        return Err(Error::ValidationError(
            "admission request carries no object".to_string(),
        ));
    };
    // Finalizer removal on a deleting object must always pass
    if db.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    if let Some(old) = req.old_object.as_ref() {
        if old.spec == db.spec {
            return Ok(());
        }
        validate_spec_change(&old.spec, &db.spec)?;
    }

    if db.metadata.namespace.is_some() {
        return validate(client, db).await.map(|_| ());
    }
    let mut db = db.clone();
    db.metadata.namespace = req.namespace.clone();
    validate(client, &db).await.map(|_| ())
}
