//! Credential secret generation
//!
//! The credential secret is generated once, labeled for rediscovery and then
//! reused for the lifetime of the database, including across halt and resume.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::Rng;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{Distribution, Elasticsearch};
use crate::resources::client::KubeClient;
use crate::resources::common::{Verb, check_ownership, object_meta};

pub const KEY_ADMIN_USERNAME: &str = "ADMIN_USERNAME";
pub const KEY_ADMIN_PASSWORD: &str = "ADMIN_PASSWORD";
pub const KEY_READALL_USERNAME: &str = "READALL_USERNAME";
pub const KEY_READALL_PASSWORD: &str = "READALL_PASSWORD";
pub const KEY_KIBANA_SERVER_PASSWORD: &str = "KIBANA_SERVER_PASSWORD";

/// Name of the secret holding the generated security plugin configuration
pub fn security_config_secret_name(db_name: &str) -> String {
    format!("{}-config", db_name)
}

/// Generate a secure random password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Built-in superuser for a distribution
pub fn admin_username(distribution: Distribution) -> &'static str {
    match distribution {
        Distribution::ElasticStack => "elastic",
        Distribution::SearchGuard | Distribution::OpenDistro => "admin",
    }
}

/// Read a key from a secret, looking at `data` first and `stringData` second
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

/// Generate the credential secret for `db`
pub fn generate_auth_secret(
    db: &Elasticsearch,
    distribution: Distribution,
    password_length: usize,
) -> Secret {
    let name = db.spec.database_secret_name(&db.name_any());

    let mut string_data = BTreeMap::from([
        (
            KEY_ADMIN_USERNAME.to_string(),
            admin_username(distribution).to_string(),
        ),
        (
            KEY_ADMIN_PASSWORD.to_string(),
            generate_password(password_length),
        ),
    ]);
    string_data.insert(KEY_READALL_USERNAME.to_string(), "readall".to_string());
    string_data.insert(
        KEY_READALL_PASSWORD.to_string(),
        generate_password(password_length),
    );
    if distribution != Distribution::ElasticStack {
        string_data.insert(
            KEY_KIBANA_SERVER_PASSWORD.to_string(),
            generate_password(password_length),
        );
    }

    Secret {
        metadata: object_meta(db, name),
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Ensure the credential secret exists
///
/// A user supplied secret must already exist and is never modified. The
/// generated secret is created on first use and reused afterwards.
pub async fn ensure_database_secret(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    distribution: Distribution,
    password_length: usize,
) -> Result<Verb> {
    let ns = db.namespace().unwrap_or_default();
    let db_name = db.name_any();
    let name = db.spec.database_secret_name(&db_name);

    match client.get_secret(&ns, &name).await? {
        Some(_) if db.spec.database_secret.is_some() => Ok(Verb::Unchanged),
        Some(existing) => {
            check_ownership(&existing.metadata, &db_name, "secret")?;
            Ok(Verb::Unchanged)
        }
        None if db.spec.database_secret.is_some() => Err(Error::NotFound(format!(
            "database secret \"{}\" in namespace {}",
            name, ns
        ))),
        None => {
            let secret = generate_auth_secret(db, distribution, password_length);
            client.create_secret(&secret).await?;
            info!(secret = %name, "created credential secret");
            Ok(Verb::Created)
        }
    }
}

/// Load the credential secret of `db`
pub async fn load_database_secret(client: &dyn KubeClient, db: &Elasticsearch) -> Result<Secret> {
    let ns = db.namespace().unwrap_or_default();
    let name = db.spec.database_secret_name(&db.name_any());
    client
        .get_secret(&ns, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("database secret \"{}\"", name)))
}
