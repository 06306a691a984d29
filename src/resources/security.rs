//! Security plugin configuration
//!
//! The catalog distribution selects one [`SecurityPlugin`]. Its rendering of
//! `elasticsearch.yml` and, where the plugin keeps users in a file, the bcrypt
//! hashed internal users are stored in the `<name>-config` secret that the
//! init container merges into the node configuration.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Serialize;
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{Distribution, Elasticsearch};
use crate::resources::certificate::{CertificateBundle, load_bundle};
use crate::resources::client::KubeClient;
use crate::resources::common::{Verb, check_ownership, object_meta};
use crate::resources::secret::{
    KEY_ADMIN_PASSWORD, KEY_KIBANA_SERVER_PASSWORD, KEY_READALL_PASSWORD, load_database_secret,
    security_config_secret_name, secret_value,
};

pub const CONFIG_FILE_NAME: &str = "elasticsearch.yml";

/// bcrypt work factor for internal user hashes
pub const BCRYPT_COST: u32 = 12;

/// Security plugin shipped with the image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityPlugin {
    XPack,
    SearchGuard,
    OpenDistro,
}

impl From<Distribution> for SecurityPlugin {
    fn from(distribution: Distribution) -> Self {
        match distribution {
            Distribution::ElasticStack => SecurityPlugin::XPack,
            Distribution::SearchGuard => SecurityPlugin::SearchGuard,
            Distribution::OpenDistro => SecurityPlugin::OpenDistro,
        }
    }
}

/// Subject DNs the plugin trusts for node and admin certificates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrustedDns {
    pub nodes_dn: Option<String>,
    pub admin_dn: Option<String>,
}

impl TrustedDns {
    pub fn from_bundle(bundle: &CertificateBundle) -> Result<Self> {
        Ok(Self {
            nodes_dn: Some(bundle.node_dn()?),
            admin_dn: bundle.admin_dn()?,
        })
    }
}

fn dn_block(key: &str, dn: Option<&str>) -> String {
    match dn {
        Some(dn) => format!("{}:\n- \"{}\"\n", key, dn),
        None => String::new(),
    }
}

impl SecurityPlugin {
    /// File holding internal users, for plugins that keep them on disk
    pub fn internal_users_file(&self) -> Option<&'static str> {
        match self {
            SecurityPlugin::XPack => None,
            SecurityPlugin::SearchGuard => Some("sg_internal_users.yml"),
            SecurityPlugin::OpenDistro => Some("internal_users.yml"),
        }
    }

    /// Render `elasticsearch.yml` for the plugin
    pub fn render_config(&self, enabled: bool, dns: &TrustedDns) -> String {
        match (self, enabled) {
            (SecurityPlugin::XPack, true) => XPACK_ENABLED.to_string(),
            (SecurityPlugin::XPack, false) => "xpack.security.enabled: false\n".to_string(),
            (SecurityPlugin::SearchGuard, true) => format!(
                "{}\n{}\n{}\n{}",
                SEARCH_GUARD_ENABLED_HEAD,
                dn_block("searchguard.authcz.admin_dn", dns.admin_dn.as_deref()),
                dn_block("searchguard.nodes_dn", dns.nodes_dn.as_deref()),
                SEARCH_GUARD_ENABLED_TAIL
            ),
            (SecurityPlugin::SearchGuard, false) => SEARCH_GUARD_DISABLED.to_string(),
            (SecurityPlugin::OpenDistro, true) => format!(
                "{}\n{}\n{}\n{}",
                OPEN_DISTRO_ENABLED_HEAD,
                dn_block("opendistro_security.authcz.admin_dn", dns.admin_dn.as_deref()),
                dn_block("opendistro_security.nodes_dn", dns.nodes_dn.as_deref()),
                OPEN_DISTRO_ENABLED_TAIL
            ),
            (SecurityPlugin::OpenDistro, false) => OPEN_DISTRO_DISABLED.to_string(),
        }
    }
}

const XPACK_ENABLED: &str = r#"xpack.security.enabled: true

xpack.security.transport.ssl.enabled: true
xpack.security.transport.ssl.verification_mode: certificate
xpack.security.transport.ssl.key: certs/node-key.pem
xpack.security.transport.ssl.certificate: certs/node.pem
xpack.security.transport.ssl.certificate_authorities: [ "certs/root-ca.pem" ]

xpack.security.http.ssl.enabled: ${SSL_ENABLE}
xpack.security.http.ssl.key: certs/client-key.pem
xpack.security.http.ssl.certificate: certs/client.pem
xpack.security.http.ssl.certificate_authorities: [ "certs/root-ca.pem" ]
"#;

const SEARCH_GUARD_ENABLED_HEAD: &str = r#"xpack.security.enabled: false
xpack.ml.enabled: false
xpack.watcher.enabled: false
xpack.monitoring.collection.enabled: true

searchguard.enterprise_modules_enabled: false

searchguard.ssl.transport.enforce_hostname_verification: false
searchguard.ssl.transport.pemkey_filepath: certs/node-key.pem
searchguard.ssl.transport.pemcert_filepath: certs/node.pem
searchguard.ssl.transport.pemtrustedcas_filepath: certs/root-ca.pem

searchguard.ssl.http.enabled: ${SSL_ENABLE}
searchguard.ssl.http.pemkey_filepath: certs/client-key.pem
searchguard.ssl.http.pemcert_filepath: certs/client.pem
searchguard.ssl.http.pemtrustedcas_filepath: certs/root-ca.pem
"#;

const SEARCH_GUARD_ENABLED_TAIL: &str = r#"searchguard.allow_default_init_sgindex: true
searchguard.enable_snapshot_restore_privilege: true
searchguard.check_snapshot_restore_write_privileges: true
searchguard.audit.type: internal_elasticsearch
searchguard.restapi.roles_enabled: ["SGS_ALL_ACCESS","sg_all_access"]
"#;

const SEARCH_GUARD_DISABLED: &str = r#"xpack.security.enabled: false
xpack.ml.enabled: false
xpack.watcher.enabled: false
xpack.monitoring.collection.enabled: true

searchguard.disabled: true
"#;

const OPEN_DISTRO_ENABLED_HEAD: &str = r#"opendistro_security.ssl.transport.pemcert_filepath: certs/node.pem
opendistro_security.ssl.transport.pemkey_filepath: certs/node-key.pem
opendistro_security.ssl.transport.pemtrustedcas_filepath: certs/root-ca.pem
opendistro_security.ssl.transport.enforce_hostname_verification: false

opendistro_security.ssl.http.enabled: ${SSL_ENABLE}
opendistro_security.ssl.http.pemcert_filepath: certs/client.pem
opendistro_security.ssl.http.pemkey_filepath: certs/client-key.pem
opendistro_security.ssl.http.pemtrustedcas_filepath: certs/root-ca.pem
opendistro_security.allow_default_init_securityindex: true
"#;

const OPEN_DISTRO_ENABLED_TAIL: &str = r#"opendistro_security.audit.type: internal_elasticsearch
opendistro_security.enable_snapshot_restore_privilege: true
opendistro_security.check_snapshot_restore_write_privileges: true
opendistro_security.restapi.roles_enabled: ["all_access", "security_rest_api_access"]
cluster.routing.allocation.disk.threshold_enabled: false
"#;

const OPEN_DISTRO_DISABLED: &str = r#"opendistro_security.disabled: true

cluster.routing.allocation.disk.threshold_enabled: false
"#;

#[derive(Serialize)]
struct InternalUserEntry {
    hash: String,
}

/// Plain-text passwords of the built-in internal users
///
/// `admin`, `kibanaserver` and `readall` come from the credential secret when
/// it provides them; every other user defaults to its own name.
pub fn internal_user_passwords(credentials: &Secret) -> BTreeMap<&'static str, String> {
    let from_secret = |key: &str, fallback: &str| {
        secret_value(credentials, key).unwrap_or_else(|| fallback.to_string())
    };
    BTreeMap::from([
        ("admin", from_secret(KEY_ADMIN_PASSWORD, "admin")),
        (
            "kibanaserver",
            from_secret(KEY_KIBANA_SERVER_PASSWORD, "kibanaserver"),
        ),
        ("kibanaro", "kibanaro".to_string()),
        ("logstash", "logstash".to_string()),
        ("readall", from_secret(KEY_READALL_PASSWORD, "readall")),
        ("snapshotrestore", "snapshotrestore".to_string()),
    ])
}

/// Render the internal users file with bcrypt hashed passwords
pub fn render_internal_users(passwords: &BTreeMap<&'static str, String>) -> Result<String> {
    let mut users = BTreeMap::new();
    for (name, password) in passwords {
        users.insert(
            *name,
            InternalUserEntry {
                hash: bcrypt::hash(password, BCRYPT_COST)?,
            },
        );
    }
    serde_yaml::to_string(&users)
        .map_err(|e| Error::PermanentError(format!("failed to render internal users: {}", e)))
}

/// Build the security config secret contents
pub fn generate_config_data(
    plugin: SecurityPlugin,
    enabled: bool,
    dns: &TrustedDns,
    credentials: &Secret,
) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::from([(
        CONFIG_FILE_NAME.to_string(),
        plugin.render_config(enabled, dns),
    )]);
    if enabled {
        if let Some(file) = plugin.internal_users_file() {
            let users = render_internal_users(&internal_user_passwords(credentials))?;
            data.insert(file.to_string(), users);
        }
    }
    Ok(data)
}

/// Ensure the security config secret matches the current security settings
///
/// The rendered `elasticsearch.yml` decides whether the secret is rewritten;
/// hashes are salted, so the users file alone never forces a patch.
pub async fn ensure_default_config(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    distribution: Distribution,
) -> Result<Verb> {
    let ns = db.namespace().unwrap_or_default();
    let db_name = db.name_any();
    let name = security_config_secret_name(&db_name);
    let plugin = SecurityPlugin::from(distribution);
    let enabled = !db.spec.disable_security;

    let existing = client.get_secret(&ns, &name).await?;
    if let Some(existing) = &existing {
        check_ownership(&existing.metadata, &db_name, "secret")?;
    }

    let dns = if enabled {
        TrustedDns::from_bundle(&load_bundle(client, db, distribution).await?)?
    } else {
        TrustedDns::default()
    };

    if let Some(existing) = &existing {
        let current = secret_value(existing, CONFIG_FILE_NAME);
        let users_present = match plugin.internal_users_file() {
            Some(file) if enabled => secret_value(existing, file).is_some(),
            _ => true,
        };
        if current.as_deref() == Some(plugin.render_config(enabled, &dns).as_str())
            && users_present
        {
            return Ok(Verb::Unchanged);
        }
    }

    let credentials = load_database_secret(client, db).await?;
    let data = generate_config_data(plugin, enabled, &dns, &credentials)?;
    let secret = Secret {
        metadata: object_meta(db, name.clone()),
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    };

    if existing.is_some() {
        client.patch_secret(&secret).await?;
        info!(secret = %name, plugin = ?plugin, "updated security config");
        Ok(Verb::Patched)
    } else {
        client.create_secret(&secret).await?;
        info!(secret = %name, plugin = ?plugin, "created security config");
        Ok(Verb::Created)
    }
}
