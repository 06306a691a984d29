//! Self-signed certificate bundle for transport and HTTP TLS
//!
//! A root CA is generated once per database and signs the node, client and
//! (for Search Guard and OpenDistro) admin certificates. The bundle lives in a
//! single secret with fixed key names and is reused on every later pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};
use tracing::info;
use x509_parser::prelude::*;

use crate::controller::error::{Error, Result};
use crate::crd::{Distribution, Elasticsearch};
use crate::resources::client::KubeClient;
use crate::resources::common::{Verb, check_ownership, object_meta};
use crate::resources::secret::secret_value;
use crate::resources::topology::discovery_service_name;

pub const KEY_ROOT_CA: &str = "root-ca.pem";
pub const KEY_ROOT_KEY: &str = "root-key.pem";
pub const KEY_NODE: &str = "node.pem";
pub const KEY_NODE_KEY: &str = "node-key.pem";
pub const KEY_CLIENT: &str = "client.pem";
pub const KEY_CLIENT_KEY: &str = "client-key.pem";
pub const KEY_ADMIN: &str = "admin.pem";
pub const KEY_ADMIN_KEY: &str = "admin-key.pem";

/// Validity of every generated certificate
pub const VALIDITY_DAYS: i64 = 365;

const ORGANIZATION: &str = "Elasticsearch Operator";

fn compute_validity() -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(VALIDITY_DAYS))
}

fn cert_err(what: &str) -> impl Fn(rcgen::Error) -> Error + '_ {
    move |e| Error::CertificateError(format!("{}: {}", what, e))
}

/// 2048-bit RSA key; the distributions' TLS plugins expect RSA certificates
fn rsa_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(cert_err(what))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Key material persisted in the certificate secret
#[derive(Clone, Debug, PartialEq)]
pub struct CertificateBundle {
    pub root_ca: String,
    pub root_key: String,
    pub node: String,
    pub node_key: String,
    pub client: String,
    pub client_key: String,
    /// Present for distributions that authenticate admin operations by certificate
    pub admin: Option<(String, String)>,
}

/// Whether a distribution needs an admin certificate
pub fn needs_admin_cert(distribution: Distribution) -> bool {
    matches!(
        distribution,
        Distribution::SearchGuard | Distribution::OpenDistro
    )
}

/// Keys that must be present in the certificate secret
pub fn required_keys(distribution: Distribution) -> Vec<&'static str> {
    let mut keys = vec![
        KEY_ROOT_CA,
        KEY_ROOT_KEY,
        KEY_NODE,
        KEY_NODE_KEY,
        KEY_CLIENT,
        KEY_CLIENT_KEY,
    ];
    if needs_admin_cert(distribution) {
        keys.extend([KEY_ADMIN, KEY_ADMIN_KEY]);
    }
    keys
}

/// Subject alternative names of the node certificate
pub fn node_sans(db_name: &str, namespace: &str) -> Vec<String> {
    let discovery = discovery_service_name(db_name);
    vec![
        db_name.to_string(),
        format!("{}.{}.svc", db_name, namespace),
        discovery.clone(),
        format!("*.{}.{}.svc", discovery, namespace),
        "localhost".to_string(),
    ]
}

fn dns_sans(names: &[String]) -> Result<Vec<SanType>> {
    names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| {
                    Error::CertificateError(format!("invalid DNS name '{}': {}", name, e))
                })
        })
        .collect()
}

fn leaf(
    common_name: &str,
    sans: &[String],
    usages: Vec<ExtendedKeyUsagePurpose>,
    issuer: &Issuer<'_, KeyPair>,
) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = usages;
    params.subject_alt_names = dns_sans(sans)?;
    let (not_before, not_after) = compute_validity();
    params.not_before = not_before;
    params.not_after = not_after;

    let key = rsa_key("failed to generate key")?;
    let cert = params
        .signed_by(&key, issuer)
        .map_err(cert_err("failed to sign certificate"))?;
    Ok((cert.pem(), key.serialize_pem()))
}

impl CertificateBundle {
    /// Generate a fresh CA and the leaf certificates signed by it
    pub fn generate(db_name: &str, namespace: &str, distribution: Distribution) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&format!("{}-root-ca", db_name));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        let ca_key = rsa_key("failed to generate CA key")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(cert_err("failed to create CA certificate"))?;
        let root_ca = ca_cert.pem();
        let root_key = ca_key.serialize_pem();
        let issuer = Issuer::from_ca_cert_pem(&root_ca, ca_key)
            .map_err(cert_err("failed to load CA issuer"))?;

        let (node, node_key) = leaf(
            "node",
            &node_sans(db_name, namespace),
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            &issuer,
        )?;
        let (client, client_key) = leaf(
            db_name,
            &[db_name.to_string(), format!("{}.{}.svc", db_name, namespace)],
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            &issuer,
        )?;
        let admin = if needs_admin_cert(distribution) {
            Some(leaf(
                "admin",
                &[],
                vec![ExtendedKeyUsagePurpose::ClientAuth],
                &issuer,
            )?)
        } else {
            None
        };

        Ok(Self {
            root_ca,
            root_key,
            node,
            node_key,
            client,
            client_key,
            admin,
        })
    }

    /// Read the bundle back from its secret
    ///
    /// Every key required by `distribution` must be present and non-empty.
    pub fn from_secret(secret: &Secret, distribution: Distribution) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            secret_value(secret, key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::CertificateError(format!("\"{}\" is missing in secret", key)))
        };
        let admin = if needs_admin_cert(distribution) {
            Some((get(KEY_ADMIN)?, get(KEY_ADMIN_KEY)?))
        } else {
            None
        };
        Ok(Self {
            root_ca: get(KEY_ROOT_CA)?,
            root_key: get(KEY_ROOT_KEY)?,
            node: get(KEY_NODE)?,
            node_key: get(KEY_NODE_KEY)?,
            client: get(KEY_CLIENT)?,
            client_key: get(KEY_CLIENT_KEY)?,
            admin,
        })
    }

    /// Secret contents keyed by the fixed file names
    pub fn to_string_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::from([
            (KEY_ROOT_CA.to_string(), self.root_ca.clone()),
            (KEY_ROOT_KEY.to_string(), self.root_key.clone()),
            (KEY_NODE.to_string(), self.node.clone()),
            (KEY_NODE_KEY.to_string(), self.node_key.clone()),
            (KEY_CLIENT.to_string(), self.client.clone()),
            (KEY_CLIENT_KEY.to_string(), self.client_key.clone()),
        ]);
        if let Some((cert, key)) = &self.admin {
            data.insert(KEY_ADMIN.to_string(), cert.clone());
            data.insert(KEY_ADMIN_KEY.to_string(), key.clone());
        }
        data
    }

    pub fn node_dn(&self) -> Result<String> {
        subject_dn(&self.node)
    }

    pub fn admin_dn(&self) -> Result<Option<String>> {
        self.admin
            .as_ref()
            .map(|(cert, _)| subject_dn(cert))
            .transpose()
    }
}

/// Subject distinguished name of a PEM certificate
pub fn subject_dn(cert_pem: &str) -> Result<String> {
    let parsed = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| Error::CertificateError(format!("failed to parse PEM: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(parsed.contents())
        .map_err(|e| Error::CertificateError(format!("failed to parse certificate: {}", e)))?;
    Ok(cert.subject().to_string())
}

/// Ensure the certificate secret exists and holds a complete bundle
pub async fn ensure_cert_secrets(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    distribution: Distribution,
) -> Result<Verb> {
    let ns = db.namespace().unwrap_or_default();
    let db_name = db.name_any();
    let name = db.spec.certificate_secret_name(&db_name);

    if let Some(existing) = client.get_secret(&ns, &name).await? {
        if db.spec.certificate_secret.is_none() {
            check_ownership(&existing.metadata, &db_name, "secret")?;
        }
        CertificateBundle::from_secret(&existing, distribution)?;
        return Ok(Verb::Unchanged);
    }
    if db.spec.certificate_secret.is_some() {
        return Err(Error::NotFound(format!(
            "certificate secret \"{}\" in namespace {}",
            name, ns
        )));
    }

    let bundle = CertificateBundle::generate(&db_name, &ns, distribution)?;
    let secret = Secret {
        metadata: object_meta(db, name.clone()),
        type_: Some("Opaque".to_string()),
        string_data: Some(bundle.to_string_data()),
        ..Default::default()
    };
    client.create_secret(&secret).await?;
    info!(secret = %name, "created certificate secret");
    Ok(Verb::Created)
}

/// Load the certificate bundle of `db`
pub async fn load_bundle(
    client: &dyn KubeClient,
    db: &Elasticsearch,
    distribution: Distribution,
) -> Result<CertificateBundle> {
    let ns = db.namespace().unwrap_or_default();
    let name = db.spec.certificate_secret_name(&db.name_any());
    let secret = client
        .get_secret(&ns, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("certificate secret \"{}\"", name)))?;
    CertificateBundle::from_secret(&secret, distribution)
}
