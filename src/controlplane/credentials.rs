//! Credential & Config Resolver
//!
//! Hydrates vCenter and storage array credentials from the referenced Secret
//! (read through the API or from a mounted directory). Every key can be
//! overridden by an environment variable of the same name.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Keys
// =============================================================================

pub mod keys {
    pub const GOVMOMI_HOSTNAME: &str = "GOVMOMI_HOSTNAME";
    pub const GOVMOMI_USERNAME: &str = "GOVMOMI_USERNAME";
    pub const GOVMOMI_PASSWORD: &str = "GOVMOMI_PASSWORD";
    pub const VSPHERE_INSECURE: &str = "VSPHERE_INSECURE";

    pub const STORAGE_HOSTNAME: &str = "STORAGE_HOSTNAME";
    pub const STORAGE_USERNAME: &str = "STORAGE_USERNAME";
    pub const STORAGE_PASSWORD: &str = "STORAGE_PASSWORD";
    pub const STORAGE_TOKEN: &str = "STORAGE_TOKEN";
    pub const STORAGE_SKIP_SSL_VERIFICATION: &str = "STORAGE_SKIP_SSL_VERIFICATION";

    pub const ONTAP_SVM: &str = "ONTAP_SVM";
    pub const PURE_CLUSTER_PREFIX: &str = "PURE_CLUSTER_PREFIX";
    pub const POWERFLEX_SYSTEM_ID: &str = "POWERFLEX_SYSTEM_ID";
    pub const POWERMAX_SYMMETRIX_ID: &str = "POWERMAX_SYMMETRIX_ID";
    pub const POWERMAX_PORT_GROUP_NAME: &str = "POWERMAX_PORT_GROUP_NAME";
    pub const STORAGE_ID: &str = "STORAGE_ID";
    pub const STORAGE_PORT: &str = "STORAGE_PORT";
    pub const HOSTGROUP_ID_LIST: &str = "HOSTGROUP_ID_LIST";

    /// Vendor keys carried through to the adapters untouched
    pub const VENDOR: &[&str] = &[
        ONTAP_SVM,
        PURE_CLUSTER_PREFIX,
        POWERFLEX_SYSTEM_ID,
        POWERMAX_SYMMETRIX_ID,
        POWERMAX_PORT_GROUP_NAME,
        STORAGE_ID,
        STORAGE_PORT,
        HOSTGROUP_ID_LIST,
    ];
}

// =============================================================================
// Credential Types
// =============================================================================

/// vCenter connection settings
#[derive(Debug)]
pub struct VSphereCredentials {
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    pub insecure: bool,
}

/// Storage array connection settings
#[derive(Debug)]
pub struct StorageCredentials {
    pub hostname: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub token: Option<SecretString>,
    pub skip_ssl_verification: bool,
    /// Vendor-specific keys (`ONTAP_SVM`, `POWERMAX_SYMMETRIX_ID`, ...)
    pub extra: BTreeMap<String, String>,
}

impl StorageCredentials {
    /// Credentials with username and password, no vendor keys
    pub fn basic(hostname: &str, username: &str, password: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            username: Some(username.to_string()),
            password: Some(SecretString::from(password.to_string())),
            token: None,
            skip_ssl_verification: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    /// A vendor key the selected adapter cannot work without
    pub fn require(&self, key: &str) -> Result<&str> {
        self.optional(key).ok_or_else(|| Error::MissingCredential {
            key: key.to_string(),
        })
    }

    pub fn optional(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Username and password; for arrays that cannot use a token
    pub fn user_password(&self) -> Result<(&str, &SecretString)> {
        let username = self
            .username
            .as_deref()
            .ok_or_else(|| Error::MissingCredential {
                key: keys::STORAGE_USERNAME.to_string(),
            })?;
        let password = self.password.as_ref().ok_or_else(|| Error::MissingCredential {
            key: keys::STORAGE_PASSWORD.to_string(),
        })?;
        Ok((username, password))
    }
}

/// Everything the populator needs to open its sessions
#[derive(Debug)]
pub struct Credentials {
    pub vsphere: VSphereCredentials,
    pub storage: StorageCredentials,
}

// =============================================================================
// Resolver
// =============================================================================

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolve credentials from Secret data plus environment overrides
#[derive(Clone)]
pub struct CredentialResolver {
    env: EnvLookup,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    /// Resolver reading overrides from the process environment
    pub fn new() -> Self {
        Self::with_env(|key| std::env::var(key).ok())
    }

    /// Resolver with a custom override lookup
    pub fn with_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            env: Arc::new(lookup),
        }
    }

    /// Resolver that ignores the environment
    pub fn without_env() -> Self {
        Self::with_env(|_| None)
    }

    /// Environment first, then the Secret; blank values count as unset
    fn lookup(&self, data: &BTreeMap<String, String>, key: &str) -> Option<String> {
        let non_blank = |v: String| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        (self.env)(key)
            .and_then(non_blank)
            .or_else(|| data.get(key).cloned().and_then(non_blank))
    }

    fn required(&self, data: &BTreeMap<String, String>, key: &str) -> Result<String> {
        self.lookup(data, key).ok_or_else(|| Error::MissingCredential {
            key: key.to_string(),
        })
    }

    fn flag(&self, data: &BTreeMap<String, String>, key: &str) -> bool {
        self.lookup(data, key)
            .map(|v| parse_bool(&v))
            .unwrap_or(false)
    }

    /// Validate and assemble credentials.
    ///
    /// Fails with the name of the first missing key; values never appear in
    /// errors or logs.
    pub fn resolve(&self, data: &BTreeMap<String, String>) -> Result<Credentials> {
        let vsphere = VSphereCredentials {
            hostname: self.required(data, keys::GOVMOMI_HOSTNAME)?,
            username: self.required(data, keys::GOVMOMI_USERNAME)?,
            password: SecretString::from(self.required(data, keys::GOVMOMI_PASSWORD)?),
            insecure: self.flag(data, keys::VSPHERE_INSECURE),
        };

        let hostname = self.required(data, keys::STORAGE_HOSTNAME)?;
        let token = self.lookup(data, keys::STORAGE_TOKEN).map(SecretString::from);
        let (username, password) = if token.is_some() {
            (
                self.lookup(data, keys::STORAGE_USERNAME),
                self.lookup(data, keys::STORAGE_PASSWORD)
                    .map(SecretString::from),
            )
        } else {
            (
                Some(self.required(data, keys::STORAGE_USERNAME)?),
                Some(SecretString::from(
                    self.required(data, keys::STORAGE_PASSWORD)?,
                )),
            )
        };

        let extra = keys::VENDOR
            .iter()
            .filter_map(|key| self.lookup(data, key).map(|v| (key.to_string(), v)))
            .collect::<BTreeMap<_, _>>();

        debug!(
            "Resolved credentials: vcenter={}, storage={}, vendor keys={:?}",
            vsphere.hostname,
            hostname,
            extra.keys().collect::<Vec<_>>()
        );

        Ok(Credentials {
            vsphere,
            storage: StorageCredentials {
                hostname,
                username,
                password,
                token,
                skip_ssl_verification: self.flag(data, keys::STORAGE_SKIP_SSL_VERIFICATION),
                extra,
            },
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y" | "on"
    )
}

// =============================================================================
// Secret Sources
// =============================================================================

/// Decoded string data of a Secret; non UTF-8 values are skipped
pub fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            if let Ok(s) = String::from_utf8(value.0.clone()) {
                out.insert(key.clone(), s);
            }
        }
    }
    if let Some(string_data) = &secret.string_data {
        out.extend(string_data.clone());
    }
    out
}

/// Read a Secret mounted as a directory, one file per key
pub async fn read_secret_dir(path: &Path) -> Result<BTreeMap<String, String>> {
    info!("Reading credentials from {}", path.display());

    let mut out = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if !tokio::fs::metadata(entry.path()).await?.is_file() {
            continue;
        }
        let value = tokio::fs::read_to_string(entry.path()).await?;
        out.insert(name, value);
    }
    Ok(out)
}
