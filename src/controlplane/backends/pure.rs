//! Pure FlashArray Adapter
//!
//! Uses REST 2.x for everything except minting an API token from
//! username/password, which only the 1.x API offers. A FlashArray host can
//! belong to a single host group, so volumes are connected to the ESXi host
//! directly rather than through a group.

use super::fc::{same_wwn, wwpn_from_adapter_id};
use super::rest::RestClient;
use super::{default_retryable_patterns, naa_body, MappingLedger};
use crate::controlplane::credentials::{keys, StorageCredentials};
use crate::domain::ports::{
    AdapterCapabilities, DiskBacking, InitiatorSource, LunHandle, LunMapping, PersistentVolume,
    SourceHandle, SourceProbe, StorageAdapter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

const BACKEND: &str = "pureFlashArray";

/// NAA vendor prefix of FlashArray volumes
pub const FLASH_PROVIDER_ID: &str = "624a9370";

const VVOL_TAG_NAMESPACE: &str = "vasa-integration.purestorage.com";
const VVOL_TAG_KEY: &str = "PURE_VVOL_ID";
const CONNECTION_EXISTS: &str = "Connection already exists.";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Pure FlashArray adapter
#[derive(Debug)]
pub struct PureConfig {
    pub hostname: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Pre-issued API token; replaces username/password
    pub api_token: Option<SecretString>,
    /// Portworx cluster prefix used in volume names (`px_1234abcd`)
    pub cluster_prefix: String,
    pub skip_tls_verify: bool,
}

impl PureConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let cluster_prefix = creds.require(keys::PURE_CLUSTER_PREFIX)?.to_string();
        let api_token = creds
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string()));
        let (username, password) = match &api_token {
            Some(_) => (None, None),
            None => {
                let (u, p) = creds.user_password()?;
                (
                    Some(u.to_string()),
                    Some(SecretString::from(p.expose_secret().to_string())),
                )
            }
        };
        Ok(Self {
            hostname: creds.hostname.clone(),
            username,
            password,
            api_token,
            cluster_prefix,
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }
}

// =============================================================================
// REST Payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiVersions {
    #[serde(default)]
    version: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiToken {
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct Volume {
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    serial: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Host {
    name: String,
    #[serde(default)]
    iqns: Vec<String>,
    #[serde(default)]
    wwns: Vec<String>,
    #[serde(default)]
    nqns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Connection {
    #[serde(default)]
    lun: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct VolumeTag {
    resource: TagResource,
}

#[derive(Debug, Clone, Deserialize)]
struct TagResource {
    name: String,
}

/// Negotiated API versions and the 2.x session token
#[derive(Debug, Clone)]
struct Session {
    api_v2: String,
    auth_token: String,
}

// =============================================================================
// Pure Adapter
// =============================================================================

/// Adapter for Pure FlashArray
pub struct PureAdapter {
    config: PureConfig,
    rest: RestClient,
    session: Mutex<Option<Session>>,
    ledger: MappingLedger,
}

impl PureAdapter {
    /// Create a new FlashArray adapter
    pub fn new(config: PureConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.hostname, config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            session: Mutex::new(None),
            ledger: MappingLedger::default(),
        })
    }

    async fn login(&self) -> Result<Session> {
        let versions: ApiVersions = self
            .rest
            .send_json("api version", self.rest.request(Method::GET, "/api/api_version"))
            .await?;
        let (api_v1, api_v2) = latest_versions(&versions.version)?;
        info!("Using FlashArray API v{} (token) / v{} (operations)", api_v1, api_v2);

        let api_token = match &self.config.api_token {
            Some(token) => token.expose_secret().to_string(),
            None => {
                let request = self
                    .rest
                    .request(Method::POST, &format!("/api/{}/auth/apitoken", api_v1))
                    .json(&json!({
                        "username": self.config.username,
                        "password": self.config.password.as_ref().map(|p| p.expose_secret()),
                    }));
                let token: ApiToken = self.rest.send_json("get api token", request).await?;
                token.api_token
            }
        };

        let request = self
            .rest
            .request(Method::POST, &format!("/api/{}/login", api_v2))
            .header("api-token", api_token);
        let response = self.rest.send("login", request).await?;
        let auth_token = response
            .headers()
            .get("x-auth-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Authentication {
                system: BACKEND.into(),
                reason: "login response carried no x-auth-token header".into(),
            })?;

        let session = Session { api_v2, auth_token };
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    async fn session(&self) -> Result<Session> {
        let cached = self.session.lock().clone();
        match cached {
            Some(session) => Ok(session),
            None => self.login().await,
        }
    }

    /// Send a 2.x request; `build` gets the `/api/<version>` prefix
    async fn call<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let session = self.session().await?;
        let prefix = format!("/api/{}", session.api_v2);
        let response = self
            .rest
            .send_raw(build(&prefix).header("x-auth-token", &session.auth_token))
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("FlashArray session expired, logging in again");
        *self.session.lock() = None;
        let session = self.login().await?;
        let prefix = format!("/api/{}", session.api_v2);
        self.rest
            .send_raw(build(&prefix).header("x-auth-token", &session.auth_token))
            .await
    }

    async fn volumes(&self, query: &[(&str, &str)]) -> Result<Vec<Volume>> {
        let response = self
            .call(|p| {
                self.rest
                    .request(Method::GET, &format!("{}/volumes", p))
                    .query(query)
            })
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            // unknown ids and names come back as 400
            let body = response.text().await.unwrap_or_default();
            debug!("Volume query {:?} rejected: {}", query, body);
            return Ok(Vec::new());
        }
        let items: Items<Volume> = self.rest.check("get volumes", response).await?.json().await?;
        Ok(items.items)
    }

    async fn matching_host(&self, initiators: &[String]) -> Result<Host> {
        let response = self
            .call(|p| self.rest.request(Method::GET, &format!("{}/hosts", p)))
            .await?;
        let hosts: Items<Host> = self.rest.check("list hosts", response).await?.json().await?;

        hosts
            .items
            .into_iter()
            .find(|h| host_matches(h, initiators))
            .ok_or_else(|| Error::MappingConflict {
                backend: BACKEND.into(),
                lun: String::new(),
                reason: format!("no FlashArray host owns any of the initiators {:?}", initiators),
            })
    }

    async fn connection(&self, host: &str, volume: &str) -> Result<Option<Connection>> {
        let response = self
            .call(|p| {
                self.rest
                    .request(Method::GET, &format!("{}/connections", p))
                    .query(&[("host_names", host), ("volume_names", volume)])
            })
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        let items: Items<Connection> = self
            .rest
            .check("get connection", response)
            .await?
            .json()
            .await?;
        Ok(items.items.into_iter().next())
    }

    fn handle(volume: Volume) -> LunHandle {
        let naa = naa_from_serial(&volume.serial);
        LunHandle::new(volume.name.clone(), volume.name, naa)
            .with_attribute("volume_id", volume.id)
            .with_attribute("serial", volume.serial)
    }

    async fn volume_by_vvol(&self, vvol_id: &str) -> Result<Volume> {
        let filter = format!("key='{}' AND value='{}'", VVOL_TAG_KEY, vvol_id);
        let response = self
            .call(|p| {
                self.rest
                    .request(Method::GET, &format!("{}/volumes/tags", p))
                    .query(&[
                        ("resource_destroyed", "False"),
                        ("namespaces", VVOL_TAG_NAMESPACE),
                        ("filter", filter.as_str()),
                    ])
            })
            .await?;
        let tags: Items<VolumeTag> = self.rest.check("find vvol", response).await?.json().await?;
        let name = tags
            .items
            .into_iter()
            .next()
            .map(|t| t.resource.name)
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("no volume tagged with VVol id {}", vvol_id),
            })?;

        self.volumes(&[("names", &name)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("VVol volume {} not found", name),
            })
    }
}

#[async_trait]
impl StorageAdapter for PureAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        info!("Resolving PV {} on FlashArray", pv.name);

        let mut found = self.volumes(&[("ids", &pv.volume_handle)]).await?;
        if found.is_empty() {
            let name = volume_name_for(&self.config.cluster_prefix, &pv.name);
            debug!(
                "No volume with id {}, trying name {}",
                pv.volume_handle, name
            );
            found = self.volumes(&[("names", &name)]).await?;
        }

        let volume = found.into_iter().next().ok_or_else(|| Error::LunNotFound {
            backend: BACKEND.into(),
            identifier: pv.volume_handle.clone(),
        })?;
        Ok(Self::handle(volume))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let host = self.matching_host(initiators).await?;
        info!("Connecting host {} to volume {}", host.name, lun.name);

        let response = self
            .call(|p| {
                self.rest
                    .request(Method::POST, &format!("{}/connections", p))
                    .query(&[
                        ("host_names", host.name.as_str()),
                        ("volume_names", lun.name.as_str()),
                    ])
            })
            .await?;
        let status = response.status();
        let mut created = true;
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains(CONNECTION_EXISTS) {
                debug!("Host {} already connected to {}", host.name, lun.name);
                created = false;
            } else {
                return Err(self.rest.status_error("connect host", status, &body));
            }
        }

        let host_lun = self
            .connection(&host.name, &lun.name)
            .await?
            .map(|c| c.lun)
            .ok_or_else(|| Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: "connect host".into(),
                reason: format!("connection {} -> {} not visible", host.name, lun.name),
            })?;

        let mut mapping = LunMapping {
            lun: lun.clone(),
            initiator_group: host.name,
            host_lun,
            created: false,
        };
        self.ledger.record_mapped(&mut mapping, created);
        Ok(mapping)
    }

    async fn prepare_source(
        &self,
        disk: &DiskBacking,
        probe: &SourceProbe<'_>,
    ) -> Result<SourceHandle> {
        let volume = match disk {
            DiskBacking::VVol { vvol_id, .. } => self.volume_by_vvol(vvol_id).await?,
            DiskBacking::Rdm { device_name } => self.volume_by_device(device_name).await?,
            DiskBacking::Vmdk { .. } => {
                let device = probe.vmfs_device().await?;
                self.volume_by_device(&device).await?
            }
        };

        info!("Source disk {} is FlashArray volume {}", disk.device_name(), volume.name);
        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(volume),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!(
                "Connection {} -> {} not made by us or already removed",
                mapping.initiator_group, mapping.lun.name
            );
            return Ok(());
        }

        info!(
            "Disconnecting host {} from volume {}",
            mapping.initiator_group, mapping.lun.name
        );
        let response = self
            .call(|p| {
                self.rest
                    .request(Method::DELETE, &format!("{}/connections", p))
                    .query(&[
                        ("host_names", mapping.initiator_group.as_str()),
                        ("volume_names", mapping.lun.name.as_str()),
                    ])
            })
            .await?;
        self.rest.check("disconnect host", response).await?;

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for FlashArray source {}", source.lun.name);
        Ok(())
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            vvol_source: true,
            initiator_source: InitiatorSource::HbaAdapters,
        }
    }

    fn retryable_patterns(&self) -> Vec<String> {
        default_retryable_patterns()
    }

    fn backend_name(&self) -> &str {
        BACKEND
    }
}

impl PureAdapter {
    async fn volume_by_device(&self, device: &str) -> Result<Volume> {
        let serial = serial_from_naa(device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} is not a FlashArray volume", device),
        })?;
        let filter = format!("serial='{}'", serial);
        self.volumes(&[("filter", &filter)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("no volume with serial {} on this array", serial),
            })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Portworx volume name on the array
pub fn volume_name_for(cluster_prefix: &str, pv_name: &str) -> String {
    format!("{}-{}", cluster_prefix, pv_name)
}

pub fn naa_from_serial(serial: &str) -> String {
    format!("naa.{}{}", FLASH_PROVIDER_ID, serial.to_lowercase())
}

/// Volume serial (uppercase) of a FlashArray device id
pub fn serial_from_naa(device: &str) -> Option<String> {
    naa_body(device)?
        .strip_prefix(FLASH_PROVIDER_ID)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
}

/// Latest 1.x and 2.x versions offered by the array
fn latest_versions(versions: &[String]) -> Result<(String, String)> {
    let latest = |major: &str| {
        versions
            .iter()
            .filter(|v| v.split('.').next() == Some(major))
            .max_by_key(|v| version_key(v))
            .cloned()
    };
    match (latest("1"), latest("2")) {
        (Some(v1), Some(v2)) => Ok((v1, v2)),
        _ => Err(Error::BackendOperationFailed {
            backend: BACKEND.into(),
            operation: "api version".into(),
            reason: format!("array lacks a 1.x or 2.x API: {:?}", versions),
        }),
    }
}

fn version_key(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect()
}

fn host_matches(host: &Host, initiators: &[String]) -> bool {
    initiators.iter().any(|initiator| {
        if initiator.starts_with("fc.") {
            match wwpn_from_adapter_id(initiator) {
                Ok(wwpn) => host.wwns.iter().any(|w| same_wwn(w, &wwpn)),
                Err(e) => {
                    warn!("Skipping initiator {}: {}", initiator, e);
                    false
                }
            }
        } else {
            host.iqns
                .iter()
                .chain(host.nqns.iter())
                .any(|n| n.eq_ignore_ascii_case(initiator))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_versions() {
        let versions: Vec<String> = ["1.2", "1.19", "1.9", "2.4", "2.26", "2.10"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            latest_versions(&versions).unwrap(),
            ("1.19".to_string(), "2.26".to_string())
        );
        assert!(latest_versions(&["2.4".to_string()]).is_err());
    }

    #[test]
    fn test_naa_serial() {
        assert_eq!(naa_from_serial("F4252922ADE248CF"), "naa.624a9370f4252922ade248cf");
        assert_eq!(
            serial_from_naa("naa.624a9370f4252922ade248cf").as_deref(),
            Some("F4252922ADE248CF")
        );
        assert_eq!(serial_from_naa("naa.600a0980abc"), None);
        assert_eq!(serial_from_naa("naa.624a9370"), None);
    }

    #[test]
    fn test_volume_name_for() {
        assert_eq!(volume_name_for("px_1234abcd", "pvc-1"), "px_1234abcd-pvc-1");
    }

    #[test]
    fn test_host_matches() {
        let host = Host {
            name: "esx-1".into(),
            iqns: vec!["iqn.1998-01.com.vmware:esx-1".into()],
            wwns: vec!["21:00:00:24:FF:12:34:56".into()],
            nqns: vec![],
        };
        assert!(host_matches(&host, &["iqn.1998-01.com.vmware:ESX-1".to_string()]));
        assert!(host_matches(
            &host,
            &["fc.20000024ff123456:21000024ff123456".to_string()]
        ));
        assert!(!host_matches(&host, &["iqn.other".to_string()]));
    }
}
