//! Dell PowerStore Adapter

use super::fc::{same_wwn, wwpn_from_adapter_id};
use super::rest::RestClient;
use super::{default_retryable_patterns, naa_body, source_device, MappingLedger};
use crate::controlplane::credentials::StorageCredentials;
use crate::domain::ports::{
    AdapterCapabilities, DiskBacking, LunHandle, LunMapping, PersistentVolume, SourceHandle,
    SourceProbe, StorageAdapter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

const BACKEND: &str = "powerstore";

/// PV attribute carrying the PowerStore volume name
pub const VOLUME_NAME_ATTRIBUTE: &str = "Name";

const TOKEN_HEADER: &str = "DELL-EMC-TOKEN";
const VOLUME_FIELDS: &str = "id,name,wwn";

/// Configuration for the PowerStore adapter
#[derive(Debug)]
pub struct PowerStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    pub skip_tls_verify: bool,
}

impl PowerStoreConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let (username, password) = creds.user_password()?;
        Ok(Self {
            hostname: creds.hostname.clone(),
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }

    fn base_url(&self) -> String {
        let host = self.hostname.trim_end_matches('/');
        if host.ends_with("/api/rest") {
            host.to_string()
        } else {
            format!("{}/api/rest", host)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Volume {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    wwn: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Host {
    id: String,
    name: String,
    #[serde(default)]
    initiators: Vec<HostInitiator>,
}

#[derive(Debug, Clone, Deserialize)]
struct HostInitiator {
    port_name: String,
    #[serde(default)]
    port_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HostVolumeMapping {
    host_id: String,
    #[serde(default)]
    logical_unit_number: u32,
}

/// Adapter for Dell PowerStore
pub struct PowerStoreAdapter {
    config: PowerStoreConfig,
    rest: RestClient,
    token: Mutex<Option<String>>,
    ledger: MappingLedger,
}

impl PowerStoreAdapter {
    /// Create a new PowerStore adapter
    pub fn new(config: PowerStoreConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.base_url(), config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            token: Mutex::new(None),
            ledger: MappingLedger::default(),
        })
    }

    fn base(&self, method: Method, path: &str) -> RequestBuilder {
        self.rest
            .request(method, path)
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()))
            .header("Application-Type", "MTV")
    }

    async fn login(&self) -> Result<String> {
        let response = self
            .rest
            .send("login", self.base(Method::GET, "/login_session"))
            .await?;
        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Authentication {
                system: BACKEND.into(),
                reason: format!("login response carried no {} header", TOKEN_HEADER),
            })?;
        info!("Logged in to PowerStore {}", self.rest.base_url());
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    /// Send with the CSRF token, logging in again once on 401/403
    async fn call<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let cached = self.token.lock().clone();
        let token = match cached {
            Some(token) => token,
            None => self.login().await?,
        };
        let response = self.rest.send_raw(build().header(TOKEN_HEADER, &token)).await?;
        if !matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(response);
        }

        debug!("PowerStore token rejected, logging in again");
        let token = self.login().await?;
        self.rest.send_raw(build().header(TOKEN_HEADER, &token)).await
    }

    async fn query<T>(&self, operation: &str, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        let response = self
            .call(|| self.base(Method::GET, path).query(query))
            .await?;
        Ok(self.rest.check(operation, response).await?.json().await?)
    }

    async fn host_for(&self, initiators: &[String]) -> Result<Host> {
        let hosts: Vec<Host> = self
            .query(
                "list hosts",
                "/host",
                &[("select", "id,name,initiators(port_name,port_type)")],
            )
            .await?;
        hosts
            .into_iter()
            .find(|h| h.initiators.iter().any(|i| initiator_matches(i, initiators)))
            .ok_or_else(|| Error::MappingConflict {
                backend: BACKEND.into(),
                lun: String::new(),
                reason: format!("no PowerStore host owns any of the initiators {:?}", initiators),
            })
    }

    async fn mappings(&self, volume_id: &str) -> Result<Vec<HostVolumeMapping>> {
        let filter = format!("eq.{}", volume_id);
        self.query(
            "get volume mappings",
            "/host_volume_mapping",
            &[
                ("volume_id", filter.as_str()),
                ("select", "host_id,logical_unit_number"),
            ],
        )
        .await
    }

    fn handle(volume: Volume) -> LunHandle {
        let naa = normalize_wwn(&volume.wwn);
        LunHandle::new(volume.id, volume.name, naa)
    }
}

#[async_trait]
impl StorageAdapter for PowerStoreAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let name = pv
            .volume_attributes
            .get(VOLUME_NAME_ATTRIBUTE)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: format!("PV {} has no {} attribute", pv.name, VOLUME_NAME_ATTRIBUTE),
            })?;

        let filter = format!("eq.{}", name);
        let volume = self
            .query::<Volume>(
                "get volume",
                "/volume",
                &[("name", filter.as_str()), ("select", VOLUME_FIELDS)],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: name.clone(),
            })?;

        info!("PV {} is PowerStore volume {} ({})", pv.name, volume.name, volume.id);
        Ok(Self::handle(volume))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let host = self.host_for(initiators).await?;

        let attached = self
            .mappings(&lun.id)
            .await?
            .into_iter()
            .any(|m| m.host_id == host.id);
        if attached {
            debug!("Volume {} already attached to host {}", lun.name, host.name);
        } else {
            info!("Attaching volume {} to host {}", lun.name, host.name);
            let path = format!("/host/{}/attach", host.id);
            let response = self
                .call(|| {
                    self.base(Method::POST, &path)
                        .json(&json!({ "volume_id": lun.id }))
                })
                .await?;
            self.rest.check("attach volume", response).await?;
        }

        let host_lun = self
            .mappings(&lun.id)
            .await?
            .into_iter()
            .find(|m| m.host_id == host.id)
            .map(|m| m.logical_unit_number)
            .ok_or_else(|| Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: "attach volume".into(),
                reason: format!("volume {} not attached to {} after attach", lun.name, host.name),
            })?;

        let mut mapping = LunMapping {
            lun: lun.clone().with_attribute("host_name", host.name),
            initiator_group: host.id,
            host_lun,
            created: false,
        };
        self.ledger.record_mapped(&mut mapping, !attached);
        Ok(mapping)
    }

    async fn prepare_source(
        &self,
        disk: &DiskBacking,
        probe: &SourceProbe<'_>,
    ) -> Result<SourceHandle> {
        let device = source_device(BACKEND, disk, probe).await?;
        let body = naa_body(&device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} has no NAA id", device),
        })?;

        let filter = format!("eq.naa.{}", body);
        let volume = self
            .query::<Volume>(
                "find source volume",
                "/volume",
                &[("wwn", filter.as_str()), ("select", VOLUME_FIELDS)],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("no volume with wwn naa.{} on this array", body),
            })?;

        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(volume),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!("Volume {} not attached by us or already detached", mapping.lun.name);
            return Ok(());
        }

        info!(
            "Detaching volume {} from host {}",
            mapping.lun.name,
            mapping.lun.attribute("host_name").unwrap_or(&mapping.initiator_group)
        );
        let path = format!("/host/{}/detach", mapping.initiator_group);
        let response = self
            .call(|| {
                self.base(Method::POST, &path)
                    .json(&json!({ "volume_id": mapping.lun.id }))
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("Host {} or its mapping is already gone", mapping.initiator_group);
        } else {
            self.rest.check("detach volume", response).await?;
        }

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for PowerStore source {}", source.lun.name);
        Ok(())
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    fn retryable_patterns(&self) -> Vec<String> {
        default_retryable_patterns()
    }

    fn backend_name(&self) -> &str {
        BACKEND
    }
}

/// Volume `wwn` as an ESXi device id; PowerStore already reports `naa.` ids
fn normalize_wwn(wwn: &str) -> String {
    let lower = wwn.trim().to_lowercase();
    if lower.starts_with("naa.") {
        lower
    } else {
        format!("naa.{}", lower)
    }
}

fn initiator_matches(host_initiator: &HostInitiator, initiators: &[String]) -> bool {
    initiators.iter().any(|initiator| {
        if initiator.starts_with("fc.") {
            if !host_initiator.port_type.is_empty() && host_initiator.port_type != "FC" {
                return false;
            }
            wwpn_from_adapter_id(initiator)
                .map(|wwpn| same_wwn(&host_initiator.port_name, &wwpn))
                .unwrap_or(false)
        } else {
            host_initiator.port_name.eq_ignore_ascii_case(initiator)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wwn() {
        assert_eq!(
            normalize_wwn("naa.68CCF09800A1B2C3"),
            "naa.68ccf09800a1b2c3"
        );
        assert_eq!(normalize_wwn("68ccf09800a1b2c3"), "naa.68ccf09800a1b2c3");
    }

    #[test]
    fn test_initiator_matches() {
        let fc = HostInitiator {
            port_name: "21:00:00:24:ff:12:34:56".into(),
            port_type: "FC".into(),
        };
        assert!(initiator_matches(
            &fc,
            &["fc.20000024ff123456:21000024ff123456".to_string()]
        ));

        let iscsi = HostInitiator {
            port_name: "iqn.1998-01.com.vmware:esx-1".into(),
            port_type: "iSCSI".into(),
        };
        assert!(initiator_matches(&iscsi, &["iqn.1998-01.com.vmware:esx-1".to_string()]));
        assert!(!initiator_matches(
            &iscsi,
            &["fc.20000024ff123456:21000024ff123456".to_string()]
        ));
    }

    #[test]
    fn test_base_url() {
        let creds = StorageCredentials::basic("https://ps.lab", "admin", "secret");
        let config = PowerStoreConfig::from_credentials(&creds).unwrap();
        assert_eq!(config.base_url(), "https://ps.lab/api/rest");
    }
}
