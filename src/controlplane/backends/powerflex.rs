//! Dell PowerFlex Adapter
//!
//! PowerFlex exposes volumes to ESXi through the SDC kernel module rather than
//! FC or iSCSI, so the initiators handed to this adapter are SDC GUIDs read
//! from the `scini` module parameters.

use super::rest::RestClient;
use super::{default_retryable_patterns, source_device, MappingLedger};
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
use tracing::{debug, info};

const BACKEND: &str = "powerflex";

/// PV attribute carrying the PowerFlex volume name
pub const VOLUME_NAME_ATTRIBUTE: &str = "Name";

const ESX_OS_TYPE: &str = "Esx";

/// Configuration for the PowerFlex adapter
#[derive(Debug)]
pub struct PowerFlexConfig {
    pub gateway: String,
    pub username: String,
    pub password: SecretString,
    pub system_id: String,
    pub skip_tls_verify: bool,
}

impl PowerFlexConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let system_id = creds.require(keys::POWERFLEX_SYSTEM_ID)?.to_string();
        let (username, password) = creds.user_password()?;
        Ok(Self {
            gateway: creds.hostname.clone(),
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            system_id,
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mapped_sdc_info: Option<Vec<MappedSdc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappedSdc {
    sdc_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sdc {
    id: String,
    #[serde(default)]
    sdc_guid: String,
    #[serde(default)]
    os_type: String,
    #[serde(default)]
    name: Option<String>,
}

impl Volume {
    fn mapped_to(&self, sdc_id: &str) -> bool {
        self.mapped_sdc_info
            .iter()
            .flatten()
            .any(|m| m.sdc_id == sdc_id)
    }
}

/// Adapter for Dell PowerFlex (ScaleIO gateway)
pub struct PowerFlexAdapter {
    config: PowerFlexConfig,
    rest: RestClient,
    token: Mutex<Option<String>>,
    ledger: MappingLedger,
}

impl PowerFlexAdapter {
    /// Create a new PowerFlex adapter
    pub fn new(config: PowerFlexConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.gateway, config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            token: Mutex::new(None),
            ledger: MappingLedger::default(),
        })
    }

    async fn login(&self) -> Result<String> {
        let request = self
            .rest
            .request(Method::GET, "/api/login")
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()));
        let token: String = self.rest.send_json("login", request).await?;
        info!("Logged in to PowerFlex gateway {}", self.rest.base_url());
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    /// Send with the gateway token, logging in again once on 401
    async fn call<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let cached = self.token.lock().clone();
        let token = match cached {
            Some(token) => token,
            None => self.login().await?,
        };
        let response = self
            .rest
            .send_raw(build().basic_auth(&self.config.username, Some(&token)))
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("PowerFlex token expired, logging in again");
        let token = self.login().await?;
        self.rest
            .send_raw(build().basic_auth(&self.config.username, Some(&token)))
            .await
    }

    async fn volume(&self, id: &str) -> Result<Option<Volume>> {
        let path = format!("/api/instances/Volume::{}", id);
        let response = self.call(|| self.rest.request(Method::GET, &path)).await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        Ok(Some(self.rest.check("get volume", response).await?.json().await?))
    }

    async fn volume_id_by_name(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .call(|| {
                self.rest
                    .request(Method::POST, "/api/types/Volume/instances/action/queryIdByKey")
                    .json(&json!({ "name": name }))
            })
            .await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        let id: String = self.rest.check("query volume id", response).await?.json().await?;
        Ok(Some(id))
    }

    async fn esx_sdc(&self, initiators: &[String]) -> Result<Sdc> {
        let path = format!("/api/instances/System::{}/relationships/Sdc", self.config.system_id);
        let response = self.call(|| self.rest.request(Method::GET, &path)).await?;
        let sdcs: Vec<Sdc> = self.rest.check("list sdcs", response).await?.json().await?;

        sdcs.into_iter()
            .filter(|s| s.os_type == ESX_OS_TYPE)
            .find(|s| initiators.iter().any(|i| i.eq_ignore_ascii_case(&s.sdc_guid)))
            .ok_or_else(|| Error::MappingConflict {
                backend: BACKEND.into(),
                lun: String::new(),
                reason: format!("no ESXi SDC registered with GUID in {:?}", initiators),
            })
    }

    fn handle(&self, volume: &Volume) -> LunHandle {
        LunHandle::new(
            volume.id.clone(),
            volume.name.clone(),
            device_id(&self.config.system_id, &volume.id),
        )
    }
}

#[async_trait]
impl StorageAdapter for PowerFlexAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let name = pv
            .volume_attributes
            .get(VOLUME_NAME_ATTRIBUTE)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: format!("PV {} has no {} attribute", pv.name, VOLUME_NAME_ATTRIBUTE),
            })?;

        let not_found = || Error::LunNotFound {
            backend: BACKEND.into(),
            identifier: name.clone(),
        };
        let id = self.volume_id_by_name(name).await?.ok_or_else(not_found)?;
        let volume = self.volume(&id).await?.ok_or_else(not_found)?;
        info!("PV {} is PowerFlex volume {} ({})", pv.name, volume.name, volume.id);
        Ok(self.handle(&volume))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let sdc = self.esx_sdc(initiators).await?;
        let volume = self.volume(&lun.id).await?.ok_or_else(|| Error::LunNotFound {
            backend: BACKEND.into(),
            identifier: lun.id.clone(),
        })?;

        let already_mapped = volume.mapped_to(&sdc.id);
        if already_mapped {
            debug!("Volume {} already mapped to SDC {}", lun.name, sdc.id);
        } else {
            info!(
                "Mapping volume {} to SDC {} ({})",
                lun.name,
                sdc.id,
                sdc.name.as_deref().unwrap_or("unnamed")
            );
            let path = format!("/api/instances/Volume::{}/action/addMappedSdc", lun.id);
            let response = self
                .call(|| {
                    self.rest.request(Method::POST, &path).json(&json!({
                        "sdcId": sdc.id,
                        "allowMultipleMappings": "TRUE",
                    }))
                })
                .await?;
            self.rest.check("map volume", response).await?;
        }

        let mut mapping = LunMapping {
            lun: lun.clone(),
            initiator_group: sdc.id,
            host_lun: 0,
            created: false,
        };
        self.ledger.record_mapped(&mut mapping, !already_mapped);
        Ok(mapping)
    }

    async fn prepare_source(
        &self,
        disk: &DiskBacking,
        probe: &SourceProbe<'_>,
    ) -> Result<SourceHandle> {
        let device = source_device(BACKEND, disk, probe).await?;
        let volume_id = volume_id_from_device(&self.config.system_id, &device).ok_or_else(|| {
            Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("device {} is not a volume of system {}", device, self.config.system_id),
            }
        })?;
        let volume = self
            .volume(&volume_id)
            .await?
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("volume {} not found", volume_id),
            })?;

        Ok(SourceHandle {
            kind: disk.kind(),
            lun: self.handle(&volume),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!(
                "Volume {} not mapped to {} by us or already unmapped",
                mapping.lun.name, mapping.initiator_group
            );
            return Ok(());
        }

        info!(
            "Unmapping volume {} from SDC {}",
            mapping.lun.name, mapping.initiator_group
        );
        let path = format!("/api/instances/Volume::{}/action/removeMappedSdc", mapping.lun.id);
        let response = self
            .call(|| {
                self.rest
                    .request(Method::POST, &path)
                    .json(&json!({ "sdcId": mapping.initiator_group }))
            })
            .await?;
        self.rest.check("unmap volume", response).await?;

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for PowerFlex source {}", source.lun.id);
        Ok(())
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            vvol_source: false,
            initiator_source: InitiatorSource::SciniGuid,
        }
    }

    fn retryable_patterns(&self) -> Vec<String> {
        default_retryable_patterns()
    }

    fn backend_name(&self) -> &str {
        BACKEND
    }
}

/// ESXi device id of a PowerFlex volume: `eui.<systemId><volumeId>`
pub fn device_id(system_id: &str, volume_id: &str) -> String {
    format!("eui.{}{}", system_id, volume_id).to_lowercase()
}

fn volume_id_from_device(system_id: &str, device: &str) -> Option<String> {
    let lower = device.trim().to_lowercase();
    lower
        .strip_prefix("eui.")?
        .strip_prefix(&system_id.to_lowercase())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
