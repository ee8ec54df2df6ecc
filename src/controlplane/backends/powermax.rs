//! Dell PowerMax Adapter
//!
//! Unisphere only exposes a volume through a masking view, so each target
//! volume gets its own storage group and masking view, named after the volume
//! so a retried invocation finds what an earlier one created.

use super::rest::RestClient;
use super::{default_retryable_patterns, naa_body, source_device, MappingLedger};
use crate::controlplane::credentials::{keys, StorageCredentials};
use crate::domain::ports::{
    AdapterCapabilities, DiskBacking, LunHandle, LunMapping, PersistentVolume, SourceHandle,
    SourceProbe, StorageAdapter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

const BACKEND: &str = "powermax";

const API_ROOT: &str = "/univmax/restapi/100/sloprovisioning/symmetrix";

/// Configuration for the PowerMax adapter
#[derive(Debug)]
pub struct PowerMaxConfig {
    pub endpoint: String,
    pub username: String,
    pub password: SecretString,
    pub symmetrix_id: String,
    pub port_group: String,
    pub skip_tls_verify: bool,
}

impl PowerMaxConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let symmetrix_id = creds.require(keys::POWERMAX_SYMMETRIX_ID)?.to_string();
        let port_group = creds.require(keys::POWERMAX_PORT_GROUP_NAME)?.to_string();
        let (username, password) = creds.user_password()?;
        Ok(Self {
            endpoint: creds.hostname.clone(),
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            symmetrix_id,
            port_group,
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Volume {
    #[serde(rename = "volumeId")]
    volume_id: String,
    #[serde(default)]
    volume_identifier: Option<String>,
    #[serde(default)]
    wwn: String,
}

#[derive(Debug, Deserialize)]
struct PortGroup {
    #[serde(default)]
    port_group_protocol: String,
}

#[derive(Debug, Deserialize)]
struct HostList {
    #[serde(rename = "hostId", default)]
    host_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Host {
    #[serde(rename = "hostId")]
    host_id: String,
    #[serde(rename = "initiator", default)]
    initiators: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VolumeQuery {
    #[serde(rename = "resultList", default)]
    result_list: ResultList,
}

#[derive(Debug, Default, Deserialize)]
struct ResultList {
    #[serde(default)]
    result: Vec<VolumeRef>,
}

#[derive(Debug, Deserialize)]
struct VolumeRef {
    #[serde(rename = "volumeId")]
    volume_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct MaskingViewConnections {
    #[serde(rename = "maskingViewConnection", default)]
    connections: Vec<Connection>,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    host_lun_address: String,
}

/// Adapter for Dell PowerMax (Unisphere REST)
pub struct PowerMaxAdapter {
    config: PowerMaxConfig,
    rest: RestClient,
    ledger: MappingLedger,
}

impl PowerMaxAdapter {
    /// Create a new PowerMax adapter
    pub fn new(config: PowerMaxConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.endpoint, config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            ledger: MappingLedger::default(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.rest
            .request(
                method,
                &format!("{}/{}{}", API_ROOT, self.config.symmetrix_id, path),
            )
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()))
    }

    async fn exists(&self, operation: &str, path: &str) -> Result<bool> {
        let response = self.rest.send_raw(self.request(Method::GET, path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.rest.check(operation, response).await?;
        Ok(true)
    }

    async fn volume(&self, volume_id: &str) -> Result<Option<Volume>> {
        let response = self
            .rest
            .send_raw(self.request(Method::GET, &format!("/volume/{}", volume_id)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(self.rest.check("get volume", response).await?.json().await?))
    }

    async fn volume_ids(&self, query: &[(&str, &str)]) -> Result<Vec<String>> {
        let request = self.request(Method::GET, "/volume").query(query);
        let found: VolumeQuery = self.rest.send_json("query volumes", request).await?;
        Ok(found
            .result_list
            .result
            .into_iter()
            .map(|v| v.volume_id)
            .collect())
    }

    async fn host_for(&self, initiators: &[String]) -> Result<String> {
        let port_group: PortGroup = self
            .rest
            .send_json(
                "get port group",
                self.request(Method::GET, &format!("/portgroup/{}", self.config.port_group)),
            )
            .await?;
        let filtered = filter_by_protocol(initiators, &port_group.port_group_protocol);
        if filtered.is_empty() {
            return Err(Error::NoInitiators {
                host: format!(
                    "{} initiators among {:?}",
                    port_group.port_group_protocol, initiators
                ),
            });
        }
        debug!(
            "Initiators for {} port group {}: {:?}",
            port_group.port_group_protocol, self.config.port_group, filtered
        );

        let hosts: HostList = self
            .rest
            .send_json("list hosts", self.request(Method::GET, "/host"))
            .await?;
        for host_id in hosts.host_ids {
            let host: Host = self
                .rest
                .send_json(
                    "get host",
                    self.request(Method::GET, &format!("/host/{}", host_id)),
                )
                .await?;
            if host
                .initiators
                .iter()
                .any(|i| filtered.iter().any(|f| initiator_suffix_matches(f, i)))
            {
                info!("Initiators belong to PowerMax host {}", host.host_id);
                return Ok(host.host_id);
            }
        }

        Err(Error::MappingConflict {
            backend: BACKEND.into(),
            lun: String::new(),
            reason: format!("no PowerMax host owns any of the initiators {:?}", filtered),
        })
    }

    async fn ensure_storage_group(&self, storage_group: &str) -> Result<()> {
        if self
            .exists("get storage group", &format!("/storagegroup/{}", storage_group))
            .await?
        {
            debug!("Storage group {} exists", storage_group);
            return Ok(());
        }

        info!("Creating storage group {}", storage_group);
        let request = self.request(Method::POST, "/storagegroup").json(&json!({
            "storageGroupId": storage_group,
            "srpId": "None",
            "emulation": "FBA",
            "create_empty_storage_group": true,
        }));
        self.rest.send("create storage group", request).await?;
        Ok(())
    }

    async fn ensure_masking_view(&self, names: &XcopyNames, host_id: &str) -> Result<()> {
        if self
            .exists("get masking view", &format!("/maskingview/{}", names.masking_view))
            .await?
        {
            debug!("Masking view {} exists", names.masking_view);
            return Ok(());
        }

        info!(
            "Creating masking view {} for host {} on port group {}",
            names.masking_view, host_id, self.config.port_group
        );
        let request = self.request(Method::POST, "/maskingview").json(&json!({
            "maskingViewId": names.masking_view,
            "hostOrHostGroupSelection": {"useExistingHostParam": {"hostId": host_id}},
            "portGroupSelection": {"useExistingPortGroupParam": {"portGroupId": self.config.port_group}},
            "storageGroupSelection": {"useExistingStorageGroupParam": {"storageGroupId": names.storage_group}},
        }));
        let response = self.rest.send_raw(request).await?;
        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::MappingConflict {
                backend: BACKEND.into(),
                lun: names.storage_group.clone(),
                reason: body,
            });
        }
        self.rest.check("create masking view", response).await?;
        Ok(())
    }

    async fn host_lun(&self, names: &XcopyNames, volume_id: &str) -> Result<u32> {
        let request = self
            .request(
                Method::GET,
                &format!("/maskingview/{}/connections", names.masking_view),
            )
            .query(&[("volume_id", volume_id)]);
        let connections: MaskingViewConnections =
            self.rest.send_json("get masking view connections", request).await?;
        let address = connections
            .connections
            .first()
            .map(|c| c.host_lun_address.as_str())
            .unwrap_or_default();
        u32::from_str_radix(address, 16).map_err(|_| Error::BackendOperationFailed {
            backend: BACKEND.into(),
            operation: "get masking view connections".into(),
            reason: format!("volume {} has no host LUN address in {}", volume_id, names.masking_view),
        })
    }

    async fn edit_storage_group(&self, storage_group: &str, action: serde_json::Value) -> Result<()> {
        let request = self
            .request(Method::PUT, &format!("/storagegroup/{}", storage_group))
            .json(&json!({ "editStorageGroupActionParam": action }));
        self.rest.send("edit storage group", request).await?;
        Ok(())
    }

    /// DELETE tolerating objects that are already gone
    async fn delete(&self, operation: &str, path: &str) -> Result<()> {
        let response = self.rest.send_raw(self.request(Method::DELETE, path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("{}: {} already gone", operation, path);
            return Ok(());
        }
        self.rest.check(operation, response).await?;
        Ok(())
    }

    fn handle(volume: Volume) -> LunHandle {
        let name = volume
            .volume_identifier
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| volume.volume_id.clone());
        LunHandle::new(
            volume.volume_id,
            name,
            format!("naa.{}", volume.wwn.to_lowercase()),
        )
    }
}

#[async_trait]
impl StorageAdapter for PowerMaxAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let volume_id = volume_id_from_handle(&pv.volume_handle);
        let volume = self
            .volume(volume_id)
            .await?
            .filter(|v| !v.volume_id.is_empty())
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: volume_id.to_string(),
            })?;
        info!("PV {} is PowerMax volume {}", pv.name, volume.volume_id);
        Ok(Self::handle(volume))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let names = XcopyNames::for_volume(&lun.id);
        let host_id = self.host_for(initiators).await?;

        self.ensure_storage_group(&names.storage_group).await?;
        let members = self
            .volume_ids(&[("storageGroupId", names.storage_group.as_str())])
            .await?;
        let already_member = members.iter().any(|id| id == &lun.id);
        if already_member {
            debug!("Volume {} already in {}", lun.id, names.storage_group);
        } else {
            info!("Adding volume {} to {}", lun.id, names.storage_group);
            self.edit_storage_group(
                &names.storage_group,
                json!({"expandStorageGroupParam": {"addSpecificVolumeParam": {"volumeId": [lun.id]}}}),
            )
            .await?;
        }

        self.ensure_masking_view(&names, &host_id).await?;
        let host_lun = self.host_lun(&names, &lun.id).await?;

        let mut mapping = LunMapping {
            lun: lun.clone().with_attribute("host_id", host_id),
            initiator_group: names.masking_view,
            host_lun,
            created: false,
        };
        self.ledger.record_mapped(&mut mapping, !already_member);
        Ok(mapping)
    }

    async fn prepare_source(
        &self,
        disk: &DiskBacking,
        probe: &SourceProbe<'_>,
    ) -> Result<SourceHandle> {
        let device = source_device(BACKEND, disk, probe).await?;
        let wwn = naa_body(&device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} has no NAA id", device),
        })?;

        let unresolvable = || Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("no volume with wwn {} on {}", wwn, self.config.symmetrix_id),
        };
        let volume_id = self
            .volume_ids(&[("wwn", wwn.as_str())])
            .await?
            .into_iter()
            .next()
            .ok_or_else(unresolvable)?;
        let volume = self.volume(&volume_id).await?.ok_or_else(unresolvable)?;

        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(volume),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!("Volume {} not mapped by us or already unmapped", mapping.lun.id);
            return Ok(());
        }

        let names = XcopyNames::for_volume(&mapping.lun.id);
        info!("Deleting masking view {}", names.masking_view);
        self.delete("delete masking view", &format!("/maskingview/{}", names.masking_view))
            .await?;

        let members = self
            .volume_ids(&[("storageGroupId", names.storage_group.as_str())])
            .await
            .unwrap_or_default();
        if members.iter().any(|id| id == &mapping.lun.id) {
            info!("Removing volume {} from {}", mapping.lun.id, names.storage_group);
            self.edit_storage_group(
                &names.storage_group,
                json!({"removeVolumeParam": {"volumeId": [mapping.lun.id]}}),
            )
            .await?;
        }

        info!("Deleting storage group {}", names.storage_group);
        self.delete("delete storage group", &format!("/storagegroup/{}", names.storage_group))
            .await?;

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for PowerMax source {}", source.lun.id);
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

/// Storage group and masking view dedicated to one target volume
#[derive(Debug, Clone, PartialEq, Eq)]
struct XcopyNames {
    storage_group: String,
    masking_view: String,
}

impl XcopyNames {
    fn for_volume(volume_id: &str) -> Self {
        Self {
            storage_group: format!("xcopy-{}-SG", volume_id),
            masking_view: format!("xcopy-{}-MV", volume_id),
        }
    }
}

/// Volume id is the CSI handle suffix after the last `-`
pub fn volume_id_from_handle(handle: &str) -> &str {
    handle.rsplit('-').next().unwrap_or(handle)
}

fn filter_by_protocol(initiators: &[String], protocol: &str) -> Vec<String> {
    match protocol {
        "iSCSI" => initiators
            .iter()
            .filter(|i| i.to_lowercase().starts_with("iqn."))
            .cloned()
            .collect(),
        "SCSI_FC" => initiators
            .iter()
            .filter(|i| !i.to_lowercase().starts_with("iqn.") && i.contains(':'))
            .cloned()
            .collect(),
        other => {
            warn!("Unknown port group protocol {:?}, keeping all initiators", other);
            initiators.to_vec()
        }
    }
}

fn initiator_suffix_matches(initiator: &str, host_initiator: &str) -> bool {
    !host_initiator.is_empty()
        && initiator
            .to_lowercase()
            .ends_with(&host_initiator.to_lowercase())
}
