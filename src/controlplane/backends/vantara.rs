//! Hitachi Vantara Adapter
//!
//! Talks to the Configuration Manager REST API. LDEVs are presented by adding
//! LUN paths on `port,hostGroup` pairs, taken either from the
//! `HOSTGROUP_ID_LIST` key or from the array's port login table.

use super::fc::{same_wwn, wwpn_from_adapter_id};
use super::rest::RestClient;
use super::{default_retryable_patterns, source_device, MappingLedger};
use crate::controlplane::credentials::{keys, StorageCredentials};
use crate::domain::ports::{
    AdapterCapabilities, DiskBacking, LunHandle, LunMapping, PersistentVolume, SourceHandle,
    SourceProbe, StorageAdapter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BACKEND: &str = "vantara";

const DEFAULT_PORT: u16 = 443;
const SESSION_MAX_AGE: Duration = Duration::from_secs(25 * 60);
const JOB_POLL_LIMIT: u32 = 10;
const JOB_MAX_WAIT: Duration = Duration::from_secs(120);
/// LUN handle attribute listing the host group paths `ensure_mapped` added
const ADDED_PATHS: &str = "added_paths";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Vantara adapter
#[derive(Debug)]
pub struct VantaraConfig {
    pub hostname: String,
    pub port: u16,
    /// Storage device id the LDEVs live on
    pub storage_id: String,
    pub username: String,
    pub password: SecretString,
    /// Fixed `port,hostGroupNumber` pairs; port logins are used when empty
    pub host_groups: Vec<HostGroupId>,
    pub skip_tls_verify: bool,
}

impl VantaraConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let storage_id = creds.require(keys::STORAGE_ID)?.to_string();
        let port = match creds.optional(keys::STORAGE_PORT) {
            Some(p) => p.parse().map_err(|_| {
                Error::Configuration(format!("{} is not a port number: {}", keys::STORAGE_PORT, p))
            })?,
            None => DEFAULT_PORT,
        };
        let host_groups = match creds.optional(keys::HOSTGROUP_ID_LIST) {
            Some(list) => parse_host_group_list(list)?,
            None => Vec::new(),
        };
        let (username, password) = creds.user_password()?;

        Ok(Self {
            hostname: creds.hostname.clone(),
            port,
            storage_id,
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            host_groups,
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }

    fn base_url(&self) -> String {
        let host = self
            .hostname
            .trim_start_matches("https://")
            .trim_end_matches('/');
        format!("https://{}:{}/ConfigurationManager/v1/objects", host, self.port)
    }
}

/// `port,hostGroupNumber` pair, e.g. `CL1-A,3`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostGroupId {
    pub port_id: String,
    pub number: u32,
}

impl HostGroupId {
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::Configuration(format!("invalid host group id {:?}", value));
        let (port, number) = value.trim().split_once(',').ok_or_else(invalid)?;
        let number = number.trim().parse().map_err(|_| invalid())?;
        if port.trim().is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            port_id: port.trim().to_string(),
            number,
        })
    }
}

impl std::fmt::Display for HostGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.port_id, self.number)
    }
}

/// Parse `CL1-A,1:CL2-A,1`
pub fn parse_host_group_list(list: &str) -> Result<Vec<HostGroupId>> {
    list.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(HostGroupId::parse)
        .collect()
}

// =============================================================================
// REST Payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
    #[serde(rename = "sessionId")]
    session_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ldev {
    ldev_id: u32,
    #[serde(default)]
    naa_id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    ports: Vec<LdevPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LdevPort {
    port_id: String,
    host_group_number: u32,
    lun: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_id: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct PortLogins {
    #[serde(default)]
    data: Vec<PortEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortEntry {
    #[serde(default)]
    logins: Vec<Login>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Login {
    host_group_id: String,
    #[serde(default)]
    login_wwn: Option<String>,
    #[serde(default)]
    iscsi_name: Option<String>,
}

struct Session {
    id: u64,
    token: String,
    started: Instant,
}

// =============================================================================
// Vantara Adapter
// =============================================================================

/// Adapter for Hitachi Vantara arrays
pub struct VantaraAdapter {
    config: VantaraConfig,
    rest: RestClient,
    session: Mutex<Option<Session>>,
    ledger: MappingLedger,
}

impl VantaraAdapter {
    /// Create a new Vantara adapter
    pub fn new(config: VantaraConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.base_url(), config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            session: Mutex::new(None),
            ledger: MappingLedger::default(),
        })
    }

    async fn token(&self) -> Result<String> {
        let stale = {
            let session = self.session.lock();
            match session.as_ref() {
                Some(s) if s.started.elapsed() < SESSION_MAX_AGE => return Ok(s.token.clone()),
                Some(s) => Some((s.id, s.token.clone())),
                None => None,
            }
        };

        if let Some((id, token)) = stale {
            debug!("Discarding Vantara session {}", id);
            let request = self
                .rest
                .request(Method::DELETE, &format!("/sessions/{}", id))
                .header("Authorization", format!("Session {}", token))
                .json(&json!({}));
            if let Err(e) = self.rest.send("discard session", request).await {
                warn!("Failed to discard Vantara session {}: {}", id, e);
            }
        }

        let request = self
            .rest
            .request(Method::POST, "/sessions")
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()))
            .json(&json!({}));
        let created: SessionResponse = self.rest.send_json("create session", request).await?;
        info!("Vantara session {} established", created.session_id);

        let token = created.token.clone();
        *self.session.lock() = Some(Session {
            id: created.session_id,
            token: created.token,
            started: Instant::now(),
        });
        Ok(token)
    }

    async fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.token().await?;
        Ok(self
            .rest
            .request(method, path)
            .header("Authorization", format!("Session {}", token)))
    }

    async fn get_ldev(&self, ldev_id: &str) -> Result<Ldev> {
        let request = self.authed(Method::GET, &format!("/ldevs/{}", ldev_id)).await?;
        let response = self.rest.send_raw(request).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: ldev_id.to_string(),
            });
        }
        Ok(self.rest.check("get ldev", response).await?.json().await?)
    }

    /// Run a job-based call and wait for it to complete
    async fn run_job(&self, operation: &str, request: RequestBuilder) -> Result<()> {
        let request = request.header("Response-Job-Status", "Completed");
        let mut job: Job = self.rest.send_json(operation, request).await?;

        let mut wait = Duration::from_secs(1);
        let mut polls = 0;
        while job.status != "Completed" {
            if polls >= JOB_POLL_LIMIT {
                return Err(Error::BackendOperationFailed {
                    backend: BACKEND.into(),
                    operation: operation.into(),
                    reason: format!("job {} did not complete", job.job_id),
                });
            }
            tokio::time::sleep(wait).await;
            wait = (wait * 2).min(JOB_MAX_WAIT);
            polls += 1;

            let request = self.authed(Method::GET, &format!("/jobs/{}", job.job_id)).await?;
            job = self.rest.send_json("get job", request).await?;
            debug!("Vantara job {} status {}", job.job_id, job.status);
        }

        if job.state.eq_ignore_ascii_case("failed") {
            return Err(Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: operation.into(),
                reason: format!("job {} failed", job.job_id),
            });
        }
        Ok(())
    }

    async fn host_groups(&self, initiators: &[String]) -> Result<Vec<HostGroupId>> {
        if !self.config.host_groups.is_empty() {
            debug!("Using configured host groups {:?}", self.config.host_groups);
            return Ok(self.config.host_groups.clone());
        }

        let request = self
            .authed(Method::GET, "/ports")
            .await?
            .query(&[("detailInfoType", "logins")]);
        let ports: PortLogins = self.rest.send_json("get port logins", request).await?;

        let mut groups = Vec::new();
        for login in ports.data.iter().flat_map(|p| p.logins.iter()) {
            if !login_matches(login, initiators) {
                continue;
            }
            let group = HostGroupId::parse(&login.host_group_id)?;
            if !groups.contains(&group) {
                groups.push(group);
            }
        }

        if groups.is_empty() {
            return Err(Error::MappingConflict {
                backend: BACKEND.into(),
                lun: String::new(),
                reason: format!("no port login matches the initiators {:?}", initiators),
            });
        }
        info!("Host groups from port logins: {:?}", groups);
        Ok(groups)
    }

    fn handle(ldev: &Ldev, fallback_name: &str) -> LunHandle {
        let name = if ldev.label.is_empty() {
            fallback_name.to_string()
        } else {
            ldev.label.clone()
        };
        LunHandle::new(
            ldev.ldev_id.to_string(),
            name,
            format!("naa.{}", ldev.naa_id.to_lowercase()),
        )
    }
}

#[async_trait]
impl StorageAdapter for VantaraAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let handle = VolumeHandle::parse(&pv.volume_handle)?;
        info!(
            "PV {} is LDEV {} on storage {}",
            pv.name, handle.ldev_id, handle.storage_device_id
        );
        if handle.storage_device_id != self.config.storage_id {
            debug!(
                "Volume handle names storage {}, configured {}",
                handle.storage_device_id, self.config.storage_id
            );
        }

        let ldev = self.get_ldev(&handle.ldev_id).await?;
        Ok(Self::handle(&ldev, &handle.nickname).with_attribute("protocol", handle.protocol))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let groups = self.host_groups(initiators).await?;
        let existing = self.get_ldev(&lun.id).await?;

        let mut added = Vec::new();
        for group in &groups {
            if lun_on(&existing, group).is_some() {
                debug!("LDEV {} already has a path on {}", lun.id, group);
                continue;
            }
            info!("Adding path for LDEV {} on {}", lun.id, group);
            let request = self.authed(Method::POST, "/luns").await?.json(&json!({
                "ldevId": existing.ldev_id,
                "portId": group.port_id,
                "hostGroupNumber": group.number,
            }));
            self.run_job("add lun path", request).await?;
            added.push(group.to_string());
        }

        let ldev = self.get_ldev(&lun.id).await?;
        let host_lun = groups
            .first()
            .and_then(|g| lun_on(&ldev, g))
            .ok_or_else(|| Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: "add lun path".into(),
                reason: format!("LDEV {} has no path after mapping", lun.id),
            })?;

        let group_list = groups
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(":");
        let mut mapping = LunMapping {
            lun: lun.clone().with_attribute(ADDED_PATHS, added.join(":")),
            initiator_group: group_list,
            host_lun,
            created: false,
        };
        self.ledger.record_mapped(&mut mapping, !added.is_empty());
        Ok(mapping)
    }

    async fn prepare_source(
        &self,
        disk: &DiskBacking,
        probe: &SourceProbe<'_>,
    ) -> Result<SourceHandle> {
        let device = source_device(BACKEND, disk, probe).await?;
        let naa = super::naa_body(&device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} has no NAA id", device),
        })?;
        let ldev_id = ldev_id_from_naa(&naa).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} is not a Hitachi LDEV", device),
        })?;

        let ldev = self.get_ldev(&ldev_id.to_string()).await.map_err(|e| match e {
            Error::LunNotFound { .. } => Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("LDEV {} behind {} not on this array", ldev_id, device),
            },
            other => other,
        })?;
        if ldev.naa_id.to_lowercase() != naa {
            return Err(Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("LDEV {} reports NAA {}, expected {}", ldev_id, ldev.naa_id, naa),
            });
        }

        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(&ldev, &ldev_id.to_string()),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!("LDEV {} not mapped by us or already unmapped", mapping.lun.id);
            return Ok(());
        }

        // Paths that existed before ensure_mapped stay in place
        let added = mapping.lun.attribute(ADDED_PATHS).unwrap_or_default();
        let groups = parse_host_group_list(added)?;
        let ldev = self.get_ldev(&mapping.lun.id).await?;
        for group in &groups {
            let Some(lun) = lun_on(&ldev, group) else {
                warn!("LDEV {} has no path on {}", mapping.lun.id, group);
                continue;
            };
            info!("Deleting path {} lun {} of LDEV {}", group, lun, mapping.lun.id);
            let request = self
                .authed(Method::DELETE, &format!("/luns/{},{}", group, lun))
                .await?
                .json(&json!({}));
            self.run_job("delete lun path", request).await?;
        }

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for LDEV {}", source.lun.id);
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

// =============================================================================
// Helpers
// =============================================================================

/// CSI volume handle `01--<protocol>--<storageDeviceId>--<ldevId>--<nickname>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub protocol: String,
    pub storage_device_id: String,
    pub ldev_id: String,
    pub nickname: String,
}

impl VolumeHandle {
    pub fn parse(handle: &str) -> Result<Self> {
        let parts: Vec<&str> = handle.split("--").collect();
        match parts.as_slice() {
            ["01", protocol, storage, ldev, nickname] => Ok(Self {
                protocol: protocol.to_string(),
                storage_device_id: storage.to_string(),
                ldev_id: ldev.to_string(),
                nickname: nickname.to_string(),
            }),
            _ => Err(Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: format!("invalid volume handle {}", handle),
            }),
        }
    }
}

/// LDEV number encoded in the last four hex digits of a Hitachi NAA
fn ldev_id_from_naa(naa: &str) -> Option<u32> {
    if !naa.starts_with("60060e8") || naa.len() < 32 {
        return None;
    }
    u32::from_str_radix(&naa[naa.len() - 4..], 16).ok()
}

fn lun_on(ldev: &Ldev, group: &HostGroupId) -> Option<u32> {
    ldev.ports
        .iter()
        .find(|p| p.port_id == group.port_id && p.host_group_number == group.number)
        .map(|p| p.lun)
}

fn login_matches(login: &Login, initiators: &[String]) -> bool {
    initiators.iter().any(|initiator| {
        if initiator.starts_with("fc.") {
            match (wwpn_from_adapter_id(initiator), login.login_wwn.as_deref()) {
                (Ok(wwpn), Some(wwn)) => same_wwn(wwn, &wwpn),
                _ => false,
            }
        } else {
            login
                .iscsi_name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(initiator))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_handle_parse() {
        let handle = VolumeHandle::parse("01--fc--886000123456--1234--pvc-abc").unwrap();
        assert_eq!(handle.protocol, "fc");
        assert_eq!(handle.storage_device_id, "886000123456");
        assert_eq!(handle.ldev_id, "1234");
        assert_eq!(handle.nickname, "pvc-abc");

        assert!(VolumeHandle::parse("02--fc--886000123456--1234--pvc").is_err());
        assert!(VolumeHandle::parse("01--fc--1234").is_err());
    }

    #[test]
    fn test_host_group_list() {
        let groups = parse_host_group_list("CL1-A,1: CL2-A,12 :").unwrap();
        assert_eq!(
            groups,
            vec![
                HostGroupId {
                    port_id: "CL1-A".into(),
                    number: 1
                },
                HostGroupId {
                    port_id: "CL2-A".into(),
                    number: 12
                },
            ]
        );
        assert_eq!(groups[1].to_string(), "CL2-A,12");
        assert!(parse_host_group_list("CL1-A").is_err());
        assert!(parse_host_group_list("CL1-A,x").is_err());
    }

    #[test]
    fn test_ldev_id_from_naa() {
        assert_eq!(
            ldev_id_from_naa("60060e80123456000001234500001a2b"),
            Some(0x1a2b)
        );
        assert_eq!(ldev_id_from_naa("600a098077704b344d3f586238635054"), None);
    }

    #[test]
    fn test_login_matches() {
        let fc = Login {
            host_group_id: "CL1-A,1".into(),
            login_wwn: Some("21000024ff123456".into()),
            iscsi_name: None,
        };
        assert!(login_matches(
            &fc,
            &["fc.20000024ff123456:21000024FF123456".to_string()]
        ));
        assert!(!login_matches(&fc, &["iqn.1998-01.com.vmware:esx".to_string()]));

        let iscsi = Login {
            host_group_id: "CL3-A,2".into(),
            login_wwn: None,
            iscsi_name: Some("iqn.1998-01.com.vmware:esx".into()),
        };
        assert!(login_matches(&iscsi, &["iqn.1998-01.com.vmware:esx".to_string()]));
    }

    #[test]
    fn test_config_defaults_port() {
        let creds = StorageCredentials::basic("10.0.0.5", "admin", "secret")
            .with_extra(keys::STORAGE_ID, "886000123456");
        let config = VantaraConfig::from_credentials(&creds).unwrap();
        assert_eq!(config.port, 443);
        assert_eq!(
            config.base_url(),
            "https://10.0.0.5:443/ConfigurationManager/v1/objects"
        );
    }
}
