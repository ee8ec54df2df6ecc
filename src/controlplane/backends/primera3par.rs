//! HPE 3PAR / Primera Adapter
//!
//! Talks to the WSAPI (`/api/v1`). ESXi initiators are registered as hosts
//! (persona 11, VMware) inside the `xcopy-esxs` host set, and target volumes
//! are exported to `set:xcopy-esxs` as VLUNs.

use super::fc::{parse_fc_adapter_id, same_wwn};
use super::rest::RestClient;
use super::{default_retryable_patterns, naa_body, source_device, MappingLedger, XCOPY_GROUP};
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
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BACKEND: &str = "primera3par";

const SESSION_HEADER: &str = "X-HP3PAR-WSAPI-SessionKey";

/// Host persona for VMware ESXi
const PERSONA_VMWARE: u32 = 11;

/// WSAPI error code for "host is already a member of the set"
const ERR_SET_MEMBER_EXISTS: i64 = 104;

/// Volume and host names are capped by the array
const MAX_NAME_LEN: usize = 31;

const MAX_HOST_LUN: u32 = 255;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the 3PAR / Primera adapter
#[derive(Debug)]
pub struct Primera3ParConfig {
    /// WSAPI endpoint, host name or full URL
    pub endpoint: String,
    pub username: String,
    pub password: SecretString,
    pub skip_tls_verify: bool,
    /// How long a session key is reused before logging in again
    pub session_ttl: Duration,
}

impl Primera3ParConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let (username, password) = creds.user_password()?;
        Ok(Self {
            endpoint: creds.hostname.clone(),
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            skip_tls_verify: creds.skip_ssl_verification,
            session_ttl: Duration::from_secs(180),
        })
    }
}

// =============================================================================
// WSAPI Payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct SessionKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct Members<T> {
    #[serde(default = "Vec::new")]
    members: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct Volume {
    name: String,
    #[serde(default)]
    id: i64,
    #[serde(default)]
    wwn: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Host {
    name: String,
    #[serde(rename = "FCPaths", default)]
    fc_paths: Vec<FcPath>,
    #[serde(rename = "iSCSIPaths", default)]
    iscsi_paths: Vec<IscsiPath>,
}

#[derive(Debug, Clone, Deserialize)]
struct FcPath {
    wwn: String,
}

#[derive(Debug, Clone, Deserialize)]
struct IscsiPath {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HostSet {
    #[serde(default)]
    setmembers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Vlun {
    #[serde(rename = "volumeName")]
    volume_name: String,
    lun: u32,
    hostname: String,
}

#[derive(Debug, Default, Deserialize)]
struct WsapiError {
    #[serde(default)]
    code: i64,
}

// =============================================================================
// 3PAR / Primera Adapter
// =============================================================================

/// Adapter for HPE 3PAR and Primera arrays
pub struct Primera3ParAdapter {
    config: Primera3ParConfig,
    rest: RestClient,
    session: Mutex<Option<(String, Instant)>>,
    ledger: MappingLedger,
}

impl Primera3ParAdapter {
    /// Create a new 3PAR / Primera adapter
    pub fn new(config: Primera3ParConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.endpoint, config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            session: Mutex::new(None),
            ledger: MappingLedger::default(),
        })
    }

    async fn login(&self) -> Result<String> {
        debug!("Opening WSAPI session as {}", self.config.username);
        let request = self
            .rest
            .request(Method::POST, "/api/v1/credentials")
            .json(&json!({
                "user": self.config.username,
                "password": self.config.password.expose_secret(),
            }));
        let session: SessionKey = self.rest.send_json("login", request).await?;
        *self.session.lock() = Some((session.key.clone(), Instant::now()));
        Ok(session.key)
    }

    async fn session_key(&self) -> Result<String> {
        let cached = self
            .session
            .lock()
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.config.session_ttl)
            .map(|(key, _)| key.clone());
        match cached {
            Some(key) => Ok(key),
            None => self.login().await,
        }
    }

    /// Send with the session key, logging in again once on 401
    async fn call<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let key = self.session_key().await?;
        let response = self.rest.send_raw(build().header(SESSION_HEADER, &key)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("WSAPI session expired, logging in again");
        *self.session.lock() = None;
        let key = self.login().await?;
        self.rest.send_raw(build().header(SESSION_HEADER, &key)).await
    }

    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        let path = format!("/api/v1/volumes/{}", urlencoding::encode(name));
        let response = self
            .call(|| self.rest.request(Method::GET, &path))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.rest.check("get volume", response).await?;
        Ok(Some(response.json().await?))
    }

    async fn list<T>(&self, operation: &str, path: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        let response = self.call(|| self.rest.request(Method::GET, path)).await?;
        let response = self.rest.check(operation, response).await?;
        let members: Members<T> = response.json().await?;
        Ok(members.members)
    }

    /// Find the array host owning any of the initiators, creating one if none does
    async fn ensure_host(&self, initiators: &[String]) -> Result<String> {
        let ids = HostInitiators::from_adapters(initiators);
        if ids.is_empty() {
            return Err(Error::NoInitiators {
                host: "(3PAR host)".into(),
            });
        }

        let hosts: Vec<Host> = self.list("list hosts", "/api/v1/hosts").await?;
        if let Some(host) = hosts.iter().find(|h| ids.matches(h)) {
            debug!("Initiators belong to 3PAR host {}", host.name);
            return Ok(host.name.clone());
        }

        let name = host_name_for(initiators);
        info!("Creating 3PAR host {} (persona {})", name, PERSONA_VMWARE);
        let mut body = json!({ "name": name, "persona": PERSONA_VMWARE });
        if !ids.fc_wwpns.is_empty() {
            body["FCWWNs"] = json!(ids.fc_wwpns);
        } else {
            body["iSCSINames"] = json!(ids.iscsi_names);
        }
        let response = self
            .call(|| self.rest.request(Method::POST, "/api/v1/hosts").json(&body))
            .await?;
        self.rest.check("create host", response).await?;
        Ok(name)
    }

    async fn ensure_host_set_member(&self, host: &str) -> Result<()> {
        let path = format!("/api/v1/hostsets/{}", XCOPY_GROUP);
        let response = self
            .call(|| self.rest.request(Method::GET, &path))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            info!("Creating 3PAR host set {} with {}", XCOPY_GROUP, host);
            let body = json!({ "name": XCOPY_GROUP, "setmembers": [host] });
            let response = self
                .call(|| self.rest.request(Method::POST, "/api/v1/hostsets").json(&body))
                .await?;
            self.rest.check("create host set", response).await?;
            return Ok(());
        }

        let set: HostSet = self.rest.check("get host set", response).await?.json().await?;
        if set.setmembers.iter().any(|m| m.eq_ignore_ascii_case(host)) {
            return Ok(());
        }

        debug!("Adding {} to host set {}", host, XCOPY_GROUP);
        let body = json!({ "action": 1, "setmembers": [host] });
        let response = self
            .call(|| self.rest.request(Method::PUT, &path).json(&body))
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let err: WsapiError = serde_json::from_str(&text).unwrap_or_default();
        if err.code == ERR_SET_MEMBER_EXISTS {
            return Ok(());
        }
        Err(self.rest.status_error("add host set member", status, &text))
    }

    async fn set_vluns(&self) -> Result<Vec<Vlun>> {
        let target = set_target();
        Ok(self
            .list::<Vlun>("list vluns", "/api/v1/vluns")
            .await?
            .into_iter()
            .filter(|v| v.hostname == target)
            .collect())
    }

    fn handle(volume: Volume) -> LunHandle {
        let naa = format!("naa.{}", volume.wwn.to_lowercase());
        LunHandle::new(volume.name.clone(), volume.name, naa)
            .with_attribute("volume_id", volume.id.to_string())
    }
}

#[async_trait]
impl StorageAdapter for Primera3ParAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let name = volume_name_for(&pv.name);
        info!("Resolving PV {} to 3PAR volume {}", pv.name, name);

        let volume = self
            .get_volume(&name)
            .await?
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: name.clone(),
            })?;
        Ok(Self::handle(volume))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let host = self.ensure_host(initiators).await?;
        self.ensure_host_set_member(&host).await?;

        let vluns = self.set_vluns().await?;
        let (host_lun, created) = match vluns.iter().find(|v| v.volume_name == lun.name) {
            Some(existing) => {
                debug!("Reusing VLUN {} for {}", existing.lun, lun.name);
                (existing.lun, false)
            }
            None => {
                let used: Vec<u32> = vluns.iter().map(|v| v.lun).collect();
                let host_lun = lowest_free_lun(&used).ok_or_else(|| Error::MappingConflict {
                    backend: BACKEND.into(),
                    lun: lun.name.clone(),
                    reason: format!("no free LUN id left on {}", set_target()),
                })?;

                info!("Exporting {} to {} as LUN {}", lun.name, set_target(), host_lun);
                let body = json!({
                    "volumeName": lun.name,
                    "lun": host_lun,
                    "hostname": set_target(),
                    "autoLun": false,
                });
                let response = self
                    .call(|| self.rest.request(Method::POST, "/api/v1/vluns").json(&body))
                    .await?;
                if response.status() == StatusCode::CONFLICT {
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::MappingConflict {
                        backend: BACKEND.into(),
                        lun: lun.name.clone(),
                        reason: text,
                    });
                }
                self.rest.check("create vlun", response).await?;
                (host_lun, true)
            }
        };

        let mut mapping = LunMapping {
            lun: lun.clone(),
            initiator_group: XCOPY_GROUP.into(),
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
        let device = source_device(BACKEND, disk, probe).await?;
        let wwn = naa_body(&device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} has no NAA identifier", device),
        })?;

        let volumes: Vec<Volume> = self.list("list volumes", "/api/v1/volumes").await?;
        let volume = volumes
            .into_iter()
            .find(|v| v.wwn.eq_ignore_ascii_case(&wwn))
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("no volume with WWN {} on this array", wwn),
            })?;

        info!("Source disk {} is on 3PAR volume {}", disk.device_name(), volume.name);
        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(volume),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!("VLUN for {} not exported by us or already removed", mapping.lun.name);
            return Ok(());
        }

        info!(
            "Removing VLUN {} of {} from {}",
            mapping.host_lun,
            mapping.lun.name,
            set_target()
        );
        let path = format!(
            "/api/v1/vluns/{},{},{}",
            urlencoding::encode(&mapping.lun.name),
            mapping.host_lun,
            urlencoding::encode(&set_target())
        );
        let response = self
            .call(|| self.rest.request(Method::DELETE, &path))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("VLUN for {} was already gone", mapping.lun.name);
        } else {
            self.rest.check("delete vlun", response).await?;
        }

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for 3PAR source {}", source.lun.name);
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

/// Initiators split by transport, as the WSAPI names them
#[derive(Debug, Default)]
struct HostInitiators {
    fc_wwpns: Vec<String>,
    iscsi_names: Vec<String>,
}

impl HostInitiators {
    fn from_adapters(initiators: &[String]) -> Self {
        let mut ids = Self::default();
        for initiator in initiators {
            if initiator.starts_with("fc.") {
                match parse_fc_adapter_id(initiator) {
                    Ok((_, wwpn)) => ids.fc_wwpns.push(wwpn),
                    Err(e) => warn!("Skipping initiator {}: {}", initiator, e),
                }
            } else if initiator.starts_with("iqn.") {
                ids.iscsi_names.push(initiator.clone());
            }
        }
        ids
    }

    fn is_empty(&self) -> bool {
        self.fc_wwpns.is_empty() && self.iscsi_names.is_empty()
    }

    fn matches(&self, host: &Host) -> bool {
        host.fc_paths
            .iter()
            .any(|p| self.fc_wwpns.iter().any(|w| same_wwn(w, &p.wwn)))
            || host
                .iscsi_paths
                .iter()
                .any(|p| self.iscsi_names.iter().any(|n| n.eq_ignore_ascii_case(&p.name)))
    }
}

/// VLUN target of the populator host set
pub fn set_target() -> String {
    format!("set:{}", XCOPY_GROUP)
}

/// The CSI driver names volumes after the PV, cut to the array limit
pub fn volume_name_for(pv_name: &str) -> String {
    pv_name.chars().take(MAX_NAME_LEN).collect()
}

/// Deterministic host name derived from the first initiator
pub fn host_name_for(initiators: &[String]) -> String {
    let seed: String = initiators
        .first()
        .map(|i| i.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        .unwrap_or_default();
    let prefix = "xcopy-";
    let room = MAX_NAME_LEN - prefix.len();
    let tail = &seed[seed.len().saturating_sub(room)..];
    format!("{}{}", prefix, tail.to_lowercase())
}

/// Lowest LUN id in 1..=255 not in `used`
pub fn lowest_free_lun(used: &[u32]) -> Option<u32> {
    (1..=MAX_HOST_LUN).find(|n| !used.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_truncated() {
        assert_eq!(
            volume_name_for("pvc-0d7a1b0e-5c55-4d55-9a7b-2c1f0c3e9b11"),
            "pvc-0d7a1b0e-5c55-4d55-9a7b-2c1"
        );
        assert_eq!(volume_name_for("short"), "short");
    }

    #[test]
    fn test_lowest_free_lun() {
        assert_eq!(lowest_free_lun(&[]), Some(1));
        assert_eq!(lowest_free_lun(&[1, 2, 4]), Some(3));
        let all: Vec<u32> = (1..=255).collect();
        assert_eq!(lowest_free_lun(&all), None);
    }

    #[test]
    fn test_host_name_for() {
        let name = host_name_for(&["fc.20000025b5010a0f:20000025b5010b0f".to_string()]);
        assert!(name.starts_with("xcopy-"));
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name.ends_with("20000025b5010b0f"));
    }

    #[test]
    fn test_host_initiators_match() {
        let ids = HostInitiators::from_adapters(&[
            "fc.20000025b5010a0f:20000025b5010b0f".to_string(),
            "nqn.2014-08.org.nvmexpress:uuid:1".to_string(),
        ]);
        assert_eq!(ids.fc_wwpns, vec!["20000025B5010B0F"]);
        let host = Host {
            name: "esx1".into(),
            fc_paths: vec![FcPath {
                wwn: "20000025B5010B0F".into(),
            }],
            iscsi_paths: vec![],
        };
        assert!(ids.matches(&host));
    }
}
