//! NetApp ONTAP Adapter
//!
//! Drives the ONTAP REST API (`/api`). LUNs are mapped through the dedicated
//! `xcopy-esxs` igroup (os type `vmware`, protocol `mixed`).

use super::fc::{same_wwn, wwpn_from_adapter_id};
use super::rest::RestClient;
use super::{default_retryable_patterns, naa_body, source_device, MappingLedger, XCOPY_GROUP};
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

const BACKEND: &str = "ontap";

/// NAA vendor prefix of ONTAP LUNs
pub const ONTAP_PROVIDER_ID: &str = "600a0980";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the ONTAP adapter
#[derive(Debug)]
pub struct OntapConfig {
    /// Management LIF
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    /// SVM owning the LUNs; cluster-scoped lookups if unset
    pub svm: Option<String>,
    pub skip_tls_verify: bool,
}

impl OntapConfig {
    pub fn from_credentials(creds: &StorageCredentials) -> Result<Self> {
        let (username, password) = creds.user_password()?;
        Ok(Self {
            hostname: creds.hostname.clone(),
            username: username.to_string(),
            password: SecretString::from(password.expose_secret().to_string()),
            svm: creds.optional(keys::ONTAP_SVM).map(str::to_string),
            skip_tls_verify: creds.skip_ssl_verification,
        })
    }
}

// =============================================================================
// REST Payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct Records<T> {
    #[serde(default = "Vec::new")]
    records: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct Lun {
    uuid: String,
    name: String,
    #[serde(default)]
    serial_number: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Igroup {
    uuid: String,
    #[serde(default)]
    initiators: Vec<IgroupInitiator>,
}

#[derive(Debug, Clone, Deserialize)]
struct IgroupInitiator {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LunMap {
    logical_unit_number: u32,
}

// =============================================================================
// ONTAP Adapter
// =============================================================================

/// Adapter for NetApp ONTAP arrays
pub struct OntapAdapter {
    config: OntapConfig,
    rest: RestClient,
    ledger: MappingLedger,
}

impl OntapAdapter {
    /// Create a new ONTAP adapter
    pub fn new(config: OntapConfig) -> Result<Self> {
        let rest = RestClient::new(BACKEND, &config.hostname, config.skip_tls_verify)?;
        Ok(Self {
            config,
            rest,
            ledger: MappingLedger::default(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.rest
            .request(method, path)
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()))
    }

    fn svm_query(&self) -> Vec<(&'static str, String)> {
        self.config
            .svm
            .iter()
            .map(|svm| ("svm.name", svm.clone()))
            .collect()
    }

    async fn find_lun(&self, filter: (&str, &str)) -> Result<Option<Lun>> {
        let mut query = self.svm_query();
        query.push(("fields", "uuid,name,serial_number".into()));
        let request = self
            .request(Method::GET, "/api/storage/luns")
            .query(&[filter])
            .query(&query);
        let found: Records<Lun> = self.rest.send_json("get lun", request).await?;
        Ok(found.records.into_iter().next())
    }

    fn handle(lun: Lun) -> LunHandle {
        let naa = naa_from_serial(&lun.serial_number);
        LunHandle::new(lun.name.clone(), lun.name, naa)
            .with_attribute("uuid", lun.uuid)
            .with_attribute("serial", lun.serial_number)
    }

    async fn find_igroup(&self) -> Result<Option<Igroup>> {
        let mut query = self.svm_query();
        query.push(("name", XCOPY_GROUP.into()));
        query.push(("fields", "uuid,initiators".into()));
        let request = self
            .request(Method::GET, "/api/protocols/san/igroups")
            .query(&query);
        let found: Records<Igroup> = self.rest.send_json("get igroup", request).await?;
        Ok(found.records.into_iter().next())
    }

    async fn ensure_igroup(&self) -> Result<Igroup> {
        if let Some(igroup) = self.find_igroup().await? {
            return Ok(igroup);
        }

        info!("Creating ONTAP igroup: {}", XCOPY_GROUP);
        let mut body = json!({
            "name": XCOPY_GROUP,
            "os_type": "vmware",
            "protocol": "mixed",
        });
        if let Some(svm) = &self.config.svm {
            body["svm"] = json!({ "name": svm });
        }
        let request = self
            .request(Method::POST, "/api/protocols/san/igroups")
            .json(&body);
        self.rest.send("create igroup", request).await?;

        self.find_igroup()
            .await?
            .ok_or_else(|| Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: "create igroup".into(),
                reason: format!("igroup {} not found after creation", XCOPY_GROUP),
            })
    }

    async fn ensure_initiators(&self, igroup: &Igroup, initiators: &[String]) -> Result<()> {
        let mut present = 0usize;
        for initiator in initiators {
            let name = match ontap_initiator(initiator) {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping initiator {}: {}", initiator, e);
                    continue;
                }
            };
            if igroup.initiators.iter().any(|i| same_initiator(&i.name, &name)) {
                present += 1;
                continue;
            }

            debug!("Adding {} to igroup {}", name, XCOPY_GROUP);
            let request = self
                .request(
                    Method::POST,
                    &format!("/api/protocols/san/igroups/{}/initiators", igroup.uuid),
                )
                .json(&json!({ "records": [{ "name": name }] }));
            match self.rest.send("add initiator", request).await {
                Ok(_) => present += 1,
                Err(e) => warn!("Failed adding {} to igroup {}: {}", name, XCOPY_GROUP, e),
            }
        }

        if present == 0 {
            return Err(Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: "ensure igroup".into(),
                reason: format!("no initiator could be added to igroup {}", XCOPY_GROUP),
            });
        }
        Ok(())
    }

    async fn find_map(&self, lun_uuid: &str, igroup_uuid: &str) -> Result<Option<LunMap>> {
        let request = self
            .request(Method::GET, "/api/protocols/san/lun-maps")
            .query(&[
                ("lun.uuid", lun_uuid),
                ("igroup.uuid", igroup_uuid),
                ("fields", "logical_unit_number"),
            ]);
        let found: Records<LunMap> = self.rest.send_json("get lun map", request).await?;
        Ok(found.records.into_iter().next())
    }

    fn lun_uuid<'a>(&self, lun: &'a LunHandle) -> Result<&'a str> {
        lun.attribute("uuid").ok_or_else(|| Error::Internal(format!(
            "ONTAP LUN handle {} carries no uuid",
            lun.id
        )))
    }
}

#[async_trait]
impl StorageAdapter for OntapAdapter {
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle> {
        let path = lun_path_for(pv)?;
        info!("Resolving PV {} to ONTAP LUN {}", pv.name, path);

        let lun = self
            .find_lun(("name", &path))
            .await?
            .ok_or_else(|| Error::LunNotFound {
                backend: BACKEND.into(),
                identifier: path.clone(),
            })?;

        debug!("Found LUN {} with serial {}", lun.name, lun.serial_number);
        Ok(Self::handle(lun))
    }

    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping> {
        let lun_uuid = self.lun_uuid(lun)?;
        let igroup = self.ensure_igroup().await?;
        self.ensure_initiators(&igroup, initiators).await?;

        let (map, created) = match self.find_map(lun_uuid, &igroup.uuid).await? {
            Some(existing) => {
                debug!("LUN {} already mapped to {}", lun.name, XCOPY_GROUP);
                (existing, false)
            }
            None => {
                info!("Mapping LUN {} to igroup {}", lun.name, XCOPY_GROUP);
                let request = self
                    .request(Method::POST, "/api/protocols/san/lun-maps")
                    .json(&json!({
                        "lun": { "uuid": lun_uuid },
                        "igroup": { "uuid": igroup.uuid },
                    }));
                let response = self.rest.send_raw(request).await?;
                if response.status() == StatusCode::CONFLICT {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::MappingConflict {
                        backend: BACKEND.into(),
                        lun: lun.name.clone(),
                        reason: body,
                    });
                }
                self.rest.check("map lun", response).await?;
                let map = self
                    .find_map(lun_uuid, &igroup.uuid)
                    .await?
                    .ok_or_else(|| Error::BackendOperationFailed {
                        backend: BACKEND.into(),
                        operation: "map lun".into(),
                        reason: format!("mapping of {} not visible after creation", lun.name),
                    })?;
                (map, true)
            }
        };

        let mut mapping = LunMapping {
            lun: lun.clone().with_attribute("igroup_uuid", igroup.uuid),
            initiator_group: XCOPY_GROUP.into(),
            host_lun: map.logical_unit_number,
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
        let serial = serial_from_naa(&device).ok_or_else(|| Error::SourceUnresolvable {
            backend: BACKEND.into(),
            reason: format!("device {} is not an ONTAP LUN", device),
        })?;

        let lun = self
            .find_lun(("serial_number", &serial))
            .await?
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: BACKEND.into(),
                reason: format!("no LUN with serial {} on this array", serial),
            })?;

        info!("Source disk {} is on ONTAP LUN {}", disk.device_name(), lun.name);
        Ok(SourceHandle {
            kind: disk.kind(),
            lun: Self::handle(lun),
        })
    }

    async fn unmap(&self, mapping: &LunMapping) -> Result<()> {
        if !self.ledger.owns(mapping) {
            debug!("LUN {} not mapped by us or already unmapped", mapping.lun.name);
            return Ok(());
        }

        let lun_uuid = self.lun_uuid(&mapping.lun)?;
        let igroup_uuid = mapping.lun.attribute("igroup_uuid").ok_or_else(|| {
            Error::Internal(format!("mapping of {} carries no igroup", mapping.lun.id))
        })?;

        info!("Unmapping LUN {} from {}", mapping.lun.name, mapping.initiator_group);
        let request = self.request(
            Method::DELETE,
            &format!("/api/protocols/san/lun-maps/{}/{}", lun_uuid, igroup_uuid),
        );
        let response = self.rest.send_raw(request).await?;
        if response.status() != StatusCode::NOT_FOUND {
            self.rest.check("unmap lun", response).await?;
        }

        self.ledger.record_unmapped(mapping);
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        debug!("Nothing to release for ONTAP source {}", source.lun.name);
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

/// LUN path of a Trident PV.
///
/// `ontap-san-economy` volumes carry `internalID`
/// (`/svm/<svm>/flexvol/<vol>/lun/<lun>`); plain `ontap-san` volumes carry
/// `internalName` and use `lun0` in a dedicated FlexVol.
pub fn lun_path_for(pv: &PersistentVolume) -> Result<String> {
    if let Some(internal_id) = pv.volume_attributes.get("internalID") {
        return parse_internal_id(internal_id);
    }
    match pv.volume_attributes.get("internalName") {
        Some(name) if !name.is_empty() => Ok(format!("/vol/{}/lun0", name)),
        _ => Err(Error::LunNotFound {
            backend: BACKEND.into(),
            identifier: format!(
                "PV {} has neither internalID nor internalName attribute",
                pv.name
            ),
        }),
    }
}

/// `/svm/<svm>/flexvol/<vol>/lun/<lun>` to `/vol/<vol>/<lun>`
pub fn parse_internal_id(internal_id: &str) -> Result<String> {
    let invalid = |what: &str| Error::LunNotFound {
        backend: BACKEND.into(),
        identifier: format!("invalid internalID {}: missing {}", internal_id, what),
    };
    let (_, rest) = internal_id
        .split_once("/flexvol/")
        .ok_or_else(|| invalid("/flexvol/"))?;
    let (flexvol, lun) = rest.split_once("/lun/").ok_or_else(|| invalid("/lun/"))?;
    Ok(format!("/vol/{}/{}", flexvol, lun))
}

/// `naa.600a0980` followed by the hex of the serial's bytes
pub fn naa_from_serial(serial: &str) -> String {
    let hex: String = serial.bytes().map(|b| format!("{:02x}", b)).collect();
    format!("naa.{}{}", ONTAP_PROVIDER_ID, hex)
}

/// Inverse of [`naa_from_serial`]
pub fn serial_from_naa(device: &str) -> Option<String> {
    let body = naa_body(device)?;
    let hex = body.strip_prefix(ONTAP_PROVIDER_ID)?;
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// Initiator name as ONTAP stores it; FC adapters become colon WWPNs
fn ontap_initiator(adapter_id: &str) -> Result<String> {
    if adapter_id.starts_with("fc.") {
        wwpn_from_adapter_id(adapter_id).map(|w| w.to_lowercase())
    } else {
        Ok(adapter_id.to_string())
    }
}

fn same_initiator(a: &str, b: &str) -> bool {
    if a.contains(':') && b.contains(':') && !a.starts_with("iqn.") && !b.starts_with("iqn.") {
        return same_wwn(a, b);
    }
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn pv(attrs: &[(&str, &str)]) -> PersistentVolume {
        PersistentVolume {
            name: "pv-xyz".into(),
            volume_handle: "pvc-1".into(),
            volume_attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_parse_internal_id() {
        assert_eq!(
            parse_internal_id("/svm/svm0/flexvol/trident_lun_pool_abc/lun/pvc_123").unwrap(),
            "/vol/trident_lun_pool_abc/pvc_123"
        );
        assert!(parse_internal_id("/svm/svm0/vol/x/lun/y").is_err());
        assert!(parse_internal_id("/svm/svm0/flexvol/x/y").is_err());
    }

    #[test]
    fn test_lun_path_for() {
        assert_eq!(
            lun_path_for(&pv(&[("internalName", "trident_pvc_1")])).unwrap(),
            "/vol/trident_pvc_1/lun0"
        );
        assert_eq!(
            lun_path_for(&pv(&[
                ("internalName", "ignored"),
                ("internalID", "/svm/s/flexvol/v/lun/l")
            ]))
            .unwrap(),
            "/vol/v/l"
        );
        assert_matches!(lun_path_for(&pv(&[])), Err(Error::LunNotFound { .. }));
    }

    #[test]
    fn test_naa_serial_round_trip() {
        let naa = naa_from_serial("wpK4M?Xb8cPT");
        assert_eq!(naa, "naa.600a098077704b344d3f586238635054");
        assert_eq!(serial_from_naa(&naa).as_deref(), Some("wpK4M?Xb8cPT"));
        assert_eq!(serial_from_naa("naa.624a9370abcd"), None);
    }

    #[test]
    fn test_ontap_initiator() {
        assert_eq!(
            ontap_initiator("fc.20000025b5010a0f:20000025b5010b0f").unwrap(),
            "20:00:00:25:b5:01:0b:0f"
        );
        assert_eq!(
            ontap_initiator("iqn.1998-01.com.vmware:esx-1").unwrap(),
            "iqn.1998-01.com.vmware:esx-1"
        );
        assert!(same_initiator("20:00:00:25:B5:01:0B:0F", "20:00:00:25:b5:01:0b:0f"));
    }
}
