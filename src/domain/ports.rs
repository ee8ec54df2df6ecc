//! Domain Ports - Core trait definitions for the XCOPY populator
//!
//! These traits define the boundaries between the offload engine and the
//! systems it drives: vCenter/ESXi, the storage array, and the cluster-wide
//! host lock. Adapters implement these traits to provide concrete functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Disk Backing
// =============================================================================

/// Backing model of a vSphere virtual disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingKind {
    Vmdk,
    Rdm,
    VVol,
}

impl std::fmt::Display for BackingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackingKind::Vmdk => write!(f, "vmdk"),
            BackingKind::Rdm => write!(f, "rdm"),
            BackingKind::VVol => write!(f, "vvol"),
        }
    }
}

/// Classified backing of the source disk.
///
/// Derived once per invocation from the VM configuration and never re-read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiskBacking {
    /// File on a VMFS datastore; the containing LUN is resolved later
    Vmdk { device_name: String },
    /// Raw device mapping; `device_name` is the mapped LUN's device id
    Rdm { device_name: String },
    /// Array-managed virtual volume
    VVol { device_name: String, vvol_id: String },
}

impl DiskBacking {
    pub fn kind(&self) -> BackingKind {
        match self {
            DiskBacking::Vmdk { .. } => BackingKind::Vmdk,
            DiskBacking::Rdm { .. } => BackingKind::Rdm,
            DiskBacking::VVol { .. } => BackingKind::VVol,
        }
    }

    pub fn device_name(&self) -> &str {
        match self {
            DiskBacking::Vmdk { device_name }
            | DiskBacking::Rdm { device_name }
            | DiskBacking::VVol { device_name, .. } => device_name,
        }
    }
}

// =============================================================================
// vSphere Inventory Types
// =============================================================================

/// ESXi host currently running a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSystem {
    /// Managed object id, e.g. `host-17`
    pub moref: String,
    /// Host name as registered in vCenter
    pub name: String,
    /// Name of the datacenter containing the host
    pub datacenter: String,
}

impl HostSystem {
    /// Host name as a DNS-1123 label, suitable for lease names
    pub fn lease_id(&self) -> String {
        let mut id: String = self
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        id.truncate(63);
        id.trim_matches('-').to_string()
    }
}

/// Datastore reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub moref: String,
    pub name: String,
}

/// One row of esxcli output: field name to values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsxRow(pub BTreeMap<String, Vec<String>>);

impl EsxRow {
    /// Build a row from single-valued pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                .collect(),
        )
    }

    /// All values of a field joined into one string; empty if absent
    pub fn value(&self, key: &str) -> String {
        self.0.get(key).map(|v| v.join("")).unwrap_or_default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

// =============================================================================
// Kubernetes Types
// =============================================================================

/// Target persistent volume the populator writes into
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVolume {
    /// PV object name
    pub name: String,
    /// CSI `volumeHandle`
    pub volume_handle: String,
    /// CSI `volumeAttributes`
    pub volume_attributes: BTreeMap<String, String>,
}

// =============================================================================
// Array Types
// =============================================================================

/// Array-side identity of a LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunHandle {
    /// Array identifier (volume id, ldev id, LUN path)
    pub id: String,
    /// Human-readable name on the array
    pub name: String,
    /// SCSI device id as ESXi sees it (`naa.*` or `eui.*`)
    pub naa: String,
    /// Vendor-specific details carried between calls
    pub attributes: BTreeMap<String, String>,
}

impl LunHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, naa: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            naa: naa.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Device path of this LUN on an ESXi host
    pub fn device_path(&self) -> String {
        format!("/vmfs/devices/disks/{}", self.naa)
    }
}

/// A LUN presented to a set of initiators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunMapping {
    /// The mapped LUN
    pub lun: LunHandle,
    /// Initiator group / host / host set the LUN is presented through
    pub initiator_group: String,
    /// LUN id the ESXi host sees
    pub host_lun: u32,
    /// Made by this populator; mappings found in place are never unmapped
    #[serde(default)]
    pub created: bool,
}

/// Resolved source disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHandle {
    pub kind: BackingKind,
    pub lun: LunHandle,
}

/// How an adapter expects the host's initiators to be discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorSource {
    /// FC WWNs, iSCSI IQNs and NVMe NQNs of online HBAs
    HbaAdapters,
    /// PowerFlex SDC GUID from the `scini` module parameters
    SciniGuid,
}

/// Capabilities an adapter declares up front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Can resolve a VVol-backed source disk
    pub vvol_source: bool,
    pub initiator_source: InitiatorSource,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            vvol_source: false,
            initiator_source: InitiatorSource::HbaAdapters,
        }
    }
}

// =============================================================================
// vCenter Client Port
// =============================================================================

/// vCenter / ESXi operations used by the offload engine
#[async_trait]
pub trait VCenterClient: Send + Sync {
    /// Host currently running the VM
    async fn get_esx_by_vm(&self, vm_id: &str) -> Result<HostSystem>;

    /// Classify the backing of the VM disk matching `vmdk_path`
    async fn get_vm_disk_backing(&self, vm_id: &str, vmdk_path: &str) -> Result<DiskBacking>;

    /// Run an esxcli command on a host
    async fn run_esx_command(&self, host: &HostSystem, argv: &[String]) -> Result<Vec<EsxRow>>;

    /// Look up a datastore by name
    async fn get_datastore(&self, datacenter: &str, name: &str) -> Result<Datastore>;

    /// Release the session; best-effort
    async fn logout(&self);
}

pub type VCenterClientRef = Arc<dyn VCenterClient>;

/// Build an esxcli argv from string slices
pub fn esx_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Context handed to [`StorageAdapter::prepare_source`] for VMFS introspection
pub struct SourceProbe<'a> {
    pub vcenter: &'a dyn VCenterClient,
    pub host: &'a HostSystem,
    /// Datastore holding the source descriptor
    pub datastore: &'a str,
}

impl SourceProbe<'_> {
    /// Device id of the LUN backing the probe's VMFS datastore
    pub async fn vmfs_device(&self) -> Result<String> {
        let ds = self
            .vcenter
            .get_datastore(&self.host.datacenter, self.datastore)
            .await?;
        let rows = self
            .vcenter
            .run_esx_command(self.host, &esx_args(&["storage", "vmfs", "extent", "list"]))
            .await?;

        rows.iter()
            .find(|r| r.value("VolumeName") == ds.name)
            .map(|r| r.value("DeviceName"))
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::SourceUnresolvable {
                backend: "vmfs".into(),
                reason: format!("no VMFS extent found for datastore {}", ds.name),
            })
    }
}

// =============================================================================
// Storage Adapter Port
// =============================================================================

/// Vendor-specific storage array operations
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Resolve the target PV to the LUN backing it
    async fn resolve_lun(&self, pv: &PersistentVolume) -> Result<LunHandle>;

    /// Present `lun` to the initiators; idempotent
    async fn ensure_mapped(&self, lun: &LunHandle, initiators: &[String]) -> Result<LunMapping>;

    /// Resolve the source disk to an array LUN on this array
    async fn prepare_source(&self, disk: &DiskBacking, probe: &SourceProbe<'_>)
        -> Result<SourceHandle>;

    /// Undo a mapping made by `ensure_mapped`; idempotent, and a no-op for
    /// mappings that existed before `ensure_mapped` found them
    async fn unmap(&self, mapping: &LunMapping) -> Result<()>;

    /// Release anything `prepare_source` set up; idempotent
    async fn release_source(&self, source: &SourceHandle) -> Result<()>;

    /// Declared capabilities
    fn capabilities(&self) -> AdapterCapabilities;

    /// Substrings of clone errors worth retrying
    fn retryable_patterns(&self) -> Vec<String>;

    /// Get the backend name
    fn backend_name(&self) -> &str;
}

pub type StorageAdapterRef = Arc<dyn StorageAdapter>;

// =============================================================================
// Host Lock Port
// =============================================================================

/// Held slot of a per-host lock.
///
/// `lost` fires if the holder can no longer guarantee exclusivity; the
/// renewal task, if any, stops when the guard is dropped.
pub struct HostLockGuard {
    lost: CancellationToken,
    renewal: Option<tokio::task::JoinHandle<()>>,
}

impl HostLockGuard {
    pub fn new(lost: CancellationToken, renewal: Option<tokio::task::JoinHandle<()>>) -> Self {
        Self { lost, renewal }
    }

    /// Guard for a lock that can never be lost
    pub fn unconditional() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

/// Cluster-wide lock serialising heavy operations on one ESXi host
#[async_trait]
pub trait HostLock: Send + Sync {
    async fn acquire(&self, host_id: &str, cancel: &CancellationToken) -> Result<HostLockGuard>;
}

/// Lock that is always immediately granted
pub struct NoopHostLock;

#[async_trait]
impl HostLock for NoopHostLock {
    async fn acquire(&self, _host_id: &str, _cancel: &CancellationToken) -> Result<HostLockGuard> {
        Ok(HostLockGuard::unconditional())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_backing_kind() {
        let disk = DiskBacking::VVol {
            device_name: "[vvol-ds] vm/disk.vmdk".into(),
            vvol_id: "rfc4122.abc".into(),
        };
        assert_eq!(disk.kind(), BackingKind::VVol);
        assert_eq!(disk.device_name(), "[vvol-ds] vm/disk.vmdk");
        assert_eq!(disk.kind().to_string(), "vvol");
    }

    #[test]
    fn test_esx_row_value_joins() {
        let mut row = EsxRow::default();
        row.0
            .insert("message".into(), vec!["part one, ".into(), "part two".into()]);
        assert_eq!(row.value("message"), "part one, part two");
        assert_eq!(row.value("status"), "");
        assert!(!row.has("status"));
    }

    #[test]
    fn test_host_lease_id() {
        let host = HostSystem {
            moref: "host-1".into(),
            name: "ESX-01.Lab.Example.com".into(),
            datacenter: "dc1".into(),
        };
        assert_eq!(host.lease_id(), "esx-01-lab-example-com");
    }

    #[test]
    fn test_lun_device_path() {
        let lun = LunHandle::new("1", "vol1", "naa.600a0980abc");
        assert_eq!(lun.device_path(), "/vmfs/devices/disks/naa.600a0980abc");
    }
}
