//! VSphereXcopyVolumePopulator CRD
//!
//! Data source referenced by a PVC's `dataSourceRef`. The spec names the
//! source VM disk and the array holding both disks; the status carries the
//! populator's progress back to the user.

use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// VSphereXcopyVolumePopulator CRD
// =============================================================================

/// VSphereXcopyVolumePopulator asks for a vSphere disk to be copied into a
/// PVC by the storage array itself, without the data crossing any host.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "VSphereXcopyVolumePopulator",
    plural = "vspherexcopyvolumepopulators",
    status = "VSphereXcopyVolumePopulatorStatus",
    printcolumn = r#"{"name": "Vendor", "type": "string", "jsonPath": ".spec.storageVendorProduct"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Progress", "type": "integer", "jsonPath": ".status.progress"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereXcopyVolumePopulatorSpec {
    /// Name of the Secret (same namespace) holding vCenter and array credentials
    pub secret_ref: String,

    /// Array vendor and product
    pub storage_vendor_product: String,

    /// vCenter managed object reference (or inventory name) of the source VM
    pub vm_id: String,

    /// Datastore-qualified path of the source disk, e.g. `[ds1] vm/disk.vmdk`
    pub vmdk_path: String,
}

impl VSphereXcopyVolumePopulatorSpec {
    /// Parse `storageVendorProduct`
    pub fn vendor(&self) -> Result<StorageVendorProduct> {
        self.storage_vendor_product.parse()
    }
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Supported storage arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StorageVendorProduct {
    Vantara,
    Ontap,
    Primera3par,
    PureFlashArray,
    Powerflex,
    Powerstore,
    Powermax,
}

impl StorageVendorProduct {
    pub const ALL: [StorageVendorProduct; 7] = [
        StorageVendorProduct::Vantara,
        StorageVendorProduct::Ontap,
        StorageVendorProduct::Primera3par,
        StorageVendorProduct::PureFlashArray,
        StorageVendorProduct::Powerflex,
        StorageVendorProduct::Powerstore,
        StorageVendorProduct::Powermax,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageVendorProduct::Vantara => "vantara",
            StorageVendorProduct::Ontap => "ontap",
            StorageVendorProduct::Primera3par => "primera3par",
            StorageVendorProduct::PureFlashArray => "pureFlashArray",
            StorageVendorProduct::Powerflex => "powerflex",
            StorageVendorProduct::Powerstore => "powerstore",
            StorageVendorProduct::Powermax => "powermax",
        }
    }
}

impl std::fmt::Display for StorageVendorProduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageVendorProduct {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownVendor {
                value: s.to_string(),
            })
    }
}

/// Populator phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Locating,
    ResolvingSource,
    ResolvingTarget,
    Mapping,
    Rescanning,
    Cloning,
    Finalising,
    Succeeded,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Locating => "Locating",
            Phase::ResolvingSource => "ResolvingSource",
            Phase::ResolvingTarget => "ResolvingTarget",
            Phase::Mapping => "Mapping",
            Phase::Rescanning => "Rescanning",
            Phase::Cloning => "Cloning",
            Phase::Finalising => "Finalising",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state written by the populator pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VSphereXcopyVolumePopulatorStatus {
    /// Copy progress, 0-100
    #[serde(default)]
    pub progress: u8,

    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// Kind of the failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Failure message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether ESXi reported the copy as array-offloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xcopy_used: Option<bool>,

    /// Last status update
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_vendor_parse() {
        assert_eq!(
            "pureFlashArray".parse::<StorageVendorProduct>().unwrap(),
            StorageVendorProduct::PureFlashArray
        );
        assert_eq!(
            "ONTAP".parse::<StorageVendorProduct>().unwrap(),
            StorageVendorProduct::Ontap
        );
        assert_matches!(
            "netapp".parse::<StorageVendorProduct>(),
            Err(Error::UnknownVendor { .. })
        );
    }

    #[test]
    fn test_vendor_round_trips_through_display() {
        for v in StorageVendorProduct::ALL {
            assert_eq!(v.to_string().parse::<StorageVendorProduct>().unwrap(), v);
        }
    }

    #[test]
    fn test_spec_from_manifest() {
        let manifest = r#"
apiVersion: forklift.konveyor.io/v1beta1
kind: VSphereXcopyVolumePopulator
metadata:
  name: vm-42-disk-0
  namespace: migration
spec:
  secretRef: array-credentials
  storageVendorProduct: primera3par
  vmId: vm-42
  vmdkPath: "[ds1] foo/bar.vmdk"
"#;
        let cr: VSphereXcopyVolumePopulator = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(cr.spec.vm_id, "vm-42");
        assert_eq!(cr.spec.vendor().unwrap(), StorageVendorProduct::Primera3par);
        assert!(cr.status.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let status = VSphereXcopyVolumePopulatorStatus {
            progress: 42,
            phase: Phase::Cloning,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["progress"], 42);
        assert_eq!(json["phase"], "Cloning");
        assert!(json.get("error").is_none());
    }
}
