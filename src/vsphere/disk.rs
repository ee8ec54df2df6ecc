//! Virtual disk discovery and backing classification
//!
//! Reads the `VirtualDisk` entries of a VM's `config.hardware.device` and
//! decides whether the requested disk is a VMDK file, an RDM or a VVol.
//! VVol is decided solely by a non-empty `backingObjectId`; RDM by the
//! raw-disk-mapping backing subtype; everything else is VMDK.

use super::xml;
use crate::domain::ports::DiskBacking;
use crate::error::Result;
use tracing::{debug, warn};

const DISK_DEVICE_PREFIX: &str = "/vmfs/devices/disks/";

/// One `VirtualDisk` as reported by vCenter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDiskInfo {
    pub label: String,
    pub file_name: String,
    /// `xsi:type` of the backing, e.g. `VirtualDiskFlatVer2BackingInfo`
    pub backing_type: String,
    pub backing_object_id: Option<String>,
    pub device_name: Option<String>,
}

impl VirtualDiskInfo {
    pub fn is_raw_device_mapping(&self) -> bool {
        self.backing_type.contains("RawDiskMapping")
    }
}

/// Normalise a datastore path for comparison: no brackets, lowercase,
/// single spaces.
pub fn normalize_disk_path(path: &str) -> String {
    path.replace(['[', ']'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Extract the virtual disks from a `config.hardware.device` property response
pub fn parse_virtual_disks(response: &str) -> Result<Vec<VirtualDiskInfo>> {
    let doc = roxmltree::Document::parse(response)?;

    let disks = doc
        .descendants()
        .filter(|n| n.is_element() && xml::xsi_type(*n) == Some("VirtualDisk"))
        .filter_map(|device| {
            let backing = xml::child(device, "backing")?;
            Some(VirtualDiskInfo {
                label: xml::child(device, "deviceInfo")
                    .and_then(|info| xml::child_text(info, "label"))
                    .unwrap_or_default(),
                file_name: xml::child_text(backing, "fileName").unwrap_or_default(),
                backing_type: xml::xsi_type(backing).unwrap_or_default().to_string(),
                backing_object_id: xml::child_text(backing, "backingObjectId")
                    .filter(|s| !s.is_empty()),
                device_name: xml::child_text(backing, "deviceName").filter(|s| !s.is_empty()),
            })
        })
        .collect();

    Ok(disks)
}

/// Classify the disk matching `vmdk_path`.
///
/// Never fails: when no disk matches, the disk is treated as a plain VMDK so
/// the array adapter can still resolve it through VMFS.
pub fn classify(disks: &[VirtualDiskInfo], vmdk_path: &str) -> DiskBacking {
    let wanted = normalize_disk_path(vmdk_path);

    let Some(disk) = disks
        .iter()
        .find(|d| normalize_disk_path(&d.file_name) == wanted)
    else {
        warn!(
            "No virtual disk matches {}, falling back to VMDK classification",
            vmdk_path
        );
        return DiskBacking::Vmdk {
            device_name: vmdk_path.to_string(),
        };
    };

    debug!(
        "Matched {} ({}) with backing {}",
        disk.file_name, disk.label, disk.backing_type
    );

    if let Some(vvol_id) = &disk.backing_object_id {
        return DiskBacking::VVol {
            device_name: disk.file_name.clone(),
            vvol_id: vvol_id.clone(),
        };
    }

    if disk.is_raw_device_mapping() {
        let device = disk.device_name.as_deref().unwrap_or(&disk.file_name);
        return DiskBacking::Rdm {
            device_name: device
                .strip_prefix(DISK_DEVICE_PREFIX)
                .unwrap_or(device)
                .to_string(),
        };
    }

    DiskBacking::Vmdk {
        device_name: disk.file_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><RetrievePropertiesExResponse xmlns="urn:vim25"><returnval><objects>
<obj type="VirtualMachine">vm-42</obj>
<propSet><name>config.hardware.device</name><val xsi:type="ArrayOfVirtualDevice">
  <VirtualDevice xsi:type="VirtualIDEController"><key>200</key></VirtualDevice>
  <VirtualDevice xsi:type="VirtualDisk">
    <key>2000</key>
    <deviceInfo><label>Hard disk 1</label><summary>16 GB</summary></deviceInfo>
    <backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[ds1] foo/bar.vmdk</fileName><diskMode>persistent</diskMode></backing>
  </VirtualDevice>
  <VirtualDevice xsi:type="VirtualDisk">
    <key>2001</key>
    <deviceInfo><label>Hard disk 2</label></deviceInfo>
    <backing xsi:type="VirtualDiskRawDiskMappingVer1BackingInfo"><fileName>[ds1] foo/bar_1.vmdk</fileName><deviceName>/vmfs/devices/disks/naa.600abc</deviceName><compatibilityMode>physicalMode</compatibilityMode></backing>
  </VirtualDevice>
  <VirtualDevice xsi:type="VirtualDisk">
    <key>2002</key>
    <deviceInfo><label>Hard disk 3</label></deviceInfo>
    <backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[vvolDS] rfc4122.abc/bar_2.vmdk</fileName><backingObjectId>rfc4122.abc</backingObjectId></backing>
  </VirtualDevice>
</val></propSet></objects></returnval></RetrievePropertiesExResponse></soapenv:Body></soapenv:Envelope>"#;

    #[test]
    fn test_parse_virtual_disks() {
        let disks = parse_virtual_disks(DEVICES).unwrap();
        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].label, "Hard disk 1");
        assert_eq!(disks[0].file_name, "[ds1] foo/bar.vmdk");
        assert!(disks[1].is_raw_device_mapping());
        assert_eq!(disks[2].backing_object_id.as_deref(), Some("rfc4122.abc"));
    }

    #[test]
    fn test_classify_variants() {
        let disks = parse_virtual_disks(DEVICES).unwrap();

        assert_eq!(
            classify(&disks, "[ds1] foo/bar.vmdk"),
            DiskBacking::Vmdk {
                device_name: "[ds1] foo/bar.vmdk".into()
            }
        );
        assert_eq!(
            classify(&disks, "[ds1] foo/bar_1.vmdk"),
            DiskBacking::Rdm {
                device_name: "naa.600abc".into()
            }
        );
        assert_eq!(
            classify(&disks, "[vvolDS] rfc4122.abc/bar_2.vmdk"),
            DiskBacking::VVol {
                device_name: "[vvolDS] rfc4122.abc/bar_2.vmdk".into(),
                vvol_id: "rfc4122.abc".into()
            }
        );
    }

    #[test]
    fn test_classify_matches_case_and_spacing() {
        let disks = parse_virtual_disks(DEVICES).unwrap();
        let backing = classify(&disks, "[DS1]   Foo/Bar_1.VMDK");
        assert_eq!(backing.device_name(), "naa.600abc");
    }

    #[test]
    fn test_classify_unmatched_defaults_to_vmdk() {
        let backing = classify(&[], "[ds9] missing/disk.vmdk");
        assert_eq!(
            backing,
            DiskBacking::Vmdk {
                device_name: "[ds9] missing/disk.vmdk".into()
            }
        );
    }
}
