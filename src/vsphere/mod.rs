//! vCenter / ESXi Integration
//!
//! Everything the populator needs from vSphere:
//! - SOAP session and inventory lookups ([`VSphereClient`])
//! - esxcli execution on the host running the source VM
//! - virtual disk backing classification (VMDK / RDM / VVol)
//! - storage initiator discovery

pub mod client;
pub mod disk;
pub mod esxcli;
pub mod initiators;
pub mod soap;
pub mod vmdk;
mod xml;

pub use client::{VSphereClient, VSphereConfig};
pub use disk::{classify, normalize_disk_path, VirtualDiskInfo};
pub use vmdk::VmdkPath;
