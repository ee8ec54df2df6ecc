//! vSphere XCOPY Volume Populator
//!
//! A Kubernetes volume populator that fills a freshly provisioned
//! PersistentVolume with the contents of a vSphere virtual disk by asking
//! ESXi to run a hardware-accelerated (XCOPY) clone on the storage array
//! that holds both disks. The data never crosses a host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Populator Runner                            │
//! │   CR + Secret ──► Credential Resolver ──► Offload Engine ──► Status  │
//! ├──────────────────────────────────┬───────────────────────────────────┤
//! │          vCenter Client          │          Storage Adapter          │
//! │   SOAP session, esxcli, disks    │   ONTAP, 3PAR/Primera, Pure,      │
//! │   initiators, vmkfstools clone   │   Vantara, PowerFlex, PowerStore, │
//! │                                  │   PowerMax                        │
//! └──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Runner, offload engine, vendor adapters, credentials
//! - [`vsphere`]: vCenter SOAP client and esxcli execution
//! - [`crd`]: The `VSphereXcopyVolumePopulator` custom resource
//! - [`domain`]: Shared types and port traits
//! - [`error`]: Error types, kinds and exit codes

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod vsphere;

// Re-export commonly used types
pub use controlplane::{
    AdapterFactory, CredentialResolver, EngineConfig, OffloadEngine, OffloadOutcome,
    OffloadRequest, PopulatorRunner, ProgressMetrics, RunnerConfig,
};

pub use crd::{
    Phase, StorageVendorProduct, VSphereXcopyVolumePopulator, VSphereXcopyVolumePopulatorSpec,
    VSphereXcopyVolumePopulatorStatus,
};

pub use domain::ports::{
    DiskBacking, HostLock, HostSystem, LunHandle, LunMapping, PersistentVolume, SourceHandle,
    StorageAdapter, VCenterClient,
};

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
