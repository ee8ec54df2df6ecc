//! Storage Array Adapters
//!
//! One adapter per supported array, all behind [`StorageAdapter`]:
//! - NetApp ONTAP
//! - HPE 3PAR / Primera
//! - Pure FlashArray
//! - Hitachi Vantara
//! - Dell PowerFlex, PowerStore and PowerMax

pub mod fc;
pub mod ontap;
pub mod powerflex;
pub mod powermax;
pub mod powerstore;
pub mod primera3par;
pub mod pure;
pub mod rest;
pub mod vantara;

pub use ontap::{OntapAdapter, OntapConfig};
pub use powerflex::{PowerFlexAdapter, PowerFlexConfig};
pub use powermax::{PowerMaxAdapter, PowerMaxConfig};
pub use powerstore::{PowerStoreAdapter, PowerStoreConfig};
pub use primera3par::{Primera3ParAdapter, Primera3ParConfig};
pub use pure::{PureAdapter, PureConfig};
pub use vantara::{VantaraAdapter, VantaraConfig};

use crate::controlplane::credentials::StorageCredentials;
use crate::crd::StorageVendorProduct;
use crate::domain::ports::{DiskBacking, LunMapping, SourceProbe, StorageAdapterRef};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Initiator group / host set dedicated to the populator
pub const XCOPY_GROUP: &str = "xcopy-esxs";

/// Clone error substrings retried unless an adapter says otherwise
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] =
    &["reservation conflict", "busy", "temporarily unavailable"];

pub fn default_retryable_patterns() -> Vec<String> {
    DEFAULT_RETRYABLE_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Factory for creating storage array adapters
pub struct AdapterFactory;

impl AdapterFactory {
    /// Create the adapter for `vendor`.
    ///
    /// Only validates configuration; no array call is made until the first
    /// adapter operation.
    pub fn create(
        vendor: StorageVendorProduct,
        credentials: &StorageCredentials,
    ) -> Result<StorageAdapterRef> {
        info!(
            "Creating {} adapter for {}",
            vendor, credentials.hostname
        );

        let adapter: StorageAdapterRef = match vendor {
            StorageVendorProduct::Ontap => Arc::new(OntapAdapter::new(
                OntapConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::Primera3par => Arc::new(Primera3ParAdapter::new(
                Primera3ParConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::PureFlashArray => Arc::new(PureAdapter::new(
                PureConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::Vantara => Arc::new(VantaraAdapter::new(
                VantaraConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::Powerflex => Arc::new(PowerFlexAdapter::new(
                PowerFlexConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::Powerstore => Arc::new(PowerStoreAdapter::new(
                PowerStoreConfig::from_credentials(credentials)?,
            )?),
            StorageVendorProduct::Powermax => Arc::new(PowerMaxAdapter::new(
                PowerMaxConfig::from_credentials(credentials)?,
            )?),
        };
        Ok(adapter)
    }
}

// =============================================================================
// Mapping Bookkeeping
// =============================================================================

/// Mappings this adapter instance made and has not yet torn down.
///
/// Only those are ever unmapped: a mapping found already in place belongs to
/// someone else, and a second `unmap` of the same mapping is a no-op.
#[derive(Debug, Default)]
pub struct MappingLedger {
    owned: Mutex<HashSet<String>>,
}

impl MappingLedger {
    fn key(mapping: &LunMapping) -> String {
        format!("{}@{}", mapping.lun.id, mapping.initiator_group)
    }

    /// Stamp `mapping.created`. A mapping found in place still counts as ours
    /// when an earlier `ensure_mapped` of this instance made it.
    pub fn record_mapped(&self, mapping: &mut LunMapping, created_now: bool) {
        let key = Self::key(mapping);
        let mut owned = self.owned.lock();
        if created_now {
            owned.insert(key.clone());
        }
        mapping.created = owned.contains(&key);
    }

    pub fn owns(&self, mapping: &LunMapping) -> bool {
        self.owned.lock().contains(&Self::key(mapping))
    }

    pub fn record_unmapped(&self, mapping: &LunMapping) {
        self.owned.lock().remove(&Self::key(mapping));
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// SCSI device id of the LUN holding the source disk.
///
/// RDM disks name their device directly; VMDKs are looked up through the
/// datastore's VMFS extents.
pub async fn source_device(
    backend: &str,
    disk: &DiskBacking,
    probe: &SourceProbe<'_>,
) -> Result<String> {
    match disk {
        DiskBacking::Rdm { device_name } => Ok(device_name.clone()),
        DiskBacking::Vmdk { .. } => probe.vmfs_device().await,
        DiskBacking::VVol { vvol_id, .. } => Err(vvol_unsupported(backend, vvol_id)),
    }
}

pub fn vvol_unsupported(backend: &str, vvol_id: &str) -> Error {
    Error::SourceUnresolvable {
        backend: backend.to_string(),
        reason: format!(
            "source disk is VVol {} and {} cannot resolve VVol sources",
            vvol_id, backend
        ),
    }
}

/// Lowercase body of an `naa.` device id, `None` for other id schemes
pub fn naa_body(device: &str) -> Option<String> {
    let lower = device.trim().to_lowercase();
    lower
        .strip_prefix("naa.")
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}
