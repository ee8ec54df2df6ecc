//! Custom Resource Definitions for the XCOPY populator
//!
//! - VSphereXcopyVolumePopulator: the populator data source and its status

pub mod xcopy_populator;

pub use xcopy_populator::*;
