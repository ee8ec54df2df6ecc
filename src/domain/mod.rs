//! Domain layer - Shared types and port definitions
//!
//! The offload engine only sees these traits; vCenter, the storage arrays and
//! the cluster-wide host lock plug in behind them.

pub mod ports;

pub use ports::*;
