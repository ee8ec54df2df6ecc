//! Populator Control Plane
//!
//! Everything between the CR and the array: credential resolution, the
//! vendor adapters, the offload state machine, the per-host lease lock, the
//! progress metrics and the runner that ties one invocation together.

pub mod backends;
pub mod credentials;
pub mod engine;
pub mod lease;
pub mod metrics;
pub mod runner;

pub use backends::AdapterFactory;
pub use credentials::{CredentialResolver, Credentials};
pub use engine::{EngineConfig, OffloadEngine, OffloadOutcome, OffloadRequest, ProgressUpdate};
pub use lease::{HostLeaseLock, LeaseConfig};
pub use metrics::ProgressMetrics;
pub use runner::{
    ClientFactory, ClusterGateway, DefaultClientFactory, KubeGateway, PopulatorRunner,
    RunnerConfig,
};
