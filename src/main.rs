//! vSphere XCOPY Volume Populator
//!
//! Populator pod entry point. Spawned by the volume-populator machinery for
//! one `VSphereXcopyVolumePopulator`; exits 0 once the target volume holds the
//! cloned disk, non-zero otherwise.
//!
//! Exit codes: 0 success, 1 failure, 2 invalid CR, 3 missing credentials.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vsphere_xcopy_populator::controlplane::{
    metrics, DefaultClientFactory, HostLeaseLock, KubeGateway, LeaseConfig,
};
use vsphere_xcopy_populator::{PopulatorRunner, ProgressMetrics, RunnerConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// vSphere XCOPY Volume Populator - array-offloaded disk copies into PVCs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the VSphereXcopyVolumePopulator
    #[arg(long, env = "CR_NAME")]
    cr_name: String,

    /// Namespace of the VSphereXcopyVolumePopulator
    #[arg(long, env = "CR_NAMESPACE")]
    cr_namespace: String,

    /// Path where the machinery mounted the target volume
    #[arg(long, env = "MOUNT_PATH", default_value = "/mnt/disk")]
    mount_path: PathBuf,

    /// Directory holding the credentials Secret, one file per key
    #[arg(long, env = "SECRET_PATH")]
    secret_path: Option<PathBuf>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8443")]
    metrics_addr: String,

    /// Name of the target PVC
    #[arg(long, env = "OWNER_NAME")]
    owner_name: Option<String>,

    /// UID of the target PVC
    #[arg(long, env = "OWNER_UID")]
    owner_uid: Option<String>,

    /// Namespace of the target PVC (defaults to the CR namespace)
    #[arg(long, env = "TARGET_NAMESPACE")]
    target_namespace: Option<String>,

    /// Mirror progress into the CR status subresource
    #[arg(long, env = "PATCH_STATUS", default_value_t = true, action = clap::ArgAction::Set)]
    patch_status: bool,

    /// Namespace holding the per-host rescan leases
    #[arg(long, env = "HOST_LEASE_NAMESPACE", default_value = "openshift-mtv")]
    host_lease_namespace: String,

    /// Run rescans without the per-host lease
    #[arg(long, env = "DISABLE_HOST_LEASE")]
    disable_host_lease: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    info!("Starting vSphere XCOPY Volume Populator");
    info!("  Version: {}", vsphere_xcopy_populator::VERSION);
    info!("  Populator: {}/{}", args.cr_namespace, args.cr_name);
    info!("  Mount path: {}", args.mount_path.display());
    info!("  Metrics: {}", args.metrics_addr);
    info!("  Host lease: {}", !args.disable_host_lease);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    // Start metrics server
    let registry = prometheus::default_registry().clone();
    let progress = ProgressMetrics::register(&registry).context("registering metrics")?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics address {}", args.metrics_addr))?;
    let metrics_shutdown = CancellationToken::new();
    let server_shutdown = metrics_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, registry, server_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default()
        .await
        .context("creating Kubernetes client")?;

    let mut config = RunnerConfig::new(&args.cr_namespace, &args.cr_name);
    config.target_namespace = args
        .target_namespace
        .clone()
        .unwrap_or_else(|| args.cr_namespace.clone());
    config.owner_name = args.owner_name.clone();
    config.owner_uid = args.owner_uid.clone();
    config.secret_path = args.secret_path.clone();
    config.patch_status = args.patch_status;

    let mut runner = PopulatorRunner::new(
        config,
        Arc::new(KubeGateway::new(client.clone())),
        Arc::new(DefaultClientFactory),
        progress,
    );
    if !args.disable_host_lease {
        let holder = std::env::var("HOSTNAME").unwrap_or_else(|_| args.cr_name.clone());
        runner = runner.with_host_lock(Arc::new(HostLeaseLock::new(
            client,
            LeaseConfig::new(&args.host_lease_namespace, &holder),
        )));
    }

    let code = match runner.run(&cancel).await {
        Ok(outcome) => {
            info!(
                "Population complete (xcopy used: {:?}, clone attempts: {})",
                outcome.xcopy_used, outcome.clone_attempts
            );
            0
        }
        Err(e) => {
            error!("Population failed: {}", e.status_message());
            e.exit_code()
        }
    };

    metrics_shutdown.cancel();
    Ok(code)
}

// =============================================================================
// Signals
// =============================================================================

fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => warn!("Received SIGTERM, cancelling"),
            _ = interrupt.recv() => warn!("Received SIGINT, cancelling"),
        }
        cancel.cancel();
    });
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=info", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
