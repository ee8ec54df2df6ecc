//! Offload Engine
//!
//! Composes the vCenter client and a storage adapter into the XCOPY state
//! machine:
//!
//! ```text
//! Locate -> ResolveSource -> ResolveTarget -> Map -> Rescan -> Clone -> Finalise -> Done
//! ```
//!
//! Every step after `ResolveSource` registers what it set up on a cleanup
//! ladder; whichever way the run ends, the ladder is walked in reverse
//! (Unmap, then ReleaseSource). Cancellation aborts the in-flight call of the
//! current step, except during `Clone`: an ESXi hardware clone cannot be
//! aborted, so a running attempt is waited for before cleaning up.

use crate::crd::Phase;
use crate::domain::ports::{
    esx_args, BackingKind, DiskBacking, HostLock, HostSystem, LunHandle, LunMapping,
    NoopHostLock, PersistentVolume, SourceHandle, SourceProbe, StorageAdapterRef,
    VCenterClientRef,
};
use crate::error::{Error, Result};
use crate::vsphere::{initiators, VmdkPath};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use regex::Regex;
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for one hardware clone attempt
    pub clone_timeout: Duration,
    /// Upper bound for any other esxcli call
    pub esxcli_timeout: Duration,
    /// Upper bound for a single storage adapter operation
    pub array_timeout: Duration,
    /// Retries of a clone failing with a retryable message
    pub clone_retries: u32,
    pub retry_initial_interval: Duration,
    pub retry_multiplier: f64,
    /// Interval between clone task polls
    pub task_poll_interval: Duration,
    /// `storage core device list` attempts after a rescan
    pub rescan_attempts: u32,
    pub rescan_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clone_timeout: Duration::from_secs(30 * 60),
            esxcli_timeout: Duration::from_secs(2 * 60),
            array_timeout: Duration::from_secs(5 * 60),
            clone_retries: 3,
            retry_initial_interval: Duration::from_secs(1),
            retry_multiplier: 4.0,
            task_poll_interval: Duration::from_secs(5),
            rescan_attempts: 5,
            rescan_interval: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Delays between clone attempts: 1 s, 4 s, 16 s with the defaults
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.retry_initial_interval,
            initial_interval: self.retry_initial_interval,
            randomization_factor: 0.0,
            multiplier: self.retry_multiplier,
            max_interval: Duration::from_secs(60 * 60),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

// =============================================================================
// Requests and Progress
// =============================================================================

/// One offload: copy the VM disk at `vmdk` into `target`
#[derive(Debug, Clone)]
pub struct OffloadRequest {
    pub vm_id: String,
    pub vmdk: VmdkPath,
    pub target: PersistentVolume,
}

/// Progress notification emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    /// 0-100, never decreasing within one run
    pub percent: u8,
    pub xcopy_used: Option<bool>,
}

/// Monotonic progress publisher.
///
/// Lower percentages than already reported are raised to the last value; a
/// dropped receiver is ignored.
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    current: ProgressUpdate,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            tx,
            current: ProgressUpdate {
                phase: Phase::Pending,
                percent: 0,
                xcopy_used: None,
            },
        }
    }

    pub fn phase(&mut self, phase: Phase) {
        if self.current.phase != phase {
            info!("Entering phase {}", phase);
            self.current.phase = phase;
            self.publish();
        }
    }

    pub fn percent(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent > self.current.percent {
            self.current.percent = percent;
            self.publish();
        }
    }

    pub fn xcopy_used(&mut self, used: bool) {
        if self.current.xcopy_used != Some(used) {
            self.current.xcopy_used = Some(used);
            self.publish();
        }
    }

    pub fn current(&self) -> ProgressUpdate {
        self.current
    }

    fn publish(&self) {
        let _ = self.tx.send(self.current);
    }
}

/// Result of a successful offload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadOutcome {
    pub xcopy_used: Option<bool>,
    /// Clone attempts made, retries included
    pub clone_attempts: u32,
    /// Cleanup failures that did not fail the run
    pub cleanup_errors: Vec<String>,
}

// =============================================================================
// Clone Task Protocol
// =============================================================================

#[derive(Debug, Deserialize)]
struct CloneStarted {
    #[serde(rename = "taskId")]
    task_id: String,
    #[serde(default)]
    pid: i64,
}

/// `vmkfstools taskget` reply
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneTaskStatus {
    /// Empty while the task runs
    #[serde(default)]
    pub exit_code: String,
    #[serde(default)]
    pub std_err: String,
    #[serde(default)]
    pub last_line: String,
    #[serde(default)]
    pub xcopy_used: Option<serde_json::Value>,
}

impl CloneTaskStatus {
    pub fn parse(message: &str) -> Result<Self> {
        Ok(serde_json::from_str(message.trim())?)
    }

    pub fn is_running(&self) -> bool {
        self.exit_code.trim().is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code.trim() == "0"
    }

    /// Clone progress from the last `NN%` in the output
    pub fn percent(&self) -> Option<u8> {
        parse_percent(&self.last_line)
    }

    pub fn xcopy_used(&self) -> Option<bool> {
        match self.xcopy_used.as_ref()? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_u64().map(|n| n != 0),
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn failure_message(&self) -> String {
        let message = if self.std_err.trim().is_empty() {
            self.last_line.trim()
        } else {
            self.std_err.trim()
        };
        format!("exit code {}: {}", self.exit_code.trim(), message)
    }
}

static PERCENT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s(\d+)%").ok());

/// Last `NN%` preceded by whitespace
pub fn parse_percent(line: &str) -> Option<u8> {
    PERCENT
        .as_ref()?
        .captures_iter(line)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
}

fn rows_message(rows: &[crate::domain::ports::EsxRow]) -> String {
    rows.iter().map(|r| r.value("message")).collect()
}

// =============================================================================
// Offload Engine
// =============================================================================

/// Array-side state set up so far, torn down in reverse
#[derive(Default)]
struct CleanupLadder {
    source: Option<SourceHandle>,
    mapping: Option<LunMapping>,
}

/// Drives one XCOPY offload
pub struct OffloadEngine {
    vcenter: VCenterClientRef,
    adapter: StorageAdapterRef,
    host_lock: Arc<dyn HostLock>,
    config: EngineConfig,
}

impl OffloadEngine {
    pub fn new(vcenter: VCenterClientRef, adapter: StorageAdapterRef, config: EngineConfig) -> Self {
        Self {
            vcenter,
            adapter,
            host_lock: Arc::new(NoopHostLock),
            config,
        }
    }

    /// Serialise rescans per ESXi host with `lock`
    pub fn with_host_lock(mut self, lock: Arc<dyn HostLock>) -> Self {
        self.host_lock = lock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the offload to completion.
    ///
    /// Progress goes to `progress` in monotonic order; the channel closes when
    /// this returns.
    pub async fn run(
        &self,
        request: &OffloadRequest,
        cancel: &CancellationToken,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<OffloadOutcome> {
        let mut reporter = ProgressReporter::new(progress);
        let mut ladder = CleanupLadder::default();

        info!(
            "Starting offload of {} (VM {}) into PV {} via {}",
            request.vmdk,
            request.vm_id,
            request.target.name,
            self.adapter.backend_name()
        );

        let result = self
            .offload(request, cancel, &mut reporter, &mut ladder)
            .await;

        match result {
            Ok((host, mut outcome)) => {
                reporter.phase(Phase::Finalising);
                if let Some(mapping) = ladder.mapping.take() {
                    if let Err(e) = self.unmap(&host, &mapping).await {
                        outcome.cleanup_errors.push(e.to_string());
                    }
                }
                reporter.percent(100);
                if let Some(source) = ladder.source.take() {
                    if let Err(e) = self.release_source(&source).await {
                        outcome.cleanup_errors.push(e.to_string());
                    }
                }
                reporter.phase(Phase::Succeeded);
                info!(
                    "Offload of {} finished after {} clone attempt(s)",
                    request.vmdk, outcome.clone_attempts
                );
                Ok(outcome)
            }
            Err((host, e)) => {
                error!("Offload of {} failed: {}", request.vmdk, e);
                if let (Some(host), Some(mapping)) = (host.as_ref(), ladder.mapping.take()) {
                    let _ = self.unmap(host, &mapping).await;
                }
                if let Some(source) = ladder.source.take() {
                    let _ = self.release_source(&source).await;
                }
                reporter.phase(Phase::Failed);
                Err(e)
            }
        }
    }

    async fn offload(
        &self,
        request: &OffloadRequest,
        cancel: &CancellationToken,
        reporter: &mut ProgressReporter,
        ladder: &mut CleanupLadder,
    ) -> std::result::Result<(HostSystem, OffloadOutcome), (Option<HostSystem>, Error)> {
        // Locate
        reporter.phase(Phase::Locating);
        let host = self
            .guarded(
                cancel,
                Phase::Locating,
                "get esx by vm",
                self.config.esxcli_timeout,
                self.vcenter.get_esx_by_vm(&request.vm_id),
            )
            .await
            .map_err(|e| (None, e))?;
        let fail = |e: Error| (Some(host.clone()), e);

        let disk = self
            .guarded(
                cancel,
                Phase::Locating,
                "get vm disk backing",
                self.config.esxcli_timeout,
                self.vcenter
                    .get_vm_disk_backing(&request.vm_id, request.vmdk.as_str()),
            )
            .await
            .map_err(fail)?;
        info!(
            "Disk {} of VM {} is {} backed, running on host {}",
            request.vmdk,
            request.vm_id,
            disk.kind(),
            host.name
        );

        // ResolveSource
        reporter.phase(Phase::ResolvingSource);
        let source = self
            .resolve_source(request, cancel, &host, &disk)
            .await
            .map_err(fail)?;
        info!("Source disk resolved to LUN {} ({})", source.lun.name, source.lun.naa);
        ladder.source = Some(source);

        // ResolveTarget
        reporter.phase(Phase::ResolvingTarget);
        let target = self
            .guarded(
                cancel,
                Phase::ResolvingTarget,
                "resolve lun",
                self.config.array_timeout,
                self.adapter.resolve_lun(&request.target),
            )
            .await
            .map_err(fail)?;
        info!(
            "PV {} resolved to LUN {} ({})",
            request.target.name, target.name, target.naa
        );

        // Map
        reporter.phase(Phase::Mapping);
        let mapping = self.map(cancel, &host, &target).await.map_err(fail)?;
        ladder.mapping = Some(mapping.clone());

        // Rescan
        reporter.phase(Phase::Rescanning);
        self.rescan_for(cancel, &host, &mapping.lun)
            .await
            .map_err(fail)?;

        // Clone
        reporter.phase(Phase::Cloning);
        reporter.percent(1);
        let outcome = self
            .clone_with_retry(cancel, &host, request, &mapping.lun, reporter)
            .await
            .map_err(fail)?;

        Ok((host, outcome))
    }

    /// Run `fut` unless cancelled first, bounded by `limit`
    async fn guarded<T, F>(
        &self,
        cancel: &CancellationToken,
        phase: Phase,
        operation: &str,
        limit: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled { phase: phase.to_string() }),
            r = tokio::time::timeout(limit, fut) => r.map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                after: limit,
            })?,
        }
    }

    async fn esxcli(
        &self,
        cancel: &CancellationToken,
        phase: Phase,
        host: &HostSystem,
        argv: &[&str],
    ) -> Result<Vec<crate::domain::ports::EsxRow>> {
        let argv = esx_args(argv);
        debug!("esxcli {} on {}", argv.join(" "), host.name);
        self.guarded(
            cancel,
            phase,
            &format!("esxcli {}", argv.join(" ")),
            self.config.esxcli_timeout,
            self.vcenter.run_esx_command(host, &argv),
        )
        .await
    }

    async fn resolve_source(
        &self,
        request: &OffloadRequest,
        cancel: &CancellationToken,
        host: &HostSystem,
        disk: &DiskBacking,
    ) -> Result<SourceHandle> {
        if disk.kind() == BackingKind::VVol && !self.adapter.capabilities().vvol_source {
            let vvol_id = match disk {
                DiskBacking::VVol { vvol_id, .. } => vvol_id.as_str(),
                _ => "",
            };
            return Err(crate::controlplane::backends::vvol_unsupported(
                self.adapter.backend_name(),
                vvol_id,
            ));
        }

        let probe = SourceProbe {
            vcenter: self.vcenter.as_ref(),
            host,
            datastore: request.vmdk.datastore(),
        };
        self.guarded(
            cancel,
            Phase::ResolvingSource,
            "prepare source",
            self.config.array_timeout,
            self.adapter.prepare_source(disk, &probe),
        )
        .await
    }

    async fn map(
        &self,
        cancel: &CancellationToken,
        host: &HostSystem,
        target: &LunHandle,
    ) -> Result<LunMapping> {
        let source = self.adapter.capabilities().initiator_source;
        let initiators = self
            .guarded(
                cancel,
                Phase::Mapping,
                "discover initiators",
                self.config.esxcli_timeout,
                initiators::discover(self.vcenter.as_ref(), host, source),
            )
            .await?;
        if initiators.is_empty() {
            return Err(Error::NoInitiators {
                host: host.name.clone(),
            });
        }

        let mapping = self
            .guarded(
                cancel,
                Phase::Mapping,
                "ensure mapped",
                self.config.array_timeout,
                self.adapter.ensure_mapped(target, &initiators),
            )
            .await?;
        info!(
            "LUN {} mapped through {} as host LUN {}",
            mapping.lun.name, mapping.initiator_group, mapping.host_lun
        );
        Ok(mapping)
    }

    /// Rescan under the host lock until ESXi sees the mapped device
    async fn rescan_for(
        &self,
        cancel: &CancellationToken,
        host: &HostSystem,
        lun: &LunHandle,
    ) -> Result<()> {
        let guard = self.host_lock.acquire(&host.lease_id(), cancel).await?;
        let lost = guard.lost().clone();

        tokio::select! {
            biased;
            _ = lost.cancelled() => Err(Error::LeaseUnavailable {
                host: host.name.clone(),
                reason: "lease lost during rescan".into(),
            }),
            r = self.rescan(cancel, host, lun) => r,
        }
    }

    async fn rescan(
        &self,
        cancel: &CancellationToken,
        host: &HostSystem,
        lun: &LunHandle,
    ) -> Result<()> {
        self.esxcli(
            cancel,
            Phase::Rescanning,
            host,
            &["storage", "core", "adapter", "rescan", "--all"],
        )
        .await?;

        for attempt in 1..=self.config.rescan_attempts {
            match self
                .esxcli(
                    cancel,
                    Phase::Rescanning,
                    host,
                    &["storage", "core", "device", "list", "-d", &lun.naa],
                )
                .await
            {
                Ok(_) => {
                    info!("Device {} visible on {}", lun.naa, host.name);
                    return Ok(());
                }
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    debug!(
                        "Device {} not visible yet ({}/{}): {}",
                        lun.naa, attempt, self.config.rescan_attempts, e
                    );
                }
            }

            if attempt < self.config.rescan_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled { phase: Phase::Rescanning.to_string() });
                    }
                    _ = tokio::time::sleep(self.config.rescan_interval) => {}
                }
            }
        }

        Err(Error::DeviceNotVisible {
            device: lun.naa.clone(),
            attempts: self.config.rescan_attempts,
        })
    }

    /// Only the message ESXi reported is matched, never the command line
    fn is_retryable(&self, error: &Error) -> bool {
        let message = match error {
            Error::EsxCli { message, .. } | Error::CloneFailed { message } => message.clone(),
            Error::EsxCliFault { messages, .. } => messages.join("; "),
            _ => return false,
        };
        let message = message.to_lowercase();
        self.adapter
            .retryable_patterns()
            .iter()
            .any(|p| !p.is_empty() && message.contains(&p.to_lowercase()))
    }

    async fn clone_with_retry(
        &self,
        cancel: &CancellationToken,
        host: &HostSystem,
        request: &OffloadRequest,
        target: &LunHandle,
        reporter: &mut ProgressReporter,
    ) -> Result<OffloadOutcome> {
        let source_path = request.vmdk.host_path();
        let target_path = target.device_path();
        let mut policy = self.config.retry_policy();
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    phase: Phase::Cloning.to_string(),
                });
            }
            attempts += 1;
            info!(
                "Clone attempt {}: {} -> {}",
                attempts, source_path, target_path
            );

            let attempt = self
                .clone_once(host, &source_path, &target_path, reporter)
                .await;

            let error = match attempt {
                Ok(xcopy_used) => {
                    return Ok(OffloadOutcome {
                        xcopy_used,
                        clone_attempts: attempts,
                        cleanup_errors: Vec::new(),
                    })
                }
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                return Err(match error {
                    Error::EsxCli { message, .. } => Error::CloneFailed { message },
                    other => other,
                });
            }
            if attempts > self.config.clone_retries {
                return Err(Error::TransientCloneFailure {
                    attempts,
                    message: error.to_string(),
                });
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(self.config.retry_initial_interval);
            warn!(
                "Clone attempt {} failed with a retryable error, retrying in {:?}: {}",
                attempts, delay, error
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { phase: Phase::Cloning.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One clone attempt; not cancellable once started.
    ///
    /// The task is cleaned whether it finished, failed or overran
    /// `clone_timeout`.
    async fn clone_once(
        &self,
        host: &HostSystem,
        source_path: &str,
        target_path: &str,
        reporter: &mut ProgressReporter,
    ) -> Result<Option<bool>> {
        let start = esx_args(&["vmkfstools", "clone", "-s", source_path, "-t", target_path]);
        let rows = tokio::time::timeout(
            self.config.esxcli_timeout,
            self.vcenter.run_esx_command(host, &start),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "vmkfstools clone".into(),
            after: self.config.esxcli_timeout,
        })??;
        let started: CloneStarted =
            serde_json::from_str(rows_message(&rows).trim()).map_err(|e| Error::CloneFailed {
                message: format!("unexpected clone start reply: {}", e),
            })?;
        info!("Clone task {} started (pid {})", started.task_id, started.pid);

        let result = tokio::time::timeout(
            self.config.clone_timeout,
            self.poll_task(host, &started.task_id, reporter),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(
                "Clone task {} still running after {:?}",
                started.task_id, self.config.clone_timeout
            );
            Err(Error::Timeout {
                operation: "hardware clone".into(),
                after: self.config.clone_timeout,
            })
        });

        let clean = esx_args(&["vmkfstools", "taskclean", "-i", &started.task_id]);
        match tokio::time::timeout(
            self.config.esxcli_timeout,
            self.vcenter.run_esx_command(host, &clean),
        )
        .await
        {
            Ok(Ok(_)) => debug!("Clone task {} cleaned", started.task_id),
            Ok(Err(e)) => warn!("Failed to clean clone task {}: {}", started.task_id, e),
            Err(_) => warn!("Timed out cleaning clone task {}", started.task_id),
        }

        result
    }

    async fn poll_task(
        &self,
        host: &HostSystem,
        task_id: &str,
        reporter: &mut ProgressReporter,
    ) -> Result<Option<bool>> {
        let get = esx_args(&["vmkfstools", "taskget", "-i", task_id]);
        loop {
            tokio::time::sleep(self.config.task_poll_interval).await;

            let rows = tokio::time::timeout(
                self.config.esxcli_timeout,
                self.vcenter.run_esx_command(host, &get),
            )
            .await
            .map_err(|_| Error::Timeout {
                operation: "vmkfstools taskget".into(),
                after: self.config.esxcli_timeout,
            })??;
            let status = CloneTaskStatus::parse(&rows_message(&rows))?;

            if let Some(used) = status.xcopy_used() {
                reporter.xcopy_used(used);
            }
            if let Some(percent) = status.percent() {
                debug!("Clone task {} at {}%", task_id, percent);
                reporter.percent(percent.clamp(1, 99));
            }

            if status.is_running() {
                continue;
            }
            if status.succeeded() {
                info!("Clone task {} completed", task_id);
                return Ok(status.xcopy_used());
            }
            return Err(Error::CloneFailed {
                message: status.failure_message(),
            });
        }
    }

    /// Unmap with a fresh deadline, then drop dead device paths
    async fn unmap(&self, host: &HostSystem, mapping: &LunMapping) -> Result<()> {
        if !mapping.created {
            info!(
                "LUN {} was already mapped through {}, leaving the mapping in place",
                mapping.lun.name, mapping.initiator_group
            );
            return Ok(());
        }
        info!("Unmapping LUN {} from {}", mapping.lun.name, mapping.initiator_group);
        let unmapped = tokio::time::timeout(self.config.array_timeout, self.adapter.unmap(mapping))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout {
                    operation: "unmap".into(),
                    after: self.config.array_timeout,
                })
            });
        if let Err(e) = unmapped {
            let e = Error::Cleanup {
                operation: "unmap".into(),
                reason: e.to_string(),
            };
            warn!("{}", e);
            return Err(e);
        }

        let argv = esx_args(&["storage", "core", "adapter", "rescan", "-t", "delete", "-a", "1"]);
        match tokio::time::timeout(
            self.config.esxcli_timeout,
            self.vcenter.run_esx_command(host, &argv),
        )
        .await
        {
            Ok(Ok(_)) => debug!("Removed dead device paths on {}", host.name),
            Ok(Err(e)) => warn!("Failed to remove dead device paths on {}: {}", host.name, e),
            Err(_) => warn!("Timed out removing dead device paths on {}", host.name),
        }
        Ok(())
    }

    async fn release_source(&self, source: &SourceHandle) -> Result<()> {
        let released = tokio::time::timeout(
            self.config.array_timeout,
            self.adapter.release_source(source),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                operation: "release source".into(),
                after: self.config.array_timeout,
            })
        });
        released.map_err(|e| {
            let e = Error::Cleanup {
                operation: "release source".into(),
                reason: e.to_string(),
            };
            warn!("{}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let mut policy = EngineConfig::default().retry_policy();
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(16)));
    }

    #[test]
    fn test_parse_percent_last_match_wins() {
        assert_eq!(parse_percent("Clone: 10% done. Clone: 55% done."), Some(55));
        assert_eq!(parse_percent("Cloning disk"), None);
        assert_eq!(parse_percent("no space100%"), None);
    }

    #[test]
    fn test_clone_task_status() {
        let running = CloneTaskStatus::parse(
            r#"{"taskId":"t1","pid":42,"exitCode":"","lastLine":"Clone: 37% done.","stdErr":""}"#,
        )
        .unwrap();
        assert!(running.is_running());
        assert_eq!(running.percent(), Some(37));
        assert_eq!(running.xcopy_used(), None);

        let failed = CloneTaskStatus::parse(
            r#"{"exitCode":"1","lastLine":"","stdErr":"Failed to clone: busy","xcopyUsed":"false"}"#,
        )
        .unwrap();
        assert!(!failed.is_running());
        assert!(!failed.succeeded());
        assert_eq!(failed.failure_message(), "exit code 1: Failed to clone: busy");
        assert_eq!(failed.xcopy_used(), Some(false));

        let done =
            CloneTaskStatus::parse(r#"{"exitCode":"0","lastLine":" 100%","xcopyUsed":true}"#)
                .unwrap();
        assert!(done.succeeded());
        assert_eq!(done.xcopy_used(), Some(true));
    }

    #[test]
    fn test_progress_reporter_is_monotonic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx);
        reporter.phase(Phase::Cloning);
        reporter.percent(40);
        reporter.percent(20);
        reporter.percent(40);
        reporter.percent(140);
        drop(reporter);

        let mut percents = Vec::new();
        while let Ok(update) = rx.try_recv() {
            percents.push(update.percent);
        }
        assert_eq!(percents, vec![0, 40, 100]);
    }
}
