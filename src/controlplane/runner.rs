//! Populator Runner
//!
//! The populator-machinery side of one invocation: wait for the
//! `VSphereXcopyVolumePopulator`, resolve credentials, build the clients,
//! drive the [`OffloadEngine`] and report progress through the Prometheus
//! gauges and the CR status subresource.
//!
//! Order matters: the vendor and the vmdk path are validated before the Secret
//! is read, and credentials are validated before anything talks to vCenter or
//! the array, so configuration mistakes fail without side effects.

use crate::controlplane::backends::AdapterFactory;
use crate::controlplane::credentials::{
    read_secret_dir, secret_data, CredentialResolver, StorageCredentials, VSphereCredentials,
};
use crate::controlplane::engine::{
    EngineConfig, OffloadEngine, OffloadOutcome, OffloadRequest, ProgressUpdate,
};
use crate::controlplane::metrics::ProgressMetrics;
use crate::crd::{
    Phase, StorageVendorProduct, VSphereXcopyVolumePopulator, VSphereXcopyVolumePopulatorStatus,
};
use crate::domain::ports::{
    HostLock, NoopHostLock, PersistentVolume, StorageAdapterRef, VCenterClientRef,
};
use crate::error::{Error, Result};
use crate::vsphere::{VSphereClient, VSphereConfig, VmdkPath};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Cluster Gateway
// =============================================================================

/// Kubernetes reads and writes the runner needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn get_populator(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereXcopyVolumePopulator>>;

    /// Decoded data of a Secret
    async fn get_secret_data(&self, namespace: &str, name: &str)
        -> Result<BTreeMap<String, String>>;

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn get_pv(
        &self,
        name: &str,
    ) -> Result<Option<k8s_openapi::api::core::v1::PersistentVolume>>;

    /// Merge-patch the CR status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VSphereXcopyVolumePopulatorStatus,
    ) -> Result<()>;
}

/// [`ClusterGateway`] over a kube client
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_populator(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereXcopyVolumePopulator>> {
        let api: Api<VSphereXcopyVolumePopulator> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Secret".into(),
                name: format!("{}/{}", namespace, name),
            })?;
        Ok(secret_data(&secret))
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_pv(
        &self,
        name: &str,
    ) -> Result<Option<k8s_openapi::api::core::v1::PersistentVolume>> {
        let api: Api<k8s_openapi::api::core::v1::PersistentVolume> =
            Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VSphereXcopyVolumePopulatorStatus,
    ) -> Result<()> {
        let api: Api<VSphereXcopyVolumePopulator> =
            Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Client Factory
// =============================================================================

/// Builds the vCenter client and the storage adapter from credentials
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build the adapter; validates configuration only
    fn adapter(
        &self,
        vendor: StorageVendorProduct,
        credentials: &StorageCredentials,
    ) -> Result<StorageAdapterRef>;

    /// Log in to vCenter
    async fn vcenter(&self, credentials: &VSphereCredentials) -> Result<VCenterClientRef>;
}

/// Production clients
pub struct DefaultClientFactory;

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    fn adapter(
        &self,
        vendor: StorageVendorProduct,
        credentials: &StorageCredentials,
    ) -> Result<StorageAdapterRef> {
        AdapterFactory::create(vendor, credentials)
    }

    async fn vcenter(&self, credentials: &VSphereCredentials) -> Result<VCenterClientRef> {
        let mut config = VSphereConfig::new(
            &credentials.hostname,
            &credentials.username,
            SecretString::from(credentials.password.expose_secret().to_string()),
        );
        config.insecure = credentials.insecure;
        Ok(Arc::new(VSphereClient::connect(config).await?))
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub cr_namespace: String,
    pub cr_name: String,
    /// Namespace of the target PVC
    pub target_namespace: String,
    /// Target PVC name
    pub owner_name: Option<String>,
    /// Target PVC uid, used for the prime PVC name
    pub owner_uid: Option<String>,
    /// Secret mounted as a directory; read through the API when unset
    pub secret_path: Option<PathBuf>,
    /// Mirror progress into the CR status
    pub patch_status: bool,
    /// Longest wait between reads of a missing CR
    pub cr_poll_max_interval: Duration,
    pub engine: EngineConfig,
}

impl RunnerConfig {
    pub fn new(cr_namespace: &str, cr_name: &str) -> Self {
        Self {
            cr_namespace: cr_namespace.to_string(),
            cr_name: cr_name.to_string(),
            target_namespace: cr_namespace.to_string(),
            owner_name: None,
            owner_uid: None,
            secret_path: None,
            patch_status: true,
            cr_poll_max_interval: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }

    /// `cr` label of the progress gauges
    pub fn metric_label(&self) -> String {
        format!("{}/{}", self.cr_namespace, self.cr_name)
    }
}

/// Runs one populator invocation
pub struct PopulatorRunner {
    config: RunnerConfig,
    gateway: Arc<dyn ClusterGateway>,
    clients: Arc<dyn ClientFactory>,
    resolver: CredentialResolver,
    metrics: ProgressMetrics,
    host_lock: Arc<dyn HostLock>,
}

impl PopulatorRunner {
    pub fn new(
        config: RunnerConfig,
        gateway: Arc<dyn ClusterGateway>,
        clients: Arc<dyn ClientFactory>,
        metrics: ProgressMetrics,
    ) -> Self {
        Self {
            config,
            gateway,
            clients,
            resolver: CredentialResolver::new(),
            metrics,
            host_lock: Arc::new(NoopHostLock),
        }
    }

    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_host_lock(mut self, lock: Arc<dyn HostLock>) -> Self {
        self.host_lock = lock;
        self
    }

    /// Run the invocation and write the final status.
    ///
    /// The returned error's [`Error::exit_code`] is the process exit code.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<OffloadOutcome> {
        let cr = self.wait_for_populator(cancel).await?;
        let result = self.populate(&cr, cancel).await;
        self.report_final(&result).await;
        result
    }

    async fn wait_for_populator(
        &self,
        cancel: &CancellationToken,
    ) -> Result<VSphereXcopyVolumePopulator> {
        let ns = &self.config.cr_namespace;
        let name = &self.config.cr_name;
        let mut policy = ExponentialBackoff {
            max_interval: self.config.cr_poll_max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            match self.gateway.get_populator(ns, name).await {
                Ok(Some(cr)) => {
                    info!("Found populator {}/{}", ns, name);
                    return Ok(cr);
                }
                Ok(None) => debug!("Populator {}/{} not found yet", ns, name),
                Err(e) => warn!("Failed to read populator {}/{}: {}", ns, name, e),
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(self.config.cr_poll_max_interval);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { phase: Phase::Pending.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn populate(
        &self,
        cr: &VSphereXcopyVolumePopulator,
        cancel: &CancellationToken,
    ) -> Result<OffloadOutcome> {
        let vendor = cr.spec.vendor()?;
        let vmdk = VmdkPath::parse(&cr.spec.vmdk_path)?;
        if cr.spec.vm_id.trim().is_empty() {
            return Err(Error::Configuration("vmId must not be empty".into()));
        }
        info!(
            "Populating from VM {} disk {} on {}",
            cr.spec.vm_id, vmdk, vendor
        );

        let data = match &self.config.secret_path {
            Some(path) => read_secret_dir(path).await?,
            None => {
                self.gateway
                    .get_secret_data(&self.config.cr_namespace, &cr.spec.secret_ref)
                    .await?
            }
        };
        let credentials = self.resolver.resolve(&data)?;
        let adapter = self.clients.adapter(vendor, &credentials.storage)?;

        let target = self.resolve_target().await?;
        let vcenter = self.clients.vcenter(&credentials.vsphere).await?;

        let engine = OffloadEngine::new(vcenter.clone(), adapter, self.config.engine.clone())
            .with_host_lock(self.host_lock.clone());
        let request = OffloadRequest {
            vm_id: cr.spec.vm_id.clone(),
            vmdk,
            target,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (result, _) = tokio::join!(
            engine.run(&request, cancel, tx),
            self.forward_progress(rx)
        );
        vcenter.logout().await;
        result
    }

    /// Target PV from the owner PVC, or from its prime PVC while unbound
    async fn resolve_target(&self) -> Result<PersistentVolume> {
        let ns = &self.config.target_namespace;
        let owner = self.config.owner_name.as_deref().ok_or_else(|| {
            Error::Configuration("owner PVC name is required to resolve the target volume".into())
        })?;

        let pvc = self
            .gateway
            .get_pvc(ns, owner)
            .await?
            .ok_or_else(|| not_found("PersistentVolumeClaim", &format!("{}/{}", ns, owner)))?;

        let volume_name = match bound_volume(&pvc) {
            Some(name) => name,
            None => {
                let uid = self
                    .config
                    .owner_uid
                    .clone()
                    .or_else(|| pvc.metadata.uid.clone())
                    .ok_or_else(|| not_found("PersistentVolumeClaim uid", owner))?;
                let prime = format!("prime-{}", uid);
                debug!("PVC {} is unbound, using {}", owner, prime);
                let prime_pvc = self
                    .gateway
                    .get_pvc(ns, &prime)
                    .await?
                    .ok_or_else(|| not_found("PersistentVolumeClaim", &format!("{}/{}", ns, prime)))?;
                bound_volume(&prime_pvc)
                    .ok_or_else(|| not_found("PersistentVolume for PVC", &prime))?
            }
        };

        let pv = self
            .gateway
            .get_pv(&volume_name)
            .await?
            .ok_or_else(|| not_found("PersistentVolume", &volume_name))?;
        to_target(&volume_name, &pv)
    }

    async fn forward_progress(&self, mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
        let label = self.config.metric_label();
        while let Some(update) = rx.recv().await {
            self.metrics.set_progress(&label, update.percent);
            if let Some(used) = update.xcopy_used {
                self.metrics.set_xcopy_used(&label, used);
            }

            // Terminal phases are written by report_final
            if matches!(update.phase, Phase::Succeeded | Phase::Failed) {
                continue;
            }
            self.patch(VSphereXcopyVolumePopulatorStatus {
                progress: update.percent,
                phase: update.phase,
                xcopy_used: update.xcopy_used,
                last_updated: Some(Utc::now()),
                ..Default::default()
            })
            .await;
        }
    }

    async fn report_final(&self, result: &Result<OffloadOutcome>) {
        let status = match result {
            Ok(outcome) => {
                for cleanup in &outcome.cleanup_errors {
                    warn!("Cleanup after successful clone failed: {}", cleanup);
                }
                let label = self.config.metric_label();
                self.metrics.set_progress(&label, 100);
                VSphereXcopyVolumePopulatorStatus {
                    progress: 100,
                    phase: Phase::Succeeded,
                    xcopy_used: outcome.xcopy_used,
                    last_updated: Some(Utc::now()),
                    ..Default::default()
                }
            }
            Err(e) => {
                error!("Population failed ({}): {}", e.kind(), e);
                VSphereXcopyVolumePopulatorStatus {
                    progress: self.metrics.progress(&self.config.metric_label()) as u8,
                    phase: Phase::Failed,
                    error_kind: Some(e.kind()),
                    error: Some(e.status_message()),
                    last_updated: Some(Utc::now()),
                    ..Default::default()
                }
            }
        };
        self.patch(status).await;
    }

    async fn patch(&self, status: VSphereXcopyVolumePopulatorStatus) {
        if !self.config.patch_status {
            return;
        }
        if let Err(e) = self
            .gateway
            .patch_status(&self.config.cr_namespace, &self.config.cr_name, &status)
            .await
        {
            warn!(
                "Failed to patch status of {}/{}: {}",
                self.config.cr_namespace, self.config.cr_name, e
            );
        }
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn bound_volume(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .filter(|v| !v.is_empty())
}

/// CSI identity of a PV
pub fn to_target(
    name: &str,
    pv: &k8s_openapi::api::core::v1::PersistentVolume,
) -> Result<PersistentVolume> {
    let csi = pv
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .ok_or_else(|| not_found("CSI source of PersistentVolume", name))?;
    Ok(PersistentVolume {
        name: name.to_string(),
        volume_handle: csi.volume_handle.clone(),
        volume_attributes: csi.volume_attributes.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VSphereXcopyVolumePopulatorSpec;
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    };
    use kube::api::ObjectMeta;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts factory calls; never builds anything
    #[derive(Default)]
    struct CountingFactory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        fn adapter(
            &self,
            vendor: StorageVendorProduct,
            _credentials: &StorageCredentials,
        ) -> Result<StorageAdapterRef> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal(format!("no adapter for {}", vendor)))
        }

        async fn vcenter(&self, _credentials: &VSphereCredentials) -> Result<VCenterClientRef> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("no vCenter".into()))
        }
    }

    fn populator(vendor: &str) -> VSphereXcopyVolumePopulator {
        let mut cr = VSphereXcopyVolumePopulator::new(
            "disk-1",
            VSphereXcopyVolumePopulatorSpec {
                secret_ref: "creds".into(),
                storage_vendor_product: vendor.into(),
                vm_id: "vm-42".into(),
                vmdk_path: "[ds1] foo/bar.vmdk".into(),
            },
        );
        cr.metadata.namespace = Some("default".into());
        cr
    }

    fn secret_without(key: &str) -> BTreeMap<String, String> {
        [
            ("GOVMOMI_HOSTNAME", "vcenter.example.com"),
            ("GOVMOMI_USERNAME", "administrator@vsphere.local"),
            ("GOVMOMI_PASSWORD", "vc-secret"),
            ("STORAGE_HOSTNAME", "array.example.com"),
            ("STORAGE_USERNAME", "admin"),
            ("STORAGE_PASSWORD", "array-secret"),
        ]
        .into_iter()
        .filter(|(k, _)| *k != key)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn runner(gateway: MockClusterGateway, factory: Arc<CountingFactory>) -> PopulatorRunner {
        let mut config = RunnerConfig::new("default", "disk-1");
        config.owner_name = Some("target".into());
        let metrics = ProgressMetrics::register(&Registry::new()).unwrap();
        PopulatorRunner::new(config, Arc::new(gateway), factory, metrics)
            .with_resolver(CredentialResolver::without_env())
    }

    #[tokio::test]
    async fn test_unknown_vendor_fails_before_side_effects() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_populator()
            .returning(|_, _| Ok(Some(populator("netapp"))));
        gateway.expect_get_secret_data().never();
        gateway
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == Phase::Failed && status.error_kind == Some(ErrorKind::Config)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let factory = Arc::new(CountingFactory::default());
        let result = runner(gateway, factory.clone())
            .run(&CancellationToken::new())
            .await;

        assert_matches!(result, Err(Error::UnknownVendor { .. }));
        assert_eq!(result.unwrap_err().exit_code(), 2);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_storage_password_exits_3() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_populator()
            .returning(|_, _| Ok(Some(populator("ontap"))));
        gateway
            .expect_get_secret_data()
            .returning(|_, _| Ok(secret_without("STORAGE_PASSWORD")));
        gateway.expect_patch_status().returning(|_, _, _| Ok(()));

        let factory = Arc::new(CountingFactory::default());
        let err = runner(gateway, factory.clone())
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("STORAGE_PASSWORD"));
        assert!(!err.to_string().contains("array-secret"));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_patch_failure_is_not_fatal() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_populator()
            .returning(|_, _| Ok(Some(populator("ontap"))));
        gateway
            .expect_get_secret_data()
            .returning(|_, _| Ok(secret_without("STORAGE_PASSWORD")));
        gateway
            .expect_patch_status()
            .returning(|_, _, _| Err(Error::Internal("apiserver unavailable".into())));

        let factory = Arc::new(CountingFactory::default());
        let err = runner(gateway, factory)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingCredential { .. });
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_cr() {
        let mut gateway = MockClusterGateway::new();
        gateway.expect_get_populator().returning(|_, _| Ok(None));
        gateway.expect_patch_status().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner(gateway, Arc::new(CountingFactory::default()))
            .run(&cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_resolve_target_through_prime_pvc() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_pvc()
            .withf(|_, name| name == "target")
            .returning(|_, _| {
                Ok(Some(PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        uid: Some("1234".into()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec::default()),
                    ..Default::default()
                }))
            });
        gateway
            .expect_get_pvc()
            .withf(|_, name| name == "prime-1234")
            .returning(|_, _| {
                Ok(Some(PersistentVolumeClaim {
                    spec: Some(PersistentVolumeClaimSpec {
                        volume_name: Some("pv-xyz".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }))
            });
        gateway.expect_get_pv().returning(|_| {
            Ok(Some(k8s_openapi::api::core::v1::PersistentVolume {
                spec: Some(PersistentVolumeSpec {
                    csi: Some(CSIPersistentVolumeSource {
                        driver: "csi.trident.netapp.io".into(),
                        volume_handle: "pvc-1234".into(),
                        volume_attributes: Some(BTreeMap::from([(
                            "internalName".to_string(),
                            "trident_pvc_1234".to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });

        let target = runner(gateway, Arc::new(CountingFactory::default()))
            .resolve_target()
            .await
            .unwrap();
        assert_eq!(target.name, "pv-xyz");
        assert_eq!(target.volume_handle, "pvc-1234");
        assert_eq!(
            target.volume_attributes.get("internalName").map(String::as_str),
            Some("trident_pvc_1234")
        );
    }

    #[test]
    fn test_to_target_requires_csi() {
        let pv = k8s_openapi::api::core::v1::PersistentVolume::default();
        assert_matches!(
            to_target("pv-1", &pv),
            Err(Error::ResourceNotFound { .. })
        );
    }
}
