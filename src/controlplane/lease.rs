//! Per-ESXi-host Lease Lock
//!
//! Serialises rescans on one ESXi host across every populator pod in the
//! cluster with `coordination.k8s.io/v1` Leases. A host gets a fixed number of
//! slots (`esxi-lock-<host>-slot-<n>`); holding any one of them grants access.
//! Leases are never deleted, they are left to expire and taken over.

use crate::domain::ports::{HostLock, HostLockGuard};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease lock settings
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Namespace holding the leases
    pub namespace: String,
    /// Written as `holderIdentity`
    pub holder_identity: String,
    /// Concurrent holders per host
    pub slots: u32,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    /// Wait between full passes over the slots
    pub retry_interval: Duration,
}

impl LeaseConfig {
    pub fn new(namespace: &str, holder_identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            holder_identity: holder_identity.to_string(),
            slots: 2,
            lease_duration: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Name of slot `slot` for host `host_id`
pub fn lease_name(host_id: &str, slot: u32) -> String {
    format!("esxi-lock-{}-slot-{}", host_id, slot)
}

/// A lease with no holder, no timestamps, or a renewal older than its
/// duration is free to take.
pub fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return true;
    }
    let renewed = match spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) {
        Some(MicroTime(t)) => *t,
        None => return true,
    };
    let duration = i64::from(spec.lease_duration_seconds.unwrap_or(0));
    renewed + chrono::Duration::seconds(duration) < now
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// [`HostLock`] backed by Kubernetes Leases
pub struct HostLeaseLock {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl HostLeaseLock {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    fn spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.holder_identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }

    /// Try to take one slot; `Ok(false)` if it is held by someone else
    async fn try_acquire(&self, name: &str) -> Result<bool> {
        let now = Utc::now();

        let Some(mut lease) = self.api.get_opt(name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..ObjectMeta::default()
                },
                spec: Some(self.spec(now, 0)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let current = lease.spec.clone().unwrap_or_default();
        let ours = current.holder_identity.as_deref() == Some(&self.config.holder_identity);
        if !ours && !is_expired(&current, now) {
            return Ok(false);
        }

        let transitions = current.lease_transitions.unwrap_or(0) + i32::from(!ours);
        lease.spec = Some(self.spec(now, transitions));
        // Carries the read resourceVersion, so a concurrent taker gets a 409
        match self.api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_renewal(&self, name: String, lost: CancellationToken) -> tokio::task::JoinHandle<()> {
        let api = self.api.clone();
        let holder = self.config.holder_identity.clone();
        let interval = self.config.renew_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = renew(&api, &name, &holder).await {
                    warn!("Lost host lease {}: {}", name, e);
                    lost.cancel();
                    return;
                }
                debug!("Renewed host lease {}", name);
            }
        })
    }
}

async fn renew(api: &Api<Lease>, name: &str, holder: &str) -> Result<()> {
    let mut lease = api.get(name).await?;
    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
    if spec.holder_identity.as_deref() != Some(holder) {
        return Err(Error::LeaseUnavailable {
            host: name.to_string(),
            reason: format!(
                "taken over by {}",
                spec.holder_identity.as_deref().unwrap_or("<none>")
            ),
        });
    }
    spec.renew_time = Some(MicroTime(Utc::now()));
    api.replace(name, &PostParams::default(), &lease).await?;
    Ok(())
}

#[async_trait]
impl HostLock for HostLeaseLock {
    async fn acquire(&self, host_id: &str, cancel: &CancellationToken) -> Result<HostLockGuard> {
        loop {
            for slot in 0..self.config.slots {
                let name = lease_name(host_id, slot);
                match self.try_acquire(&name).await {
                    Ok(true) => {
                        info!("Acquired host lease {}", name);
                        let lost = CancellationToken::new();
                        let renewal = self.spawn_renewal(name, lost.clone());
                        return Ok(HostLockGuard::new(lost, Some(renewal)));
                    }
                    Ok(false) => debug!("Host lease {} is held", name),
                    Err(e) => warn!("Failed to take host lease {}: {}", name, e),
                }
            }

            info!(
                "All {} lease slots for host {} are held, retrying in {:?}",
                self.config.slots, host_id, self.config.retry_interval
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { phase: "Rescanning".into() });
                }
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }
}
