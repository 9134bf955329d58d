//! Maintenance sweeper: reclaims stale pods, volumes and services.
//!
//! Runs as a background Tokio task independent of any workflow. Each pass
//! lists the namespace and deletes finished pods, claims and services whose
//! creation time is strictly older than the retention window. Claims and
//! services are deleted by age alone; pods only once they have finished.
//! Failures are logged and the pass moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::client::{ClusterClient, DeleteOptions};
use super::pod::{is_pod_failed, is_pod_succeeded};

/// Interval between two sweeps.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const TASK: &str = "clean_stale_resources";

/// Deletions performed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Deleted pods.
    pub deleted_pods: usize,
    /// Deleted persistent volume claims.
    pub deleted_pvcs: usize,
    /// Deleted services.
    pub deleted_services: usize,
}

/// Whether a resource created at `created` is past `retention` at `now`.
///
/// Resources without a creation timestamp are never stale.
pub fn is_stale(created: Option<&Time>, now: DateTime<Utc>, retention: Duration) -> bool {
    let Some(created) = created else {
        return false;
    };
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return false;
    };
    now.signed_duration_since(created.0) > retention
}

/// Stale resource reclamation over one namespace.
pub struct Sweeper {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    retention: Duration,
}

impl Sweeper {
    /// Sweeper deleting resources older than `retention`; zero disables it.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            retention,
        }
    }

    /// Whether sweeping does anything.
    pub fn is_enabled(&self) -> bool {
        !self.retention.is_zero()
    }

    /// One pass against the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// One pass, judging age against `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_enabled() {
            return report;
        }
        let retention = humantime::format_duration(self.retention).to_string();
        debug!(task = TASK, retention = %retention, "maintenance task has been started");

        let opts = DeleteOptions::default();
        let ns = self.namespace.as_str();

        match self.client.list_pods(ns).await {
            Ok(pods) => {
                for pod in pods {
                    if !(is_pod_succeeded(&pod) || is_pod_failed(&pod)) {
                        continue;
                    }
                    if !is_stale(pod.creation_timestamp().as_ref(), now, self.retention) {
                        continue;
                    }
                    let name = pod.name_any();
                    debug!(task = TASK, name = %name, "deleting pod");
                    match self.client.delete_pod(ns, &name, &opts).await {
                        Ok(()) => report.deleted_pods = report.deleted_pods.saturating_add(1),
                        Err(e) => error!(task = TASK, name = %name, error = %e, "failed to delete pod"),
                    }
                }
            }
            Err(e) => error!(task = TASK, error = %e, "failed to get pods"),
        }

        match self.client.list_pvcs(ns).await {
            Ok(pvcs) => {
                for pvc in pvcs {
                    if !is_stale(pvc.creation_timestamp().as_ref(), now, self.retention) {
                        continue;
                    }
                    let name = pvc.name_any();
                    debug!(task = TASK, name = %name, "deleting pvc");
                    match self.client.delete_pvc(ns, &name, &opts).await {
                        Ok(()) => report.deleted_pvcs = report.deleted_pvcs.saturating_add(1),
                        Err(e) => error!(task = TASK, name = %name, error = %e, "failed to delete pvc"),
                    }
                }
            }
            Err(e) => error!(task = TASK, error = %e, "failed to get pvcs"),
        }

        match self.client.list_services(ns).await {
            Ok(services) => {
                for svc in services {
                    if !is_stale(svc.creation_timestamp().as_ref(), now, self.retention) {
                        continue;
                    }
                    let name = svc.name_any();
                    debug!(task = TASK, name = %name, "deleting service");
                    match self.client.delete_service(ns, &name, &opts).await {
                        Ok(()) => {
                            report.deleted_services = report.deleted_services.saturating_add(1);
                        }
                        Err(e) => {
                            error!(task = TASK, name = %name, error = %e, "failed to delete service");
                        }
                    }
                }
            }
            Err(e) => error!(task = TASK, error = %e, "failed to get services"),
        }

        info!(
            task = TASK,
            deleted_pods = report.deleted_pods,
            deleted_pvcs = report.deleted_pvcs,
            deleted_services = report.deleted_services,
            "maintenance task has been completed"
        );
        report
    }

    /// Sweep every `interval` until `shutdown` is cancelled. The first pass
    /// runs immediately.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                () = shutdown.cancelled() => {
                    debug!(task = TASK, "maintenance loop stopped");
                    break;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(interval, shutdown))
    }
}
