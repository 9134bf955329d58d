//! Cluster-native backend: runs every step as a pod.
//!
//! [`KubernetesBackend::load`] connects to the cluster once, starts the
//! shared [`PodEventManager`], builds the [`PssProcessor`] and, when a
//! retention is configured, the maintenance [`Sweeper`]. Step waits are
//! served by subscriptions on the shared watch, never by polling.

pub mod client;
pub mod config;
pub mod events;
pub mod kube_client;
pub mod maintenance;
pub mod options;
pub mod pod;
pub mod pss;
pub mod service;
pub mod volume;

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use client::{ClusterClient, ClusterError};
pub use config::{BackendConfig, ConfigError, KubernetesArgs};
pub use events::{EventError, PodEventManager};
pub use kube_client::KubeClusterClient;
pub use maintenance::{Sweeper, SweepReport, MAINTENANCE_INTERVAL};
pub use pss::PssProcessor;

use super::types::{HostAlias, Step, WorkflowConfig};
use super::{Backend, BackendContext, BackendError, BackendInfo, LogReader, StepState};
use client::DeleteOptions;
use events::PodCallback;
use options::BackendOptions;
use pod::{
    build_pod, first_container_state, is_pod_failed, is_pod_pending,
    is_pod_pending_unrecoverable, is_pod_succeeded, pod_pending_error, pod_state,
    step_to_pod_name,
};

/// Backend engine name; also the key of step backend options.
pub const ENGINE_NAME: &str = "kubernetes";

/// Environment variable set inside every cluster pod.
pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

const LOG_PIPE_BUFFER: usize = 64 * 1024;

struct Engine {
    config: Arc<BackendConfig>,
    client: Arc<dyn ClusterClient>,
    events: PodEventManager,
    pss: PssProcessor,
    platform: String,
}

/// Backend running steps as pods in one namespace.
#[derive(Default)]
pub struct KubernetesBackend {
    engine: OnceLock<Arc<Engine>>,
}

/// Whether a cluster environment is detected, resolving variables through `env`.
pub fn is_available_with<F>(env: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env(SERVICE_HOST_ENV).is_some_and(|host| !host.is_empty())
}

impl KubernetesBackend {
    /// Unloaded backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load with an explicit configuration and cluster client.
    ///
    /// Cancelling `shutdown` stops the event manager and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::AlreadyLoaded`] on a second load.
    pub fn load_with_client(
        &self,
        config: BackendConfig,
        client: Arc<dyn ClusterClient>,
        shutdown: CancellationToken,
    ) -> Result<BackendInfo, BackendError> {
        if self.engine.get().is_some() {
            return Err(BackendError::AlreadyLoaded);
        }

        let config = Arc::new(config);
        let events = PodEventManager::new(Arc::clone(&client), config.namespace.clone());
        events.start()?;

        let engine = Arc::new(Engine {
            pss: PssProcessor::new(config.pss_profile),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            config: Arc::clone(&config),
            client: Arc::clone(&client),
            events,
        });
        if self.engine.set(Arc::clone(&engine)).is_err() {
            let _ = engine.events.stop();
            return Err(BackendError::AlreadyLoaded);
        }

        if !config.cleanup_stale_resources_retention.is_zero() {
            let sweeper = Sweeper::new(
                client,
                config.namespace.clone(),
                config.cleanup_stale_resources_retention,
            );
            Arc::new(sweeper).spawn(MAINTENANCE_INTERVAL, shutdown.clone());
        }

        let watched = Arc::clone(&engine);
        tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Err(e) = watched.events.stop() {
                warn!(error = %e, "failed to stop pod event manager");
            }
        });

        info!(
            namespace = %config.namespace,
            platform = %engine.platform,
            pss_profile = config.pss_profile.as_str(),
            "kubernetes backend loaded"
        );
        Ok(BackendInfo {
            platform: engine.platform.clone(),
        })
    }

    /// Configuration the engine was loaded with.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotLoaded`] before load.
    pub fn config(&self) -> Result<Arc<BackendConfig>, BackendError> {
        Ok(Arc::clone(&self.engine()?.config))
    }

    /// Number of step waits currently subscribed to pod events.
    pub fn active_subscriptions(&self) -> usize {
        self.engine
            .get()
            .map_or(0, |engine| engine.events.subscription_count())
    }

    fn engine(&self) -> Result<&Arc<Engine>, BackendError> {
        self.engine.get().ok_or(BackendError::NotLoaded)
    }
}

fn log_pending_pod(pod: &Pod) {
    let status = pod.status.as_ref();
    let waiting = first_container_state(pod).and_then(|s| s.waiting.as_ref());
    trace!(
        pod = pod.metadata.name.as_deref().unwrap_or_default(),
        pod_status = status.and_then(|s| s.phase.as_deref()).unwrap_or_default(),
        pod_reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default(),
        pod_message = status.and_then(|s| s.message.as_deref()).unwrap_or_default(),
        container_reason = waiting.and_then(|w| w.reason.as_deref()).unwrap_or_default(),
        container_message = waiting.and_then(|w| w.message.as_deref()).unwrap_or_default(),
        "pod is pending"
    );
}

fn started_or_unrecoverable(pod: &Pod) -> bool {
    if !is_pod_pending(pod) {
        return true;
    }
    log_pending_pod(pod);
    is_pod_pending_unrecoverable(pod)
}

fn stopped(pod: &Pod) -> bool {
    is_pod_succeeded(pod) || is_pod_failed(pod)
}

fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(e) if e.is_not_found() => {
            trace!(error = %e, "resource already gone");
            Ok(())
        }
        other => other,
    }
}

impl Engine {
    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Block until a snapshot of `pod` satisfies `qualifies`. Cancelling `ctx`
    /// or stopping the event manager ends the wait early. The callback never
    /// blocks the dispatch task.
    async fn wait_for<F>(
        &self,
        ctx: &BackendContext,
        pod: &str,
        qualifies: F,
    ) -> Result<Pod, BackendError>
    where
        F: Fn(&Pod) -> bool + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Pod>(1);
        let last_seen: Arc<Mutex<Option<Pod>>> = Arc::default();

        let seen = Arc::clone(&last_seen);
        let callback: PodCallback = Arc::new(move |snapshot: Option<&Pod>| {
            let Some(snapshot) = snapshot else {
                return;
            };
            if let Ok(mut slot) = seen.lock() {
                *slot = Some(snapshot.clone());
            }
            if qualifies(snapshot) {
                let _ = tx.try_send(snapshot.clone());
            }
        });
        let _subscription = self.events.subscribe_guarded(pod, callback)?;

        tokio::select! {
            biased;

            received = rx.recv() => received.ok_or(BackendError::Events(EventError::Stopped)),
            () = self.events.stopped() => Err(BackendError::Events(EventError::Stopped)),
            () = ctx.cancel.cancelled() => {
                let last = last_seen.lock().ok().and_then(|slot| slot.clone());
                Err(BackendError::Cancelled {
                    pod: pod.to_owned(),
                    last_seen: last.map(Box::new),
                })
            }
        }
    }

    async fn start_volume(&self, name: &str) -> Result<(), BackendError> {
        let pvc = volume::build_volume(name, &self.config)?;
        let claim = pvc.metadata.name.clone().unwrap_or_default();
        trace!(volume = %claim, "creating volume");
        self.client
            .create_pvc(self.namespace(), &pvc)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::cluster(format!("create volume {claim}"), e))
    }

    async fn start_service(&self, step: &Step) -> Result<Service, BackendError> {
        let svc = service::build_service(step, self.namespace())?;
        let name = svc.metadata.name.clone().unwrap_or_default();
        trace!(service = %name, "creating service");
        self.client
            .create_service(self.namespace(), &svc)
            .await
            .map_err(|e| BackendError::cluster(format!("create service {name}"), e))
    }

    async fn stop_pod(&self, step: &Step) -> Result<(), BackendError> {
        let name = step_to_pod_name(step)?;
        trace!(pod = %name, "deleting pod");
        let result = self
            .client
            .delete_pod(self.namespace(), &name, &DeleteOptions::default())
            .await;
        ignore_not_found(result).map_err(|e| BackendError::cluster(format!("delete pod {name}"), e))
    }

    async fn stop_service(&self, step: &Step) -> Result<(), BackendError> {
        let name = service::service_name(step)?;
        trace!(service = %name, "deleting service");
        let result = self
            .client
            .delete_service(self.namespace(), &name, &DeleteOptions::default())
            .await;
        ignore_not_found(result)
            .map_err(|e| BackendError::cluster(format!("delete service {name}"), e))
    }

    async fn stop_volume(&self, name: &str) -> Result<(), BackendError> {
        let claim = volume::volume_name(name)?;
        trace!(volume = %claim, "deleting volume");
        let result = self
            .client
            .delete_pvc(self.namespace(), &claim, &DeleteOptions::default())
            .await;
        ignore_not_found(result)
            .map_err(|e| BackendError::cluster(format!("delete volume {claim}"), e))
    }
}

#[async_trait]
impl Backend for KubernetesBackend {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    async fn is_available(&self, _ctx: &BackendContext) -> bool {
        is_available_with(|key| std::env::var(key).ok())
    }

    fn flags(&self) -> Vec<clap::Arg> {
        KubernetesArgs::flags()
    }

    async fn load(&self, ctx: &BackendContext) -> Result<BackendInfo, BackendError> {
        if self.engine.get().is_some() {
            return Err(BackendError::AlreadyLoaded);
        }
        let matches = ctx.cli.as_ref().ok_or(BackendError::MissingConfiguration)?;
        let config = KubernetesArgs::from_matches(matches)?.into_config()?;
        let client = KubeClusterClient::connect()
            .await
            .map_err(|e| BackendError::ClientInitialization(e.to_string()))?;
        self.load_with_client(config, Arc::new(client), ctx.cancel.clone())
    }

    async fn setup_workflow(
        &self,
        _ctx: &BackendContext,
        conf: &mut WorkflowConfig,
        task_uuid: &str,
    ) -> Result<(), BackendError> {
        let engine = self.engine()?;
        trace!(task_uuid, "setting up kubernetes primitives");

        for vol in &conf.volumes {
            engine.start_volume(&vol.name).await?;
        }

        let mut aliases: Vec<(String, HostAlias)> = Vec::new();
        for step in conf.steps().filter(|step| step.is_service()) {
            let svc = engine.start_service(step).await?;
            let ip = svc
                .spec
                .and_then(|spec| spec.cluster_ip)
                .unwrap_or_default();
            let name = match step.networks.first().and_then(|n| n.aliases.first()) {
                Some(alias) => alias.clone(),
                None => service::service_name(step)?,
            };
            aliases.push((step.uuid.clone(), HostAlias { name, ip }));
        }

        trace!(task_uuid, hosts = aliases.len(), "adding extra hosts");
        for step in conf.steps_mut() {
            step.extra_hosts = aliases
                .iter()
                .filter(|(owner, _)| *owner != step.uuid)
                .map(|(_, alias)| alias.clone())
                .collect();
        }
        Ok(())
    }

    async fn start_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<(), BackendError> {
        let engine = self.engine()?;
        let options = BackendOptions::from_step(step);
        trace!(task_uuid, step = %step.name, "starting step");

        let pod = build_pod(step, &engine.config, &options, &engine.pss)?;
        let name = pod.metadata.name.clone().unwrap_or_default();
        engine
            .client
            .create_pod(engine.namespace(), &pod)
            .await
            .map_err(|e| BackendError::cluster(format!("create pod {name}"), e))?;

        let pod = engine.wait_for(ctx, &name, started_or_unrecoverable).await?;
        if is_pod_pending(&pod) {
            return Err(pod_pending_error(&pod));
        }
        // A pod that already failed is reported by wait_step so its logs
        // stay retrievable.
        Ok(())
    }

    async fn wait_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<StepState, BackendError> {
        let engine = self.engine()?;
        let name = step_to_pod_name(step)?;
        trace!(task_uuid, step = %step.uuid, "waiting for step");

        let pod = engine.wait_for(ctx, &name, stopped).await?;
        Ok(pod_state(&pod))
    }

    async fn tail_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<LogReader, BackendError> {
        let engine = self.engine()?;
        let name = step_to_pod_name(step)?;
        trace!(task_uuid, pod = %name, "tail logs of pod");

        let mut upstream = engine
            .client
            .stream_logs(engine.namespace(), &name, &name)
            .await
            .map_err(|e| BackendError::cluster(format!("stream logs of pod {name}"), e))?;

        let (mut writer, reader) = tokio::io::duplex(LOG_PIPE_BUFFER);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                copied = tokio::io::copy(&mut upstream, &mut writer) => match copied {
                    Ok(bytes) => trace!(pod = %name, bytes, "log stream finished"),
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        debug!(pod = %name, "log consumer closed");
                    }
                    Err(e) => error!(pod = %name, error = %e, "could not copy log stream"),
                },
                () = cancel.cancelled() => debug!(pod = %name, "log tail cancelled"),
            }
        });

        Ok(Box::new(reader))
    }

    async fn destroy_step(
        &self,
        _ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<(), BackendError> {
        let engine = self.engine()?;
        trace!(task_uuid, step = %step.name, "stopping step");
        engine.stop_pod(step).await
    }

    async fn destroy_workflow(
        &self,
        _ctx: &BackendContext,
        conf: &WorkflowConfig,
        task_uuid: &str,
    ) -> Result<(), BackendError> {
        let engine = self.engine()?;
        trace!(task_uuid, "deleting kubernetes primitives");

        let mut failures = Vec::new();
        for step in conf.steps() {
            if let Err(e) = engine.stop_pod(step).await {
                warn!(task_uuid, step = %step.name, error = %e, "failed to delete step pod");
                failures.push(e);
            }
            if step.is_service() {
                if let Err(e) = engine.stop_service(step).await {
                    warn!(task_uuid, step = %step.name, error = %e, "failed to delete service");
                    failures.push(e);
                }
            }
        }
        for vol in &conf.volumes {
            if let Err(e) = engine.stop_volume(&vol.name).await {
                warn!(task_uuid, volume = %vol.name, error = %e, "failed to delete volume");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Cleanup(failures))
        }
    }
}
