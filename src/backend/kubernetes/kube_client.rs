//! [`ClusterClient`] backed by the `kube` crate.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config};
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, error};

use super::client::{
    ClusterClient, ClusterError, DeleteOptions, LogStream, PodEvent, PodEventKind,
    PodEventStream, Propagation,
};

const LOG_PIPE_BUFFER: usize = 64 * 1024;

/// Production cluster client.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Connect using in-cluster credentials, falling back to the local
    /// kubeconfig when not running inside a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error when neither source yields a usable client.
    pub async fn connect() -> Result<Self, ClusterError> {
        let config = match Config::incluster() {
            Ok(config) => config,
            Err(in_cluster) => {
                debug!(error = %in_cluster, "not running in cluster, inferring kubeconfig");
                Config::infer()
                    .await
                    .map_err(|e| ClusterError::Transport(e.to_string()))?
            }
        };
        let client =
            Client::try_from(config).map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    let propagation = match opts.propagation {
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Orphan => PropagationPolicy::Orphan,
    };
    DeleteParams {
        grace_period_seconds: Some(opts.grace_period_seconds),
        propagation_policy: Some(propagation),
        ..DeleteParams::default()
    }
}

fn map_error(kind: &'static str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_owned(),
        },
        kube::Error::Api(response) => ClusterError::Api {
            code: response.code,
            message: response.message,
        },
        kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn decode_pod(obj: DynamicObject) -> (String, Option<Pod>) {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let decoded = serde_json::to_value(&obj).and_then(serde_json::from_value::<Pod>);
    match decoded {
        Ok(pod) => (name, Some(pod)),
        Err(e) => {
            error!(pod = %name, error = %e, "failed to convert object to pod");
            (name, None)
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| map_error("pod", &name, e))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        self.pods(namespace)
            .delete(name, &delete_params(opts))
            .await
            .map(|_| ())
            .map_err(|e| map_error("pod", name, e))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        self.pods(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_error("pod", "", e))
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.pvcs(namespace)
            .create(&PostParams::default(), pvc)
            .await
            .map_err(|e| map_error("persistent volume claim", &name, e))
    }

    async fn delete_pvc(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        self.pvcs(namespace)
            .delete(name, &delete_params(opts))
            .await
            .map(|_| ())
            .map_err(|e| map_error("persistent volume claim", name, e))
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, ClusterError> {
        self.pvcs(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_error("persistent volume claim", "", e))
    }

    async fn create_service(
        &self,
        namespace: &str,
        svc: &Service,
    ) -> Result<Service, ClusterError> {
        let name = svc.metadata.name.clone().unwrap_or_default();
        self.services(namespace)
            .create(&PostParams::default(), svc)
            .await
            .map_err(|e| map_error("service", &name, e))
    }

    async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError> {
        self.services(namespace)
            .delete(name, &delete_params(opts))
            .await
            .map(|_| ())
            .map_err(|e| map_error("service", name, e))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError> {
        self.services(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_error("service", "", e))
    }

    fn watch_pods(&self, namespace: &str) -> PodEventStream {
        // Watch the erased type so a pod that fails to decode still carries
        // its name to the subscribers.
        let resource = ApiResource::erase::<Pod>(&());
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    let (name, pod) = decode_pod(obj);
                    Some(Ok(PodEvent {
                        kind: PodEventKind::Applied,
                        name,
                        pod,
                    }))
                }
                Ok(watcher::Event::Delete(obj)) => {
                    let (name, pod) = decode_pod(obj);
                    Some(Ok(PodEvent {
                        kind: PodEventKind::Deleted,
                        name,
                        pod,
                    }))
                }
                Ok(watcher::Event::Init) => Some(Ok(PodEvent::marker(PodEventKind::Relisting))),
                Ok(watcher::Event::InitDone) => Some(Ok(PodEvent::marker(PodEventKind::Relisted))),
                Err(e) => Some(Err(ClusterError::Transport(e.to_string()))),
            });
        Box::pin(stream)
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, ClusterError> {
        let api = self.pods(namespace);
        let pod = pod.to_owned();
        let params = LogParams {
            follow: true,
            container: Some(container.to_owned()),
            ..LogParams::default()
        };

        // The follow stream is owned by a task so the returned reader does
        // not borrow the API handle.
        let (opened_tx, opened_rx) = oneshot::channel();
        let (mut writer, reader) = tokio::io::duplex(LOG_PIPE_BUFFER);
        tokio::spawn(async move {
            match api.log_stream(&pod, &params).await {
                Ok(upstream) => {
                    let _ = opened_tx.send(Ok(()));
                    let mut upstream = Box::pin(upstream).compat();
                    if let Err(e) = tokio::io::copy(&mut upstream, &mut writer).await {
                        debug!(pod = %pod, error = %e, "log stream closed");
                    }
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(map_error("pod", &pod, e)));
                }
            }
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(Box::new(reader)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClusterError::Transport(
                "log stream task ended before opening".to_owned(),
            )),
        }
    }
}
