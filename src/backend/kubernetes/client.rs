//! Cluster access seam.
//!
//! The backend never talks to the API server directly: every call goes
//! through [`ClusterClient`], so tests can drive the engine with an
//! in-memory cluster. [`super::kube_client::KubeClusterClient`] is the
//! production implementation.

use std::pin::Pin;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use tokio::io::AsyncRead;
use tokio_stream::Stream;

/// Errors returned by cluster calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The addressed resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource name.
        name: String,
    },

    /// The API server rejected the request.
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Server-provided message.
        message: String,
    },

    /// The request did not reach the API server or the response was cut.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClusterError {
    /// Whether this error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Deletion propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Delete dependents in the background after the owner is gone.
    Background,
    /// Delete dependents before the owner.
    Foreground,
    /// Leave dependents behind.
    Orphan,
}

/// Options applied to every delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Grace period in seconds; `0` deletes immediately.
    pub grace_period_seconds: u32,
    /// Dependent propagation policy.
    pub propagation: Propagation,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            grace_period_seconds: 0,
            propagation: Propagation::Background,
        }
    }
}

/// Kind of pod change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    /// The pod was added or updated (including initial listing).
    Applied,
    /// The pod was deleted.
    Deleted,
    /// The watch restarted and is listing every pod again.
    Relisting,
    /// The relist finished. Pods not applied since [`Self::Relisting`] are gone.
    Relisted,
}

/// A pod change observed on the shared watch.
#[derive(Debug, Clone, PartialEq)]
pub struct PodEvent {
    /// Change kind.
    pub kind: PodEventKind,
    /// Name of the pod the event is about.
    pub name: String,
    /// Decoded pod; `None` when the payload could not be decoded.
    pub pod: Option<Pod>,
}

impl PodEvent {
    /// Event for a decoded pod.
    pub fn new(kind: PodEventKind, pod: Pod) -> Self {
        Self {
            kind,
            name: pod.metadata.name.clone().unwrap_or_default(),
            pod: Some(pod),
        }
    }

    /// Relist boundary carrying no pod.
    pub fn marker(kind: PodEventKind) -> Self {
        Self {
            kind,
            name: String::new(),
            pod: None,
        }
    }
}

/// Stream of pod changes in a namespace.
pub type PodEventStream = Pin<Box<dyn Stream<Item = Result<PodEvent, ClusterError>> + Send>>;

/// Raw log byte stream of a container.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Namespaced pod/PVC/service access, watch, and log streaming.
///
/// Implementations must be safe to share between concurrently running steps.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;
    /// Delete a pod by name.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError>;
    /// List pods.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Create a persistent volume claim.
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClusterError>;
    /// Delete a persistent volume claim by name.
    async fn delete_pvc(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError>;
    /// List persistent volume claims.
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, ClusterError>;

    /// Create a service.
    async fn create_service(&self, namespace: &str, svc: &Service)
        -> Result<Service, ClusterError>;
    /// Delete a service by name.
    async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        opts: &DeleteOptions,
    ) -> Result<(), ClusterError>;
    /// List services.
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, ClusterError>;

    /// Open a long-lived watch over pods in the namespace.
    fn watch_pods(&self, namespace: &str) -> PodEventStream;

    /// Follow the logs of one container.
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, ClusterError>;
}
