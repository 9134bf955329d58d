//! Backend abstraction: the capability set a step orchestrator drives.
//!
//! A backend turns the compiled [`WorkflowConfig`] into running workloads.
//! The orchestrator calls, per workflow:
//! `setup_workflow` → for each step `start_step` → `tail_step` →
//! `wait_step` → `destroy_step` → finally `destroy_workflow`.
//!
//! One implementation exists: [`kubernetes::KubernetesBackend`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub mod kubernetes;
pub mod types;

use kubernetes::{ClusterError, ConfigError, EventError};
use types::{Step, WorkflowConfig};

/// Readable log stream returned by [`Backend::tail_step`].
pub type LogReader = Box<dyn AsyncRead + Send + Unpin>;

/// Request-scoped context passed to every backend call.
///
/// `cancel` plays the role of a deadline/cancellation signal: cancelling it
/// unblocks any wait in progress. `cli` carries the parsed flags; only
/// [`Backend::load`] reads it.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Parsed command-line flags, if any.
    pub cli: Option<clap::ArgMatches>,
    /// Cancellation signal for the call.
    pub cancel: CancellationToken,
}

impl BackendContext {
    /// Context without flags.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cli: None, cancel }
    }

    /// Context carrying parsed flags.
    pub fn with_cli(cli: clap::ArgMatches, cancel: CancellationToken) -> Self {
        Self {
            cli: Some(cli),
            cancel,
        }
    }

    /// Derive a context whose cancellation is scoped to a single call.
    ///
    /// Cancelling the parent cancels the child; not the other way around.
    pub fn child(&self) -> Self {
        Self {
            cli: self.cli.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}

/// Information returned by [`Backend::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Platform string in `os/arch` form.
    pub platform: String,
}

/// Completion state of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepState {
    /// The step's workload has terminated.
    pub exited: bool,
    /// Exit code of the step.
    pub exit_code: i32,
    /// The workload was killed for exceeding its memory limit.
    pub oom_killed: bool,
}

/// Errors produced by backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Invalid backend configuration.
    #[error("invalid backend configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// No configuration was supplied to `load`.
    #[error("no cli context found")]
    MissingConfiguration,

    /// No usable cluster credentials.
    #[error("failed to initialise cluster client: {0}")]
    ClientInitialization(String),

    /// An operation was attempted before `load`.
    #[error("backend is not loaded")]
    NotLoaded,

    /// `load` was called twice.
    #[error("backend is already loaded")]
    AlreadyLoaded,

    /// A derived resource name is not a valid cluster name.
    #[error("invalid {kind} name: {name}")]
    InvalidName {
        /// Resource kind.
        kind: &'static str,
        /// Offending name.
        name: String,
    },

    /// The pod is stuck pending for a reason that will not resolve by itself.
    #[error("pod {pod} pending because of {reason}, {message}{}", container_suffix(.container_reason.as_deref(), .container_message.as_deref()))]
    PodPending {
        /// Pod name.
        pod: String,
        /// Pod status reason.
        reason: String,
        /// Pod status message.
        message: String,
        /// First container waiting reason.
        container_reason: Option<String>,
        /// First container waiting message.
        container_message: Option<String>,
    },

    /// A service step declares no ports.
    #[error("service {0} exposes no ports")]
    ServiceWithoutPorts(String),

    /// A cluster call failed.
    #[error("failed to {action}: {source}")]
    Cluster {
        /// What was being attempted.
        action: String,
        /// Underlying cluster error.
        #[source]
        source: ClusterError,
    },

    /// Pod event subscription failure.
    #[error(transparent)]
    Events(#[from] EventError),

    /// The wait was cancelled before the pod reached the awaited state.
    #[error("waiting for pod {pod} was cancelled")]
    Cancelled {
        /// Pod name.
        pod: String,
        /// Last pod snapshot observed before cancellation.
        last_seen: Option<Box<Pod>>,
    },

    /// Best-effort teardown finished with failures.
    #[error("failed to delete {} workflow resource(s): {}", .0.len(), join_errors(.0))]
    Cleanup(Vec<BackendError>),
}

impl BackendError {
    /// Wrap a cluster error with what was being attempted.
    pub fn cluster(action: impl Into<String>, source: ClusterError) -> Self {
        Self::Cluster {
            action: action.into(),
            source,
        }
    }

    /// Best-effort step state of the last snapshot carried by a cancellation.
    pub fn last_state(&self) -> Option<StepState> {
        match self {
            Self::Cancelled {
                last_seen: Some(pod),
                ..
            } => Some(kubernetes::pod::pod_state(pod)),
            _ => None,
        }
    }
}

fn container_suffix(reason: Option<&str>, message: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(
            ": container is waiting because of {reason}, {}",
            message.unwrap_or_default()
        ),
        None => String::new(),
    }
}

fn join_errors(errors: &[BackendError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Capability set exposed to the step orchestrator.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend engine name.
    fn name(&self) -> &'static str;

    /// Whether the backend can run in the current environment.
    async fn is_available(&self, ctx: &BackendContext) -> bool;

    /// Command-line flags recognised by the backend.
    fn flags(&self) -> Vec<clap::Arg>;

    /// Read configuration, connect, and start background machinery.
    async fn load(&self, ctx: &BackendContext) -> Result<BackendInfo, BackendError>;

    /// Provision workflow-scoped resources (volumes, services).
    async fn setup_workflow(
        &self,
        ctx: &BackendContext,
        conf: &mut WorkflowConfig,
        task_uuid: &str,
    ) -> Result<(), BackendError>;

    /// Create the step workload and wait for it to leave the pending state.
    async fn start_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<(), BackendError>;

    /// Wait for the step workload to terminate.
    async fn wait_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<StepState, BackendError>;

    /// Follow the step's logs.
    async fn tail_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<LogReader, BackendError>;

    /// Delete the step workload.
    async fn destroy_step(
        &self,
        ctx: &BackendContext,
        step: &Step,
        task_uuid: &str,
    ) -> Result<(), BackendError>;

    /// Delete every resource created for the workflow.
    async fn destroy_workflow(
        &self,
        ctx: &BackendContext,
        conf: &WorkflowConfig,
        task_uuid: &str,
    ) -> Result<(), BackendError>;
}
