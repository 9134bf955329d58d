//! Workflow description consumed by backends.
//!
//! These structures are produced by the pipeline compiler and handed to a
//! [`Backend`](super::Backend) as-is. The backend never re-orders stages or
//! steps; it only reads them, except for [`Step::extra_hosts`] which
//! `setup_workflow` fills in once services are running.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// One workflow execution: ordered stages plus shared volumes and networks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Stages executed in order.
    pub stages: Vec<Stage>,
    /// Workflow-scoped volumes shared by all steps.
    pub volumes: Vec<Volume>,
    /// Workflow-scoped networks.
    pub networks: Vec<Network>,
}

impl WorkflowConfig {
    /// Iterate every step of every stage in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }

    /// Mutable counterpart of [`WorkflowConfig::steps`].
    pub fn steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.stages.iter_mut().flat_map(|stage| stage.steps.iter_mut())
    }
}

/// A group of steps that may run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    /// Stage name.
    pub name: String,
    /// Steps belonging to the stage.
    pub steps: Vec<Step>,
}

/// Step kind assigned by the compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Repository clone step.
    Clone,
    /// Long-running background service reachable from other steps.
    Service,
    /// Plugin step (image with settings, no commands).
    Plugin,
    /// Plain commands step.
    #[default]
    Commands,
    /// Cache restore/rebuild step.
    Cache,
}

/// A single unit of work executed as one pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Human-readable step name.
    pub name: String,
    /// Stable step identifier; the pod name is derived from it.
    pub uuid: String,
    /// Step kind.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Container image.
    pub image: String,
    /// Always pull the image before starting.
    pub pull: bool,
    /// Detached steps keep running in the background.
    pub detached: bool,
    /// Request a privileged container.
    pub privileged: bool,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Environment variables, ordered by name.
    pub environment: BTreeMap<String, String>,
    /// Explicit entrypoint overriding the generated script runner.
    pub entrypoint: Vec<String>,
    /// Shell commands executed in order.
    pub commands: Vec<String>,
    /// Extra `/etc/hosts` entries, filled by `setup_workflow`.
    pub extra_hosts: Vec<HostAlias>,
    /// Volume mounts in `name:/path` form.
    pub volumes: Vec<String>,
    /// Network attachments.
    pub networks: Vec<Conn>,
    /// Exposed ports.
    pub ports: Vec<Port>,
    /// Backend-specific options keyed by backend name.
    pub backend_options: HashMap<String, serde_json::Value>,
}

impl Step {
    /// Whether this step is a background service.
    pub fn is_service(&self) -> bool {
        self.step_type == StepType::Service
    }
}

/// Host name to IP mapping injected into step pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlias {
    /// Host name.
    pub name: String,
    /// IP address the name resolves to.
    pub ip: String,
}

/// Network attachment of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conn {
    /// Network name.
    pub name: String,
    /// Aliases under which the step is reachable on the network.
    pub aliases: Vec<String>,
}

/// Exposed container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Port {
    /// Port number.
    pub number: u16,
    /// Protocol, `tcp` when empty.
    pub protocol: String,
}

/// Workflow volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    /// Volume name.
    pub name: String,
}

/// Workflow network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    /// Network name.
    pub name: String,
}
