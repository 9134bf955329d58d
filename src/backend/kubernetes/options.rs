//! Per-step backend options.
//!
//! A step may carry a `kubernetes` entry in its backend options. Unknown keys
//! are ignored and a malformed entry falls back to the defaults, so a typo in
//! a pipeline never blocks the step from starting.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::error;

use crate::backend::types::Step;

use super::ENGINE_NAME;

/// Kubernetes-specific step options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendOptions {
    /// Extra pod labels, applied when the engine allows step labels.
    pub labels: BTreeMap<String, String>,
    /// Extra pod annotations, applied when the engine allows step annotations.
    pub annotations: BTreeMap<String, String>,
    /// Node selector entries; they override engine-wide keys.
    pub node_selector: BTreeMap<String, String>,
    /// Service account the pod runs as.
    pub service_account_name: String,
    /// Pod tolerations.
    pub tolerations: Vec<Toleration>,
    /// Container resource requests and limits.
    pub resources: Resources,
    /// Security context overrides.
    pub security_context: Option<SecurityContextOptions>,
    /// Existing cluster secrets exposed as environment variables.
    pub secrets: Vec<SecretRef>,
}

/// Container resources as quantity strings, e.g. `{"memory": "512Mi"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Guaranteed resources.
    pub requests: BTreeMap<String, String>,
    /// Upper bounds.
    pub limits: BTreeMap<String, String>,
}

impl Resources {
    /// Whether neither requests nor limits are set.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Pod toleration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key.
    pub key: String,
    /// `Exists` or `Equal`.
    pub operator: String,
    /// Taint value.
    pub value: String,
    /// Taint effect.
    pub effect: String,
    /// How long the pod tolerates a `NoExecute` taint.
    pub toleration_seconds: Option<i64>,
}

/// Security context overrides of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityContextOptions {
    /// `false` withdraws the privileges of a privileged step. It cannot
    /// grant privileges on its own.
    pub privileged: Option<bool>,
    /// Require a non-root user.
    pub run_as_non_root: Option<bool>,
    /// User id.
    pub run_as_user: Option<i64>,
    /// Group id.
    pub run_as_group: Option<i64>,
    /// Filesystem group.
    pub fs_group: Option<i64>,
    /// Seccomp profile.
    pub seccomp_profile: Option<SeccompProfileOptions>,
}

/// Seccomp profile selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SeccompProfileOptions {
    /// `RuntimeDefault`, `Localhost` or `Unconfined`.
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Profile path for `Localhost`.
    pub localhost_profile: Option<String>,
}

/// Reference to one key of an existing cluster secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecretRef {
    /// Secret name.
    pub name: String,
    /// Key inside the secret.
    pub key: String,
    /// Environment variable name; defaults to the upper-cased key.
    pub env: String,
}

impl SecretRef {
    /// Environment variable the secret is exposed as.
    pub fn env_name(&self) -> String {
        if self.env.is_empty() {
            self.key.to_uppercase()
        } else {
            self.env.clone()
        }
    }
}

impl BackendOptions {
    /// Options of `step`, or defaults when absent or malformed.
    pub fn from_step(step: &Step) -> Self {
        let Some(value) = step.backend_options.get(ENGINE_NAME) else {
            return Self::default();
        };
        match Self::deserialize(value) {
            Ok(options) => options,
            Err(e) => {
                error!(step = %step.name, error = %e, "could not parse backend options");
                Self::default()
            }
        }
    }
}
