//! Backend configuration: flags, environment, and TOML.
//!
//! [`KubernetesArgs`] is the flag surface (every flag has an environment
//! fallback). It is converted once, at load time, into the immutable
//! [`BackendConfig`] the engine works from. A [`BackendConfig`] can also be
//! read from a TOML file with [`load_backend_config`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use clap::{ArgAction, Args, Command, FromArgMatches};
use serde::{Deserialize, Deserializer};
use tracing::warn;

/// Default namespace for step workloads.
pub const DEFAULT_NAMESPACE: &str = "kubepipe";
/// Default size of workflow volumes.
pub const DEFAULT_VOLUME_SIZE: &str = "10G";

/// Errors raised while reading backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A label/annotation/node-selector option is not a string map.
    #[error("could not unmarshal {option} '{value}': {reason}")]
    InvalidMap {
        /// Option name.
        option: &'static str,
        /// Raw option value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// The retention duration could not be parsed.
    #[error("invalid retention duration '{value}': {reason}")]
    InvalidRetention {
        /// Raw option value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Flags could not be extracted from the parsed command line.
    #[error("invalid flags: {0}")]
    Flags(String),

    /// The configuration file could not be read.
    #[error("failed to read {path}: {reason}")]
    Read {
        /// File path.
        path: String,
        /// I/O error message.
        reason: String,
    },

    /// The configuration file is not valid TOML for [`BackendConfig`].
    #[error("failed to parse backend config: {0}")]
    Parse(String),
}

/// Pod Security Standards profile enforced on created pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PssProfile {
    /// No enforcement.
    #[default]
    None,
    /// Baseline profile.
    Baseline,
    /// Restricted profile (superset of baseline).
    Restricted,
}

impl PssProfile {
    /// Parse a profile name. Unknown names disable enforcement.
    pub fn from_name(name: &str) -> Self {
        match name {
            "baseline" => Self::Baseline,
            "restricted" => Self::Restricted,
            "" => Self::None,
            other => {
                warn!(profile = other, "unknown pod security profile, enforcement disabled");
                Self::None
            }
        }
    }

    /// Profile name as used on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Baseline => "baseline",
            Self::Restricted => "restricted",
        }
    }
}

impl<'de> Deserialize<'de> for PssProfile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// Pod-level security context applied to every step pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecurityContextConfig {
    /// Force `runAsNonRoot`.
    pub run_as_non_root: bool,
    /// User id; `0` leaves it unset.
    pub user: i64,
    /// Group id; `0` leaves it unset.
    pub group: i64,
    /// Filesystem group; `0` leaves it unset.
    pub fs_group: i64,
}

/// Immutable engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Namespace all resources are created in.
    pub namespace: String,
    /// Storage class for workflow volumes; empty uses the cluster default.
    pub storage_class: String,
    /// Requested size of workflow volumes.
    pub volume_size: String,
    /// Use `ReadWriteMany` instead of `ReadWriteOnce`.
    pub storage_rwx: bool,
    /// Labels added to every pod.
    pub pod_labels: BTreeMap<String, String>,
    /// Allow steps to add their own labels.
    pub pod_labels_allow_from_step: bool,
    /// Annotations added to every pod.
    pub pod_annotations: BTreeMap<String, String>,
    /// Allow steps to add their own annotations.
    pub pod_annotations_allow_from_step: bool,
    /// Node selector applied to every pod.
    pub pod_node_selector: BTreeMap<String, String>,
    /// Image pull secrets attached to every pod.
    pub image_pull_secret_names: Vec<String>,
    /// `HOME` inside step containers; empty leaves the image default.
    pub pod_user_home: String,
    /// Pod-level security context.
    pub security_context: SecurityContextConfig,
    /// Allow steps to reference existing cluster secrets.
    pub native_secrets_allow_from_step: bool,
    /// Pod Security Standards profile.
    pub pss_profile: PssProfile,
    /// Age after which finished resources are reclaimed; zero disables.
    #[serde(deserialize_with = "deserialize_retention")]
    pub cleanup_stale_resources_retention: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            storage_class: String::new(),
            volume_size: DEFAULT_VOLUME_SIZE.to_owned(),
            storage_rwx: true,
            pod_labels: BTreeMap::new(),
            pod_labels_allow_from_step: false,
            pod_annotations: BTreeMap::new(),
            pod_annotations_allow_from_step: false,
            pod_node_selector: BTreeMap::new(),
            image_pull_secret_names: Vec::new(),
            pod_user_home: String::new(),
            security_context: SecurityContextConfig::default(),
            native_secrets_allow_from_step: false,
            pss_profile: PssProfile::None,
            cleanup_stale_resources_retention: Duration::ZERO,
        }
    }
}

fn deserialize_retention<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_retention(&raw).map_err(serde::de::Error::custom)
}

/// Parse a retention duration such as `"24h"` or `"1h30m"`; empty is zero.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidRetention`] for unparsable values.
pub fn parse_retention(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(trimmed).map_err(|e| ConfigError::InvalidRetention {
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}

/// Parse a YAML (or JSON) string map option; empty yields an empty map.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidMap`] when the value is not a string map.
pub fn parse_string_map(
    option: &'static str,
    raw: &str,
) -> Result<BTreeMap<String, String>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_yaml::from_str(raw).map_err(|e| ConfigError::InvalidMap {
        option,
        value: raw.to_owned(),
        reason: e.to_string(),
    })
}

/// Load a [`BackendConfig`] from a TOML file.
///
/// Every field is optional; a missing field keeps its default.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_backend_config(path: &Path) -> Result<BackendConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Flag surface of the backend. Each flag also reads an environment variable.
#[derive(Debug, Clone, Args)]
pub struct KubernetesArgs {
    /// Namespace for step pods, services and volumes.
    #[arg(
        long = "backend-k8s-namespace",
        env = "KUBEPIPE_BACKEND_K8S_NAMESPACE",
        default_value = DEFAULT_NAMESPACE
    )]
    pub namespace: String,

    /// Size of workflow volumes.
    #[arg(
        long = "backend-k8s-volume-size",
        env = "KUBEPIPE_BACKEND_K8S_VOLUME_SIZE",
        default_value = DEFAULT_VOLUME_SIZE
    )]
    pub volume_size: String,

    /// Storage class of workflow volumes.
    #[arg(
        long = "backend-k8s-storage-class",
        env = "KUBEPIPE_BACKEND_K8S_STORAGE_CLASS",
        default_value = ""
    )]
    pub storage_class: String,

    /// Use ReadWriteMany (RWX) instead of ReadWriteOnce (RWO) for volumes.
    #[arg(
        long = "backend-k8s-storage-rwx",
        env = "KUBEPIPE_BACKEND_K8S_STORAGE_RWX",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub storage_rwx: bool,

    /// Additional labels for every pod, as a YAML map.
    #[arg(
        long = "backend-k8s-pod-labels",
        env = "KUBEPIPE_BACKEND_K8S_POD_LABELS",
        default_value = ""
    )]
    pub pod_labels: String,

    /// Allow labels from a step's backend options.
    #[arg(
        long = "backend-k8s-pod-labels-allow-from-step",
        env = "KUBEPIPE_BACKEND_K8S_POD_LABELS_ALLOW_FROM_STEP",
        action = ArgAction::SetTrue
    )]
    pub pod_labels_allow_from_step: bool,

    /// Additional annotations for every pod, as a YAML map.
    #[arg(
        long = "backend-k8s-pod-annotations",
        env = "KUBEPIPE_BACKEND_K8S_POD_ANNOTATIONS",
        default_value = ""
    )]
    pub pod_annotations: String,

    /// Allow annotations from a step's backend options.
    #[arg(
        long = "backend-k8s-pod-annotations-allow-from-step",
        env = "KUBEPIPE_BACKEND_K8S_POD_ANNOTATIONS_ALLOW_FROM_STEP",
        action = ArgAction::SetTrue
    )]
    pub pod_annotations_allow_from_step: bool,

    /// Node selector for every pod, as a YAML map.
    #[arg(
        long = "backend-k8s-pod-node-selector",
        env = "KUBEPIPE_BACKEND_K8S_POD_NODE_SELECTOR",
        default_value = ""
    )]
    pub pod_node_selector: String,

    /// Run pods as non-root.
    #[arg(
        long = "backend-k8s-secctx-nonroot",
        env = "KUBEPIPE_BACKEND_K8S_SECCTX_NONROOT",
        action = ArgAction::SetTrue
    )]
    pub secctx_nonroot: bool,

    /// User id pods run as.
    #[arg(
        long = "backend-k8s-secctx-user",
        env = "KUBEPIPE_BACKEND_K8S_SECCTX_USER",
        default_value_t = 0
    )]
    pub secctx_user: i64,

    /// Group id pods run as.
    #[arg(
        long = "backend-k8s-secctx-group",
        env = "KUBEPIPE_BACKEND_K8S_SECCTX_GROUP",
        default_value_t = 0
    )]
    pub secctx_group: i64,

    /// Group owning mounted volumes.
    #[arg(
        long = "backend-k8s-secctx-fsgroup",
        env = "KUBEPIPE_BACKEND_K8S_SECCTX_FSGROUP",
        default_value_t = 0
    )]
    pub secctx_fsgroup: i64,

    /// User's HOME inside step containers.
    #[arg(
        long = "backend-k8s-pod-user-home",
        env = "KUBEPIPE_BACKEND_K8S_POD_USER_HOME",
        default_value = ""
    )]
    pub pod_user_home: String,

    /// Pod Security Standards profile: "", "baseline" or "restricted".
    #[arg(
        long = "backend-k8s-pss-profile",
        env = "KUBEPIPE_BACKEND_K8S_PSS_PROFILE",
        default_value = ""
    )]
    pub pss_profile: String,

    /// Image pull secrets for private registries.
    #[arg(
        long = "backend-k8s-pod-image-pull-secret-names",
        env = "KUBEPIPE_BACKEND_K8S_PULL_SECRET_NAMES",
        value_delimiter = ','
    )]
    pub image_pull_secret_names: Vec<String>,

    /// Allow steps to reference existing cluster secrets.
    #[arg(
        long = "backend-k8s-allow-native-secrets",
        env = "KUBEPIPE_BACKEND_K8S_ALLOW_NATIVE_SECRETS",
        action = ArgAction::SetTrue
    )]
    pub allow_native_secrets: bool,

    /// Pods, volumes and services older than this are deleted by maintenance.
    #[arg(
        long = "backend-k8s-maintenance-cleanup-resources-older-than",
        env = "KUBEPIPE_BACKEND_K8S_MAINTENANCE_CLEANUP_RESOURCES_OLDER_THAN",
        default_value = ""
    )]
    pub cleanup_older_than: String,
}

impl KubernetesArgs {
    /// Argument definitions, for embedding into a host command line.
    pub fn flags() -> Vec<clap::Arg> {
        Self::augment_args(Command::new("kubernetes"))
            .get_arguments()
            .cloned()
            .collect()
    }

    /// Extract the flags from parsed matches.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Flags`] when the matches lack backend flags.
    pub fn from_matches(matches: &clap::ArgMatches) -> Result<Self, ConfigError> {
        Self::from_arg_matches(matches).map_err(|e| ConfigError::Flags(e.to_string()))
    }

    /// Validate and convert into the engine configuration.
    ///
    /// All map options are parsed here so malformed values fail at startup.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed maps or retention durations.
    pub fn into_config(self) -> Result<BackendConfig, ConfigError> {
        let pod_labels = parse_string_map("pod labels", &self.pod_labels)?;
        let pod_annotations = parse_string_map("pod annotations", &self.pod_annotations)?;
        let pod_node_selector = parse_string_map("pod node selector", &self.pod_node_selector)?;
        let retention = parse_retention(&self.cleanup_older_than)?;

        let image_pull_secret_names = self
            .image_pull_secret_names
            .into_iter()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();

        Ok(BackendConfig {
            namespace: self.namespace,
            storage_class: self.storage_class,
            volume_size: self.volume_size,
            storage_rwx: self.storage_rwx,
            pod_labels,
            pod_labels_allow_from_step: self.pod_labels_allow_from_step,
            pod_annotations,
            pod_annotations_allow_from_step: self.pod_annotations_allow_from_step,
            pod_node_selector,
            image_pull_secret_names,
            pod_user_home: self.pod_user_home,
            security_context: SecurityContextConfig {
                run_as_non_root: self.secctx_nonroot,
                user: self.secctx_user,
                group: self.secctx_group,
                fs_group: self.secctx_fsgroup,
            },
            native_secrets_allow_from_step: self.allow_native_secrets,
            pss_profile: PssProfile::from_name(&self.pss_profile),
            cleanup_stale_resources_retention: retention,
        })
    }
}
