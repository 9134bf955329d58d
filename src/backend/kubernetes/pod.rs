//! Step pods: naming, spec assembly, and lifecycle classification.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ContainerState, EnvVar, EnvVarSource, HostAlias,
    LocalObjectReference, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec,
    ResourceRequirements, SeccompProfile, SecretKeySelector, SecurityContext, Toleration,
    Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use tracing::warn;

use crate::backend::types::Step;
use crate::backend::{BackendError, StepState};

use super::config::BackendConfig;
use super::options::{BackendOptions, Resources, SecurityContextOptions};
use super::pss::PssProcessor;

/// Prefix of every step pod name.
pub const POD_PREFIX: &str = "wp-";
/// Exit code reported by a container killed by the OOM killer.
pub const OOM_KILLED_EXIT_CODE: i32 = 137;
/// Container waiting reasons that will not resolve without intervention.
pub const UNRECOVERABLE_WAITING_REASONS: [&str; 2] = ["ImagePullBackOff", "InvalidImageName"];
/// Label carrying the step name.
pub const STEP_LABEL: &str = "step";
/// Label carrying the service name; services select on it.
pub const SERVICE_LABEL: &str = "service";
/// Environment variable holding the base64-encoded step script.
pub const SCRIPT_ENV: &str = "CI_SCRIPT";

const SCRIPT_RUNNER: &str = "echo $CI_SCRIPT | base64 -d | /bin/sh -e";
const MAX_NAME_LEN: usize = 63;

static DNS_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

/// Turn `raw` into a DNS-1123 label usable as a resource name.
///
/// Lower-cases and replaces `_` and `.` with `-`.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] when the result is still not a
/// valid label or is longer than 63 characters.
pub fn dns_name(kind: &'static str, raw: &str) -> Result<String, BackendError> {
    let name = raw.to_lowercase().replace(['_', '.'], "-");
    let valid = name.len() <= MAX_NAME_LEN
        && DNS_LABEL.as_ref().is_some_and(|re| re.is_match(&name));
    if valid {
        Ok(name)
    } else {
        Err(BackendError::InvalidName { kind, name })
    }
}

/// Pod name of a step. Depends only on the step's uuid.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] for uuids that cannot form a name.
pub fn step_to_pod_name(step: &Step) -> Result<String, BackendError> {
    dns_name("pod", &format!("{POD_PREFIX}{}", step.uuid))
}

/// Coarse lifecycle class of a pod snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodClass {
    /// Not started yet, or a container is waiting.
    Pending,
    /// Running and not waiting.
    Running,
    /// Finished with exit code zero.
    Succeeded,
    /// Finished with a non-zero exit code.
    Failed,
}

/// State of the first container, if reported.
pub fn first_container_state(pod: &Pod) -> Option<&ContainerState> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default()
}

/// Classify a pod snapshot. Every snapshot maps to exactly one class.
///
/// The pod phase decides first; a running or unknown phase is refined by the
/// first container's state.
pub fn classify_pod(pod: &Pod) -> PodClass {
    match phase(pod) {
        "Succeeded" => return PodClass::Succeeded,
        "Failed" => return PodClass::Failed,
        "Pending" => return PodClass::Pending,
        _ => {}
    }

    let Some(state) = first_container_state(pod) else {
        return PodClass::Running;
    };
    if state
        .waiting
        .as_ref()
        .is_some_and(|w| w.reason.as_deref().is_some_and(|r| !r.is_empty()))
    {
        return PodClass::Pending;
    }
    match &state.terminated {
        Some(terminated) if terminated.exit_code == 0 => PodClass::Succeeded,
        Some(_) => PodClass::Failed,
        None => PodClass::Running,
    }
}

/// Whether the pod has not started yet.
pub fn is_pod_pending(pod: &Pod) -> bool {
    classify_pod(pod) == PodClass::Pending
}

/// Whether the pod finished successfully.
pub fn is_pod_succeeded(pod: &Pod) -> bool {
    classify_pod(pod) == PodClass::Succeeded
}

/// Whether the pod finished unsuccessfully.
pub fn is_pod_failed(pod: &Pod) -> bool {
    classify_pod(pod) == PodClass::Failed
}

/// Whether the pod is pending for a reason that will not resolve by itself.
pub fn is_pod_pending_unrecoverable(pod: &Pod) -> bool {
    is_pod_pending(pod)
        && waiting(pod)
            .and_then(|(reason, _)| reason)
            .is_some_and(|reason| UNRECOVERABLE_WAITING_REASONS.contains(&reason))
}

fn waiting(pod: &Pod) -> Option<(Option<&str>, Option<&str>)> {
    let waiting = first_container_state(pod)?.waiting.as_ref()?;
    Some((waiting.reason.as_deref(), waiting.message.as_deref()))
}

fn terminated_exit_code(pod: &Pod) -> Option<i32> {
    first_container_state(pod)?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Step state of a pod snapshot.
///
/// Succeeded maps to `0`. Failed maps to the first container's exit code,
/// or `1` when no terminated state is known. Any other class is reported as
/// not exited.
pub fn pod_state(pod: &Pod) -> StepState {
    match classify_pod(pod) {
        PodClass::Succeeded => StepState {
            exited: true,
            exit_code: 0,
            oom_killed: false,
        },
        PodClass::Failed => {
            let exit_code = terminated_exit_code(pod).unwrap_or(1);
            StepState {
                exited: true,
                exit_code,
                oom_killed: exit_code == OOM_KILLED_EXIT_CODE,
            }
        }
        PodClass::Pending | PodClass::Running => StepState::default(),
    }
}

/// Error describing a pod stuck pending.
pub fn pod_pending_error(pod: &Pod) -> BackendError {
    let status = pod.status.as_ref();
    let (container_reason, container_message) = match waiting(pod) {
        Some((reason, message)) => (
            Some(reason.unwrap_or_default().to_owned()),
            Some(message.unwrap_or_default().to_owned()),
        ),
        None => (None, None),
    };
    BackendError::PodPending {
        pod: pod.metadata.name.clone().unwrap_or_default(),
        reason: status
            .and_then(|s| s.reason.clone())
            .unwrap_or_default(),
        message: status
            .and_then(|s| s.message.clone())
            .unwrap_or_default(),
        container_reason,
        container_message,
    }
}

/// Assemble the pod for `step` and apply the security profile.
///
/// # Errors
///
/// Returns [`BackendError::InvalidName`] when the pod name or a volume name
/// is not a valid resource name.
pub fn build_pod(
    step: &Step,
    config: &BackendConfig,
    options: &BackendOptions,
    pss: &PssProcessor,
) -> Result<Pod, BackendError> {
    let name = step_to_pod_name(step)?;
    let (volumes, volume_mounts) = volumes(step)?;

    let container = Container {
        name: name.clone(),
        image: Some(step.image.clone()),
        image_pull_policy: step.pull.then(|| "Always".to_owned()),
        working_dir: non_empty(&step.working_dir),
        env: Some(environment(step, config, options)),
        command: command(step),
        args: args(step),
        ports: container_ports(step),
        resources: resources(&options.resources),
        security_context: container_security_context(step, options.security_context.as_ref()),
        volume_mounts: non_empty_vec(volume_mounts),
        ..Container::default()
    };

    let spec = PodSpec {
        restart_policy: Some("Never".to_owned()),
        containers: vec![container],
        volumes: non_empty_vec(volumes),
        image_pull_secrets: non_empty_vec(
            config
                .image_pull_secret_names
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        ),
        node_selector: non_empty_map(merged(&config.pod_node_selector, &options.node_selector)),
        service_account_name: non_empty(&options.service_account_name),
        tolerations: non_empty_vec(options.tolerations.iter().map(toleration).collect()),
        host_aliases: non_empty_vec(
            step.extra_hosts
                .iter()
                .map(|host| HostAlias {
                    ip: host.ip.clone(),
                    hostnames: Some(vec![host.name.clone()]),
                })
                .collect(),
        ),
        security_context: pod_security_context(config, options.security_context.as_ref()),
        ..PodSpec::default()
    };

    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(step, config, options)),
            annotations: non_empty_map(annotations(step, config, options)),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        status: None,
    };

    pss.apply(&mut pod);
    Ok(pod)
}

fn labels(
    step: &Step,
    config: &BackendConfig,
    options: &BackendOptions,
) -> BTreeMap<String, String> {
    let mut labels = config.pod_labels.clone();
    if config.pod_labels_allow_from_step {
        labels.extend(options.labels.clone());
    } else if !options.labels.is_empty() {
        warn!(step = %step.name, "step labels are not allowed, ignoring");
    }
    labels.insert(STEP_LABEL.to_owned(), step.name.clone());
    if step.is_service() {
        labels.insert(SERVICE_LABEL.to_owned(), step.name.clone());
    }
    labels
}

fn annotations(
    step: &Step,
    config: &BackendConfig,
    options: &BackendOptions,
) -> BTreeMap<String, String> {
    if config.pod_annotations_allow_from_step {
        return merged(&config.pod_annotations, &options.annotations);
    }
    if !options.annotations.is_empty() {
        warn!(step = %step.name, "step annotations are not allowed, ignoring");
    }
    config.pod_annotations.clone()
}

fn merged(
    base: &BTreeMap<String, String>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base.clone();
    out.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

fn environment(step: &Step, config: &BackendConfig, options: &BackendOptions) -> Vec<EnvVar> {
    let mut env: BTreeMap<String, String> = step.environment.clone();
    if !config.pod_user_home.is_empty() {
        env.insert("HOME".to_owned(), config.pod_user_home.clone());
    }
    if step.entrypoint.is_empty() && !step.commands.is_empty() {
        env.insert(SCRIPT_ENV.to_owned(), STANDARD.encode(generate_script(&step.commands)));
    }

    let mut vars: Vec<EnvVar> = env
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            value_from: None,
        })
        .collect();

    if config.native_secrets_allow_from_step {
        vars.extend(options.secrets.iter().map(|secret| EnvVar {
            name: secret.env_name(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.name.clone(),
                    key: secret.key.clone(),
                    optional: None,
                }),
                ..EnvVarSource::default()
            }),
        }));
    } else if !options.secrets.is_empty() {
        warn!(step = %step.name, "native secrets are not allowed, ignoring");
    }
    vars
}

/// Shell script that echoes and runs each command in order.
pub fn generate_script(commands: &[String]) -> String {
    let mut script = String::new();
    for command in commands {
        script.push_str("echo + ");
        script.push_str(&shell_quote(command));
        script.push('\n');
        script.push_str(command);
        script.push('\n');
    }
    script
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

fn command(step: &Step) -> Option<Vec<String>> {
    if !step.entrypoint.is_empty() {
        return Some(step.entrypoint.clone());
    }
    if step.commands.is_empty() {
        return None;
    }
    Some(vec!["/bin/sh".to_owned(), "-c".to_owned()])
}

fn args(step: &Step) -> Option<Vec<String>> {
    if !step.entrypoint.is_empty() {
        return non_empty_vec(step.commands.clone());
    }
    if step.commands.is_empty() {
        return None;
    }
    Some(vec![SCRIPT_RUNNER.to_owned()])
}

fn container_ports(step: &Step) -> Option<Vec<ContainerPort>> {
    non_empty_vec(
        step.ports
            .iter()
            .map(|port| ContainerPort {
                container_port: i32::from(port.number),
                protocol: Some(protocol(&port.protocol)),
                ..ContainerPort::default()
            })
            .collect(),
    )
}

/// Cluster protocol name; empty means TCP.
pub fn protocol(raw: &str) -> String {
    if raw.is_empty() {
        "TCP".to_owned()
    } else {
        raw.to_uppercase()
    }
}

fn resources(resources: &Resources) -> Option<ResourceRequirements> {
    if resources.is_empty() {
        return None;
    }
    let quantities = |map: &BTreeMap<String, String>| {
        non_empty_map(
            map.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect(),
        )
    };
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..ResourceRequirements::default()
    })
}

fn toleration(t: &super::options::Toleration) -> Toleration {
    Toleration {
        key: non_empty(&t.key),
        operator: non_empty(&t.operator),
        value: non_empty(&t.value),
        effect: non_empty(&t.effect),
        toleration_seconds: t.toleration_seconds,
    }
}

fn seccomp(options: Option<&SecurityContextOptions>) -> Option<SeccompProfile> {
    let profile = options?.seccomp_profile.as_ref()?;
    Some(SeccompProfile {
        type_: profile.profile_type.clone(),
        localhost_profile: profile.localhost_profile.clone(),
    })
}

fn pod_security_context(
    config: &BackendConfig,
    options: Option<&SecurityContextOptions>,
) -> Option<PodSecurityContext> {
    let base = &config.security_context;
    let non_zero = |v: i64| (v != 0).then_some(v);

    let ctx = PodSecurityContext {
        run_as_non_root: options
            .and_then(|o| o.run_as_non_root)
            .or(base.run_as_non_root.then_some(true)),
        run_as_user: options
            .and_then(|o| o.run_as_user)
            .or(non_zero(base.user)),
        run_as_group: options
            .and_then(|o| o.run_as_group)
            .or(non_zero(base.group)),
        fs_group: options
            .and_then(|o| o.fs_group)
            .or(non_zero(base.fs_group)),
        seccomp_profile: seccomp(options),
        ..PodSecurityContext::default()
    };
    (ctx != PodSecurityContext::default()).then_some(ctx)
}

fn container_security_context(
    step: &Step,
    options: Option<&SecurityContextOptions>,
) -> Option<SecurityContext> {
    // Step options may only withdraw privileges the step was granted.
    let vetoed = options.and_then(|o| o.privileged) == Some(false);
    (step.privileged && !vetoed).then(|| SecurityContext {
        privileged: Some(true),
        ..SecurityContext::default()
    })
}

fn volumes(step: &Step) -> Result<(Vec<PodVolume>, Vec<VolumeMount>), BackendError> {
    let mut volumes: Vec<PodVolume> = Vec::new();
    let mut mounts = Vec::new();
    for entry in &step.volumes {
        let Some((name, path)) = entry.split_once(':') else {
            return Err(BackendError::InvalidName {
                kind: "volume mount",
                name: entry.clone(),
            });
        };
        let claim = dns_name("volume", name)?;
        if !volumes.iter().any(|v| v.name == claim) {
            volumes.push(PodVolume {
                name: claim.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(false),
                }),
                ..PodVolume::default()
            });
        }
        mounts.push(VolumeMount {
            name: claim,
            mount_path: path.to_owned(),
            ..VolumeMount::default()
        });
    }
    Ok((volumes, mounts))
}

fn non_empty(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_owned())
}

fn non_empty_vec<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn non_empty_map<V>(map: BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    (!map.is_empty()).then_some(map)
}
