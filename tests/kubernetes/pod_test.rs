//! Pod assembly, naming and lifecycle classification tests.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubepipe::backend::kubernetes::config::PssProfile;
use kubepipe::backend::kubernetes::options::BackendOptions;
use kubepipe::backend::kubernetes::pod::{
    build_pod, classify_pod, generate_script, is_pod_failed, is_pod_pending,
    is_pod_pending_unrecoverable, is_pod_succeeded, pod_pending_error, pod_state,
    step_to_pod_name, PodClass, SCRIPT_ENV,
};
use kubepipe::backend::kubernetes::{service, volume, PssProcessor};
use kubepipe::backend::types::HostAlias;
use kubepipe::backend::{BackendError, StepState};

use crate::common::{
    pod, running_state, service_step, status, step, terminated, test_config, waiting,
};

fn container(pod: &Pod) -> &Container {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .expect("pod has a container")
}

fn env_value<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    container(pod)
        .env
        .as_ref()?
        .iter()
        .find(|var| var.name == name)?
        .value
        .as_deref()
}

fn build(step: &kubepipe::backend::types::Step) -> Pod {
    build_pod(
        step,
        &test_config(),
        &BackendOptions::from_step(step),
        &PssProcessor::new(PssProfile::None),
    )
    .expect("pod should build")
}

#[test]
fn pod_name_depends_only_on_uuid() {
    let a = step("build", "01HZ_ABC.def");
    let b = step("another-name", "01HZ_ABC.def");
    let name = step_to_pod_name(&a).expect("valid name");
    assert_eq!(name, "wp-01hz-abc-def");
    assert_eq!(step_to_pod_name(&b).expect("valid name"), name);
}

#[test]
fn invalid_uuid_fails_naming() {
    let bad = step("build", "has space");
    match step_to_pod_name(&bad) {
        Err(BackendError::InvalidName { kind, name }) => {
            assert_eq!(kind, "pod");
            assert_eq!(name, "wp-has space");
        }
        other => panic!("expected InvalidName, got {other:?}"),
    }

    let long = step("build", &"a".repeat(61));
    assert!(step_to_pod_name(&long).is_err());
}

#[test]
fn commands_run_through_the_encoded_script() {
    let mut s = step("build", "s1");
    s.commands = vec!["make".to_owned(), "make test".to_owned()];
    let pod = build(&s);
    let c = container(&pod);

    assert_eq!(c.name, "wp-s1");
    assert_eq!(
        c.command,
        Some(vec!["/bin/sh".to_owned(), "-c".to_owned()])
    );
    assert_eq!(
        c.args,
        Some(vec!["echo $CI_SCRIPT | base64 -d | /bin/sh -e".to_owned()])
    );
    let encoded = env_value(&pod, SCRIPT_ENV).expect("script env set");
    let decoded = STANDARD.decode(encoded).expect("valid base64");
    assert_eq!(
        String::from_utf8(decoded).expect("utf-8 script"),
        generate_script(&s.commands)
    );
}

#[test]
fn explicit_entrypoint_skips_the_script() {
    let mut s = step("plugin", "s2");
    s.entrypoint = vec!["/bin/plugin".to_owned()];
    s.commands = vec!["--verbose".to_owned()];
    let pod = build(&s);
    let c = container(&pod);

    assert_eq!(c.command, Some(vec!["/bin/plugin".to_owned()]));
    assert_eq!(c.args, Some(vec!["--verbose".to_owned()]));
    assert_eq!(env_value(&pod, SCRIPT_ENV), None);
}

#[test]
fn pod_carries_labels_env_and_restart_policy() {
    let mut s = step("build", "s3");
    s.environment.insert("ZED".to_owned(), "1".to_owned());
    s.environment.insert("ALPHA".to_owned(), "2".to_owned());
    s.pull = true;
    let mut config = test_config();
    config.pod_user_home = "/home/ci".to_owned();
    config.pod_labels.insert("team".to_owned(), "infra".to_owned());

    let pod = build_pod(
        &s,
        &config,
        &BackendOptions::default(),
        &PssProcessor::new(PssProfile::None),
    )
    .expect("pod should build");

    let labels = pod.metadata.labels.as_ref().expect("labels set");
    assert_eq!(labels.get("step").map(String::as_str), Some("build"));
    assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
    assert!(!labels.contains_key("service"));
    assert_eq!(pod.metadata.namespace.as_deref(), Some("kubepipe-test"));

    let names: Vec<&str> = container(&pod)
        .env
        .as_ref()
        .expect("env set")
        .iter()
        .map(|var| var.name.as_str())
        .collect();
    assert_eq!(names, vec!["ALPHA", SCRIPT_ENV, "HOME", "ZED"]);
    assert_eq!(env_value(&pod, "HOME"), Some("/home/ci"));
    assert_eq!(container(&pod).image_pull_policy.as_deref(), Some("Always"));
    assert_eq!(
        pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref()),
        Some("Never")
    );
}

#[test]
fn step_labels_require_permission() {
    let mut s = step("build", "s4");
    s.backend_options.insert(
        "kubernetes".to_owned(),
        serde_json::json!({ "labels": { "owner": "me" } }),
    );
    let options = BackendOptions::from_step(&s);
    let pss = PssProcessor::new(PssProfile::None);

    let denied = build_pod(&s, &test_config(), &options, &pss).expect("pod should build");
    assert!(!denied
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key("owner")));

    let mut config = test_config();
    config.pod_labels_allow_from_step = true;
    let allowed = build_pod(&s, &config, &options, &pss).expect("pod should build");
    assert_eq!(
        allowed
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("owner"))
            .map(String::as_str),
        Some("me")
    );
}

/// Log sink for asserting on warnings emitted while building a pod.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log lock")).into_owned()
    }
}

#[test]
fn denied_step_metadata_is_dropped_with_a_warning() {
    let mut s = step("build", "s4");
    s.backend_options.insert(
        "kubernetes".to_owned(),
        serde_json::json!({
            "labels": { "owner": "me" },
            "annotations": { "note": "hi" },
        }),
    );
    let options = BackendOptions::from_step(&s);
    let pss = PssProcessor::new(PssProfile::None);

    let logs = Captured::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();
    let pod = tracing::subscriber::with_default(subscriber, || {
        build_pod(&s, &test_config(), &options, &pss).expect("pod should build")
    });

    assert!(pod.metadata.annotations.is_none());
    let text = logs.text();
    assert!(text.contains("step labels are not allowed"), "{text}");
    assert!(text.contains("step annotations are not allowed"), "{text}");

    let mut config = test_config();
    config.pod_annotations_allow_from_step = true;
    let allowed = build_pod(&s, &config, &options, &pss).expect("pod should build");
    assert_eq!(
        allowed
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get("note"))
            .map(String::as_str),
        Some("hi")
    );
}

#[test]
fn native_secrets_require_permission() {
    let mut s = step("deploy", "s5");
    s.backend_options.insert(
        "kubernetes".to_owned(),
        serde_json::json!({ "secrets": [{ "name": "registry", "key": "token" }] }),
    );
    let options = BackendOptions::from_step(&s);
    let pss = PssProcessor::new(PssProfile::None);
    let secret_env = |pod: &Pod| {
        container(pod)
            .env
            .as_ref()
            .and_then(|env| env.iter().find(|var| var.name == "TOKEN").cloned())
    };

    let denied = build_pod(&s, &test_config(), &options, &pss).expect("pod should build");
    assert!(secret_env(&denied).is_none());

    let mut config = test_config();
    config.native_secrets_allow_from_step = true;
    let allowed = build_pod(&s, &config, &options, &pss).expect("pod should build");
    let var = secret_env(&allowed).expect("secret exposed");
    let selector = var
        .value_from
        .and_then(|source| source.secret_key_ref)
        .expect("secret reference");
    assert_eq!(selector.key, "token");
}

#[test]
fn volumes_and_extra_hosts_are_mounted() {
    let mut s = step("build", "s6");
    s.volumes = vec!["cache:/cache".to_owned(), "cache:/other".to_owned()];
    s.extra_hosts = vec![HostAlias {
        name: "database".to_owned(),
        ip: "10.43.0.10".to_owned(),
    }];
    let pod = build(&s);
    let spec = pod.spec.as_ref().expect("spec set");

    let volumes = spec.volumes.as_ref().expect("volumes set");
    assert_eq!(volumes.len(), 1);
    assert_eq!(
        volumes[0]
            .persistent_volume_claim
            .as_ref()
            .map(|claim| claim.claim_name.as_str()),
        Some("cache")
    );
    let mounts = container(&pod).volume_mounts.as_ref().expect("mounts set");
    assert_eq!(mounts.len(), 2);

    let aliases = spec.host_aliases.as_ref().expect("host aliases set");
    assert_eq!(aliases[0].ip, "10.43.0.10");
    assert_eq!(aliases[0].hostnames, Some(vec!["database".to_owned()]));
}

#[test]
fn malformed_volume_entry_is_rejected() {
    let mut s = step("build", "s7");
    s.volumes = vec!["no-path".to_owned()];
    let result = build_pod(
        &s,
        &test_config(),
        &BackendOptions::default(),
        &PssProcessor::new(PssProfile::None),
    );
    assert!(matches!(result, Err(BackendError::InvalidName { .. })));
}

#[test]
fn privileged_step_is_downgraded_under_a_profile() {
    let mut s = step("docker", "s8");
    s.privileged = true;
    let pod = build_pod(
        &s,
        &test_config(),
        &BackendOptions::default(),
        &PssProcessor::new(PssProfile::Baseline),
    )
    .expect("pod should build");
    assert_eq!(
        container(&pod)
            .security_context
            .as_ref()
            .and_then(|c| c.privileged),
        Some(false)
    );

    let unrestricted = build(&s);
    assert_eq!(
        container(&unrestricted)
            .security_context
            .as_ref()
            .and_then(|c| c.privileged),
        Some(true)
    );
}

#[test]
fn step_options_cannot_grant_privileges() {
    let mut s = step("build", "s9");
    s.backend_options.insert(
        "kubernetes".to_owned(),
        serde_json::json!({ "securityContext": { "privileged": true } }),
    );
    let pod = build(&s);
    assert_eq!(
        container(&pod)
            .security_context
            .as_ref()
            .and_then(|c| c.privileged),
        None
    );

    s.privileged = true;
    s.backend_options.insert(
        "kubernetes".to_owned(),
        serde_json::json!({ "securityContext": { "privileged": false } }),
    );
    let vetoed = build(&s);
    assert_eq!(
        container(&vetoed)
            .security_context
            .as_ref()
            .and_then(|c| c.privileged),
        None
    );
}

#[test]
fn classification_is_a_partition() {
    let cases = [
        (status("Pending", None), PodClass::Pending),
        (status("Pending", Some(waiting("ContainerCreating"))), PodClass::Pending),
        (status("Running", Some(waiting("CrashLoopBackOff"))), PodClass::Pending),
        (status("Running", Some(running_state())), PodClass::Running),
        (status("Running", None), PodClass::Running),
        (status("Running", Some(terminated(0))), PodClass::Succeeded),
        (status("Running", Some(terminated(3))), PodClass::Failed),
        (status("Succeeded", Some(terminated(0))), PodClass::Succeeded),
        (status("Failed", None), PodClass::Failed),
        (status("Failed", Some(terminated(137))), PodClass::Failed),
    ];

    for (pod_status, expected) in cases {
        let snapshot = pod("wp-x", Some(pod_status));
        assert_eq!(classify_pod(&snapshot), expected, "{snapshot:?}");
        let flags = [
            is_pod_pending(&snapshot),
            is_pod_succeeded(&snapshot),
            is_pod_failed(&snapshot),
        ];
        assert!(
            flags.iter().filter(|set| **set).count() <= 1,
            "classes overlap for {snapshot:?}"
        );
    }

    assert_eq!(classify_pod(&pod("wp-x", None)), PodClass::Running);
}

#[test]
fn unrecoverable_requires_pending() {
    let pull = pod("wp-x", Some(status("Pending", Some(waiting("ImagePullBackOff")))));
    assert!(is_pod_pending_unrecoverable(&pull));

    let image = pod("wp-x", Some(status("Pending", Some(waiting("InvalidImageName")))));
    assert!(is_pod_pending_unrecoverable(&image));

    let creating = pod("wp-x", Some(status("Pending", Some(waiting("ContainerCreating")))));
    assert!(!is_pod_pending_unrecoverable(&creating));

    let failed = pod("wp-x", Some(status("Failed", Some(waiting("ImagePullBackOff")))));
    assert!(!is_pod_pending_unrecoverable(&failed));
}

#[test]
fn pending_error_names_the_container_reason() {
    let snapshot = pod("wp-x", Some(status("Pending", Some(waiting("ImagePullBackOff")))));
    let message = pod_pending_error(&snapshot).to_string();
    assert!(message.contains("wp-x"), "{message}");
    assert!(message.contains("ImagePullBackOff"), "{message}");
}

#[test]
fn exit_codes_map_to_step_state() {
    let succeeded = pod("wp-x", Some(status("Succeeded", Some(terminated(0)))));
    assert_eq!(
        pod_state(&succeeded),
        StepState {
            exited: true,
            exit_code: 0,
            oom_killed: false
        }
    );

    let oom = pod("wp-x", Some(status("Failed", Some(terminated(137)))));
    assert_eq!(
        pod_state(&oom),
        StepState {
            exited: true,
            exit_code: 137,
            oom_killed: true
        }
    );

    let unknown = pod("wp-x", Some(status("Failed", None)));
    assert_eq!(
        pod_state(&unknown),
        StepState {
            exited: true,
            exit_code: 1,
            oom_killed: false
        }
    );

    let running = pod("wp-x", Some(status("Running", Some(running_state()))));
    assert_eq!(pod_state(&running), StepState::default());
}

#[test]
fn service_selects_the_step_and_mirrors_ports() {
    let s = service_step("database", "svc1", 5432);
    let svc = service::build_service(&s, "kubepipe-test").expect("service should build");
    let spec = svc.spec.expect("spec set");

    assert_eq!(svc.metadata.name.as_deref(), Some("database"));
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(
        spec.selector
            .as_ref()
            .and_then(|s| s.get("service"))
            .map(String::as_str),
        Some("database")
    );
    let ports = spec.ports.expect("ports set");
    assert_eq!(ports[0].port, 5432);
    assert_eq!(ports[0].target_port, Some(IntOrString::Int(5432)));
    assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));

    let pod = build(&s);
    assert_eq!(
        pod.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("service"))
            .map(String::as_str),
        Some("database")
    );
}

#[test]
fn service_without_ports_is_rejected() {
    let mut s = service_step("cache", "svc2", 6379);
    s.ports.clear();
    assert!(matches!(
        service::build_service(&s, "kubepipe-test"),
        Err(BackendError::ServiceWithoutPorts(name)) if name == "cache"
    ));
}

#[test]
fn volume_access_mode_follows_configuration() {
    let mut config = test_config();
    let rwx = volume::build_volume("Shared_Cache", &config).expect("claim should build");
    assert_eq!(rwx.metadata.name.as_deref(), Some("shared-cache"));
    let spec = rwx.spec.expect("spec set");
    assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_owned()]));
    assert_eq!(spec.storage_class_name, None);
    assert_eq!(
        spec.resources
            .and_then(|r| r.requests)
            .and_then(|r| r.get("storage").map(|q| q.0.clone())),
        Some("10G".to_owned())
    );

    config.storage_rwx = false;
    config.storage_class = "fast".to_owned();
    let rwo = volume::build_volume("shared", &config).expect("claim should build");
    let spec = rwo.spec.expect("spec set");
    assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_owned()]));
    assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
}
