//! Backend configuration tests: flags, maps, retention and TOML files.

use std::time::Duration;

use clap::{Args, Command, Parser};
use tokio_util::sync::CancellationToken;

use kubepipe::backend::kubernetes::config::{load_backend_config, parse_string_map, PssProfile};
use kubepipe::backend::kubernetes::{ConfigError, KubernetesArgs, KubernetesBackend};
use kubepipe::backend::{Backend, BackendContext, BackendError};

#[derive(Parser)]
struct Harness {
    #[command(flatten)]
    backend: KubernetesArgs,
}

fn parse(args: &[&str]) -> KubernetesArgs {
    let argv = std::iter::once("kubepipe").chain(args.iter().copied());
    Harness::try_parse_from(argv)
        .expect("flags should parse")
        .backend
}

#[test]
fn defaults_without_flags() {
    let config = parse(&[]).into_config().expect("defaults are valid");
    assert_eq!(config.namespace, "kubepipe");
    assert_eq!(config.volume_size, "10G");
    assert!(config.storage_rwx);
    assert!(config.pod_labels.is_empty());
    assert_eq!(config.pss_profile, PssProfile::None);
    assert!(config.cleanup_stale_resources_retention.is_zero());
}

#[test]
fn flags_populate_the_config() {
    let config = parse(&[
        "--backend-k8s-namespace",
        "ci",
        "--backend-k8s-storage-rwx",
        "false",
        "--backend-k8s-pod-labels",
        "{team: infra, tier: ci}",
        "--backend-k8s-pod-node-selector",
        r#"{"disk": "ssd"}"#,
        "--backend-k8s-pod-image-pull-secret-names",
        "regcred, mirror",
        "--backend-k8s-pss-profile",
        "restricted",
        "--backend-k8s-secctx-nonroot",
        "--backend-k8s-secctx-user",
        "1000",
        "--backend-k8s-maintenance-cleanup-resources-older-than",
        "24h",
    ])
    .into_config()
    .expect("flags are valid");

    assert_eq!(config.namespace, "ci");
    assert!(!config.storage_rwx);
    assert_eq!(config.pod_labels.get("tier").map(String::as_str), Some("ci"));
    assert_eq!(
        config.pod_node_selector.get("disk").map(String::as_str),
        Some("ssd")
    );
    assert_eq!(config.image_pull_secret_names, vec!["regcred", "mirror"]);
    assert_eq!(config.pss_profile, PssProfile::Restricted);
    assert!(config.security_context.run_as_non_root);
    assert_eq!(config.security_context.user, 1000);
    assert_eq!(
        config.cleanup_stale_resources_retention,
        Duration::from_secs(24 * 3600)
    );
}

#[test]
fn malformed_map_fails_at_conversion() {
    let result = parse(&["--backend-k8s-pod-annotations", "[not, a, map]"]).into_config();
    match result {
        Err(ConfigError::InvalidMap { option, value, .. }) => {
            assert_eq!(option, "pod annotations");
            assert_eq!(value, "[not, a, map]");
        }
        other => panic!("expected InvalidMap, got {other:?}"),
    }
}

#[test]
fn malformed_retention_fails_at_conversion() {
    let result = parse(&[
        "--backend-k8s-maintenance-cleanup-resources-older-than",
        "soon",
    ])
    .into_config();
    assert!(matches!(result, Err(ConfigError::InvalidRetention { .. })));
}

#[test]
fn unknown_profile_disables_enforcement() {
    let config = parse(&["--backend-k8s-pss-profile", "paranoid"])
        .into_config()
        .expect("unknown profile is not fatal");
    assert_eq!(config.pss_profile, PssProfile::None);
}

#[test]
fn nested_map_values_are_rejected() {
    assert!(parse_string_map("pod labels", "{a: {b: c}}").is_err());
}

#[test]
fn toml_file_overrides_defaults() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("backend.toml");
    std::fs::write(
        &path,
        r#"
namespace = "builds"
storage_rwx = false
pss_profile = "baseline"
cleanup_stale_resources_retention = "2h"

[pod_labels]
team = "infra"

[security_context]
fs_group = 2000
"#,
    )
    .expect("should write config");

    let config = load_backend_config(&path).expect("config should load");
    assert_eq!(config.namespace, "builds");
    assert!(!config.storage_rwx);
    assert_eq!(config.volume_size, "10G");
    assert_eq!(config.pss_profile, PssProfile::Baseline);
    assert_eq!(config.cleanup_stale_resources_retention, Duration::from_secs(7200));
    assert_eq!(config.pod_labels.get("team").map(String::as_str), Some("infra"));
    assert_eq!(config.security_context.fs_group, 2000);
}

#[test]
fn missing_toml_file_reports_its_path() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("absent.toml");
    match load_backend_config(&path) {
        Err(ConfigError::Read { path: reported, .. }) => {
            assert!(reported.ends_with("absent.toml"));
        }
        other => panic!("expected Read error, got {other:?}"),
    }
}

#[test]
fn flags_are_exposed_for_embedding() {
    let backend = KubernetesBackend::new();
    let longs: Vec<String> = backend
        .flags()
        .iter()
        .filter_map(|arg| arg.get_long().map(str::to_owned))
        .collect();
    assert!(longs.contains(&"backend-k8s-namespace".to_owned()));
    assert!(longs.contains(&"backend-k8s-pss-profile".to_owned()));
    assert!(longs.contains(&"backend-k8s-maintenance-cleanup-resources-older-than".to_owned()));
}

#[tokio::test]
async fn load_without_flags_is_rejected() {
    let backend = KubernetesBackend::new();
    let ctx = BackendContext::new(CancellationToken::new());
    assert!(matches!(
        backend.load(&ctx).await,
        Err(BackendError::MissingConfiguration)
    ));
}

#[tokio::test]
async fn load_rejects_malformed_flags_before_connecting() {
    let matches = KubernetesArgs::augment_args(Command::new("kubepipe"))
        .try_get_matches_from(["kubepipe", "--backend-k8s-pod-labels", "not: [a, map]"])
        .expect("flags should parse");
    let backend = KubernetesBackend::new();
    let ctx = BackendContext::with_cli(matches, CancellationToken::new());

    assert!(matches!(
        backend.load(&ctx).await,
        Err(BackendError::Configuration(ConfigError::InvalidMap { .. }))
    ));
}
