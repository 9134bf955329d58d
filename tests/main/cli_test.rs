//! CLI contract tests.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;

fn main_source() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/main.rs");
    match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => panic!("main source should load from {}: {err}", path.display()),
    }
}

fn kubepipe() -> Command {
    let mut cmd = Command::cargo_bin("kubepipe").expect("binary should build");
    cmd.env_remove("KUBEPIPE_BACKEND_K8S_MAINTENANCE_CLEANUP_RESOURCES_OLDER_THAN")
        .env_remove("KUBEPIPE_BACKEND_K8S_POD_LABELS");
    cmd
}

#[test]
fn main_defines_primary_subcommands() {
    let source = main_source();
    assert!(source.contains("Check"));
    assert!(source.contains("Run"));
    assert!(source.contains("Sweep"));
}

#[test]
fn help_lists_subcommands() {
    let output = kubepipe().arg("--help").output().expect("should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["check", "run", "sweep"] {
        assert!(stdout.contains(command), "missing {command} in:\n{stdout}");
    }
}

#[test]
fn backend_flags_are_accepted_by_every_subcommand() {
    for command in ["check", "run", "sweep"] {
        let output = kubepipe()
            .args([command, "--help"])
            .output()
            .expect("should run");
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            stdout.contains("--backend-k8s-namespace"),
            "{command} lacks backend flags:\n{stdout}"
        );
    }
}

#[test]
fn sweep_without_retention_fails_before_connecting() {
    let output = kubepipe().arg("sweep").output().expect("should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no retention configured"), "{stderr}");
}

#[test]
fn sweep_rejects_malformed_label_flags() {
    let output = kubepipe()
        .args([
            "sweep",
            "--backend-k8s-pod-labels",
            "[not, a, map]",
            "--backend-k8s-maintenance-cleanup-resources-older-than",
            "1h",
        ])
        .output()
        .expect("should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid backend flags"), "{stderr}");
}
