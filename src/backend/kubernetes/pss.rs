//! Pod Security Standards enforcement.
//!
//! [`PssProcessor::apply`] narrows the security posture of an assembled pod
//! so that it satisfies the configured profile. It only ever removes
//! permissions, so applying it twice yields the same pod as applying it once.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, Pod, PodSecurityContext, SeccompProfile, SecurityContext,
};
use tracing::trace;

use super::config::PssProfile;

/// Drop-everything capability marker.
pub const CAPABILITY_ALL: &str = "ALL";

/// Capabilities the baseline profile allows containers to add.
pub const BASE_CAPABILITIES: [&str; 12] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "MKNOD",
    "NET_BIND_SERVICE",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYS_CHROOT",
];

/// Capabilities the restricted profile allows containers to add.
pub const STRICT_CAPABILITIES: [&str; 1] = ["NET_BIND_SERVICE"];

const SECCOMP_UNCONFINED: &str = "Unconfined";
const SECCOMP_RUNTIME_DEFAULT: &str = "RuntimeDefault";
const SECCOMP_LOCALHOST: &str = "Localhost";

/// Applies a [`PssProfile`] to pods before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PssProcessor {
    profile: PssProfile,
}

impl PssProcessor {
    /// Processor for the given profile.
    pub fn new(profile: PssProfile) -> Self {
        Self { profile }
    }

    /// Configured profile.
    pub fn profile(&self) -> PssProfile {
        self.profile
    }

    /// Whether the processor changes pods at all.
    pub fn is_enabled(&self) -> bool {
        matches!(self.profile, PssProfile::Baseline | PssProfile::Restricted)
    }

    /// Narrow `pod` to the configured profile. Never fails.
    pub fn apply(&self, pod: &mut Pod) {
        if !self.is_enabled() {
            return;
        }

        let spec = pod.spec.get_or_insert_with(Default::default);
        let pod_ctx = spec.security_context.get_or_insert_with(Default::default);
        for container in &mut spec.containers {
            container
                .security_context
                .get_or_insert_with(Default::default);
        }

        match self.profile {
            PssProfile::Baseline => {
                trace!("applying baseline pod security standard");
                base_seccomp(pod_ctx);
                for container in &mut spec.containers {
                    let ctx = container_ctx(container);
                    disallow_privileged(ctx);
                    base_container_seccomp(ctx);
                    base_capabilities(ctx);
                }
            }
            PssProfile::Restricted => {
                trace!("applying restricted pod security standard");
                strict_pod_run_as_non_root(pod_ctx);
                strict_pod_seccomp(pod_ctx);
                for container in &mut spec.containers {
                    let ctx = container_ctx(container);
                    disallow_privileged(ctx);
                    ctx.allow_privilege_escalation = Some(false);
                    strict_container_run_as_non_root(ctx);
                    strict_container_seccomp(ctx);
                    strict_capabilities(ctx);
                }
            }
            PssProfile::None => {}
        }
    }
}

fn container_ctx(container: &mut Container) -> &mut SecurityContext {
    container
        .security_context
        .get_or_insert_with(Default::default)
}

fn disallow_privileged(ctx: &mut SecurityContext) {
    if ctx.privileged == Some(true) {
        ctx.privileged = Some(false);
    }
}

fn base_seccomp(ctx: &mut PodSecurityContext) {
    if let Some(profile) = ctx.seccomp_profile.as_mut() {
        unconfined_to_default(profile);
    }
}

fn base_container_seccomp(ctx: &mut SecurityContext) {
    if let Some(profile) = ctx.seccomp_profile.as_mut() {
        unconfined_to_default(profile);
    }
}

fn unconfined_to_default(profile: &mut SeccompProfile) {
    if profile.type_ == SECCOMP_UNCONFINED {
        profile.type_ = SECCOMP_RUNTIME_DEFAULT.to_owned();
    }
}

fn base_capabilities(ctx: &mut SecurityContext) {
    if let Some(caps) = ctx.capabilities.as_mut() {
        restrict_add(caps, &BASE_CAPABILITIES);
    }
}

fn strict_pod_run_as_non_root(ctx: &mut PodSecurityContext) {
    ctx.run_as_non_root = Some(true);
    if ctx.run_as_user == Some(0) {
        ctx.run_as_user = None;
    }
}

fn strict_container_run_as_non_root(ctx: &mut SecurityContext) {
    if ctx.run_as_non_root == Some(false) {
        ctx.run_as_non_root = None;
    }
    if ctx.run_as_user == Some(0) {
        ctx.run_as_user = None;
    }
}

fn strict_pod_seccomp(ctx: &mut PodSecurityContext) {
    let profile = ctx.seccomp_profile.get_or_insert_with(Default::default);
    confine(profile);
}

fn strict_container_seccomp(ctx: &mut SecurityContext) {
    if let Some(profile) = ctx.seccomp_profile.as_mut() {
        confine(profile);
    }
}

fn confine(profile: &mut SeccompProfile) {
    if profile.type_ != SECCOMP_RUNTIME_DEFAULT && profile.type_ != SECCOMP_LOCALHOST {
        profile.type_ = SECCOMP_RUNTIME_DEFAULT.to_owned();
    }
}

fn strict_capabilities(ctx: &mut SecurityContext) {
    let caps = ctx.capabilities.get_or_insert_with(Capabilities::default);
    caps.drop = Some(vec![CAPABILITY_ALL.to_owned()]);
    restrict_add(caps, &STRICT_CAPABILITIES);
}

/// Replace the add list with its intersection against `allowed`.
///
/// The result is sorted and free of duplicates.
fn restrict_add(caps: &mut Capabilities, allowed: &[&str]) {
    let Some(add) = caps.add.as_mut() else {
        return;
    };
    if add.is_empty() {
        return;
    }
    let kept: BTreeSet<String> = add
        .iter()
        .filter(|cap| allowed.contains(&cap.as_str()))
        .cloned()
        .collect();
    *add = kept.into_iter().collect();
}
