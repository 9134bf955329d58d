//! kubepipe: a cluster-native execution backend for CI pipelines.
//!
//! Turns compiled workflows (stages of steps, volumes, services) into pods,
//! claims and services on a Kubernetes cluster, follows their lifecycle over
//! one shared watch, enforces Pod Security Standards on every pod it
//! creates, and reclaims stale resources in the background.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod logging;
