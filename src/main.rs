//! kubepipe CLI entry point.
//!
//! Provides `check`, `run`, and `sweep` subcommands for verifying cluster
//! access, executing a compiled workflow file, or running one maintenance
//! pass over the backend namespace.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kubepipe::backend::kubernetes::{
    KubeClusterClient, KubernetesArgs, KubernetesBackend, Sweeper,
};
use kubepipe::backend::types::{Step, WorkflowConfig};
use kubepipe::backend::{Backend, BackendContext};
use kubepipe::logging;

/// Run CI workflows as pods on a Kubernetes cluster.
#[derive(Parser)]
#[command(name = "kubepipe", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Check that the backend is available and can connect.
    Check {
        /// Backend flags.
        #[command(flatten)]
        backend: KubernetesArgs,
    },
    /// Run a compiled workflow (JSON) and tear it down afterwards.
    Run {
        /// Path to the workflow file.
        workflow: PathBuf,
        /// Write JSON logs with daily rotation into this directory.
        #[arg(long)]
        logs_dir: Option<PathBuf>,
        /// Backend flags.
        #[command(flatten)]
        backend: KubernetesArgs,
    },
    /// Run one pass of stale resource reclamation and exit.
    Sweep {
        /// Backend flags.
        #[command(flatten)]
        backend: KubernetesArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).context("failed to parse arguments")?;
    let sub_matches = matches
        .subcommand()
        .map(|(_, sub)| sub.clone())
        .context("missing subcommand")?;

    let _logging_guard = match &cli.command {
        Command::Run {
            logs_dir: Some(dir),
            ..
        } => Some(logging::init_production(dir)?),
        _ => {
            logging::init_cli();
            None
        }
    };
    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!(error = %e, "failed to load .env");
        }
    }

    match cli.command {
        Command::Check { backend } => handle_check(&backend, sub_matches).await,
        Command::Run {
            workflow, backend, ..
        } => handle_run(&workflow, &backend, sub_matches).await,
        Command::Sweep { backend } => handle_sweep(backend).await,
    }
}

/// Report availability and load the backend once.
async fn handle_check(args: &KubernetesArgs, matches: ArgMatches) -> anyhow::Result<()> {
    info!(namespace = %args.namespace, "checking kubernetes backend");
    let backend = KubernetesBackend::new();
    let shutdown = CancellationToken::new();
    let ctx = BackendContext::with_cli(matches, shutdown.clone());

    if !backend.is_available(&ctx).await {
        warn!("not running inside a cluster, using local kubeconfig");
    }
    let info = backend.load(&ctx).await.context("failed to load backend")?;
    println!("{} backend ready on {}", backend.name(), info.platform);

    shutdown.cancel();
    Ok(())
}

/// Run one maintenance pass with the configured retention.
async fn handle_sweep(args: KubernetesArgs) -> anyhow::Result<()> {
    let config = args.into_config().context("invalid backend flags")?;
    if config.cleanup_stale_resources_retention.is_zero() {
        bail!("no retention configured; set --backend-k8s-maintenance-cleanup-resources-older-than");
    }
    let client = KubeClusterClient::connect()
        .await
        .context("failed to connect to cluster")?;

    let sweeper = Sweeper::new(
        Arc::new(client),
        config.namespace.clone(),
        config.cleanup_stale_resources_retention,
    );
    let report = sweeper.sweep().await;
    println!(
        "deleted {} pod(s), {} volume(s), {} service(s)",
        report.deleted_pods, report.deleted_pvcs, report.deleted_services
    );
    Ok(())
}

/// Execute every stage of a workflow file, then tear it down.
async fn handle_run(
    path: &Path,
    args: &KubernetesArgs,
    matches: ArgMatches,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut workflow: WorkflowConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling workflow");
            interrupt.cancel();
        }
    });

    let backend = Arc::new(KubernetesBackend::new());
    let ctx = BackendContext::with_cli(matches, shutdown.clone());
    let info = backend.load(&ctx).await.context("failed to load backend")?;

    let task_uuid = uuid::Uuid::new_v4().to_string();
    info!(
        task_uuid = %task_uuid,
        namespace = %args.namespace,
        platform = %info.platform,
        "running workflow"
    );

    let outcome = run_workflow(&backend, &ctx, &mut workflow, &task_uuid).await;

    // Teardown must run even when the workflow was cancelled.
    let teardown = BackendContext::new(CancellationToken::new());
    if let Err(e) = backend
        .destroy_workflow(&teardown, &workflow, &task_uuid)
        .await
    {
        error!(task_uuid = %task_uuid, error = %e, "workflow teardown incomplete");
    }
    shutdown.cancel();
    outcome
}

async fn run_workflow(
    backend: &Arc<KubernetesBackend>,
    ctx: &BackendContext,
    workflow: &mut WorkflowConfig,
    task_uuid: &str,
) -> anyhow::Result<()> {
    backend
        .setup_workflow(ctx, workflow, task_uuid)
        .await
        .context("failed to set up workflow")?;

    for stage in &workflow.stages {
        info!(task_uuid, stage = %stage.name, steps = stage.steps.len(), "starting stage");
        let mut running = JoinSet::new();
        for step in stage.steps.clone() {
            let backend = Arc::clone(backend);
            let ctx = ctx.child();
            let task_uuid = task_uuid.to_owned();
            running.spawn(async move { run_step(backend.as_ref(), &ctx, &step, &task_uuid).await });
        }

        let mut failed = Vec::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failed.push(format!("{e:#}")),
                Err(e) => failed.push(format!("step task panicked: {e}")),
            }
        }
        if !failed.is_empty() {
            bail!("stage {} failed: {}", stage.name, failed.join("; "));
        }
    }
    Ok(())
}

async fn run_step(
    backend: &dyn Backend,
    ctx: &BackendContext,
    step: &Step,
    task_uuid: &str,
) -> anyhow::Result<()> {
    backend
        .start_step(ctx, step, task_uuid)
        .await
        .with_context(|| format!("failed to start step {}", step.name))?;

    let logs = backend
        .tail_step(ctx, step, task_uuid)
        .await
        .with_context(|| format!("failed to tail step {}", step.name))?;
    let prefix = step.name.clone();
    let printer = tokio::spawn(async move {
        let mut lines = BufReader::new(logs).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("[{prefix}] {line}");
        }
    });

    // Services and detached steps keep running until workflow teardown.
    if step.is_service() || step.detached {
        return Ok(());
    }

    let state = backend.wait_step(ctx, step, task_uuid).await;
    let _ = printer.await;
    let state = state.with_context(|| format!("failed to wait for step {}", step.name))?;

    if let Err(e) = backend.destroy_step(ctx, step, task_uuid).await {
        warn!(task_uuid, step = %step.name, error = %e, "failed to delete step pod");
    }

    if state.oom_killed {
        bail!("step {} was killed for exceeding its memory limit", step.name);
    }
    if state.exit_code != 0 {
        bail!("step {} exited with code {}", step.name, state.exit_code);
    }
    Ok(())
}
