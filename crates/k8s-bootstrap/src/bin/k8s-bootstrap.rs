//! k8s-bootstrap CLI - HA Kubernetes bootstrap for CTO Platform.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use k8s_bootstrap::plan::plan;
use k8s_bootstrap::{
    BootstrapConfig, Bootstrapper, DryRunShell, LocalStore, Operation, Storage,
};

/// k8s-bootstrap CLI - bring up HA Kubernetes on provisioned machines.
#[derive(Parser)]
#[command(name = "k8s-bootstrap")]
#[command(about = "Bootstrap HA Kubernetes control planes and workers")]
struct Cli {
    /// Cluster config file (or set `K8S_BOOTSTRAP_CONFIG` env var).
    #[arg(long, env = "K8S_BOOTSTRAP_CONFIG")]
    config: PathBuf,

    /// Directory holding bootstrap state (or set `K8S_BOOTSTRAP_STATE_DIR`).
    #[arg(long, env = "K8S_BOOTSTRAP_STATE_DIR", default_value = ".k8s-bootstrap")]
    state_dir: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the steps every node would run.
    Plan {
        /// Also print each step's shell body.
        #[arg(long, default_value = "false")]
        show_scripts: bool,
    },

    /// Drive the full bootstrap, logging steps instead of running them.
    DryRun {
        /// Require existing state instead of creating it.
        #[arg(long, default_value = "false")]
        resume: bool,
    },

    /// Show the persisted stage and per-node progress.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BootstrapConfig::from_yaml_file(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Plan { show_scripts } => run_plan(&config, show_scripts),
        Commands::DryRun { resume } => run_dry_run(&config, cli.state_dir, resume).await,
        Commands::Status => run_status(&config, cli.state_dir).await,
    }
}

fn run_plan(config: &BootstrapConfig, show_scripts: bool) -> Result<()> {
    let resources = config.cloud_resources_with_key(String::new());
    let nodes = plan(&resources, config.distro, &config.version, &config.cni)
        .context("Failed to plan bootstrap")?;

    for node in nodes {
        println!("\n{}-{} ({})", node.role, node.index, node.host);
        println!("{}", "-".repeat(60));
        for script in &node.scripts {
            let policy = if script.can_retry {
                format!("retry x{}", script.max_retries)
            } else {
                "no retry".to_string()
            };
            println!("  {:<55} {policy}", script.name);
            if show_scripts {
                for line in script.shell_script.lines() {
                    println!("      {line}");
                }
            }
        }
    }
    Ok(())
}

async fn run_dry_run(config: &BootstrapConfig, state_dir: PathBuf, resume: bool) -> Result<()> {
    let resources = config.cloud_resources_with_key(String::new());
    let cp_count = resources.public_ips.control_planes.len();
    let wp_count = resources.public_ips.worker_planes.len();

    let store = Arc::new(LocalStore::new(state_dir));
    let bootstrapper = Arc::new(
        Bootstrapper::new(resources, config.distro, Arc::new(DryRunShell::new()))
            .with_retry(config.retry),
    );

    let operation = if resume {
        Operation::Resume
    } else {
        Operation::Create
    };
    bootstrapper
        .setup(store.clone(), operation)
        .await
        .context("Setup failed")?;
    bootstrapper.version(&config.version).await?;
    if bootstrapper.cni(&config.cni).await? {
        info!("CNI plugin {} must be installed after bootstrap", config.cni);
    }

    for index in 0..cp_count {
        bootstrapper
            .configure_control_plane(index, store.as_ref())
            .await
            .with_context(|| format!("Control plane {index} failed"))?;
    }

    // Joins serialize on the bootstrapper's lock; spawning them together only
    // overlaps the waiting.
    let mut joins = JoinSet::new();
    for index in 0..wp_count {
        let bootstrapper = Arc::clone(&bootstrapper);
        let store = Arc::clone(&store);
        joins.spawn(async move {
            bootstrapper
                .join_workerplane(index, store.as_ref())
                .await
                .with_context(|| format!("Worker {index} failed"))
        });
    }
    while let Some(result) = joins.join_next().await {
        result.context("Worker join task panicked")??;
    }

    if let Some(stage) = bootstrapper.stage().await {
        info!("✅ Dry run finished: {stage}");
    }
    if let Some(path) = store.state_path().await {
        println!("State written to {}", path.display());
    }
    Ok(())
}

async fn run_status(config: &BootstrapConfig, state_dir: PathBuf) -> Result<()> {
    let store = LocalStore::new(state_dir);
    let meta = &config.cluster;
    store
        .setup(&meta.provider, &meta.cluster_name, &meta.region, meta.cluster_type)
        .await?;
    store.connect().await?;

    let Some(state) = store.read().await? else {
        println!("No bootstrap state for {} ({} {})", meta.cluster_name, meta.provider, meta.region);
        return Ok(());
    };

    println!("Cluster:   {} ({} {})", meta.cluster_name, meta.provider, meta.region);
    println!("Distro:    {}", state.distro);
    println!("Version:   {}", state.version.as_deref().unwrap_or("-"));
    println!("CNI:       {}", state.cni_plugin.as_deref().unwrap_or("-"));
    println!("Stage:     {}", state.stage());
    println!("Updated:   {}", state.updated_at);
    println!(
        "Kubeconfig: {}",
        if state.kubeconfig.is_some() {
            "captured"
        } else {
            "not yet"
        }
    );

    println!("\n{:<16} {:<18} {:<10}", "NODE", "HOST", "STATUS");
    println!("{}", "-".repeat(46));
    for (index, host) in state.public_ips.control_planes.iter().enumerate() {
        let status = if state.progress.control_planes.contains(&index) {
            "ready"
        } else if state.progress.distro_started.contains(&index) {
            "started"
        } else if state.progress.etcd_certs_placed.contains(&index) {
            "certs"
        } else {
            "pending"
        };
        println!("{:<16} {host:<18} {status:<10}", format!("controlplane-{index}"));
    }
    for (index, host) in state.public_ips.worker_planes.iter().enumerate() {
        let status = if state.progress.worker_planes.contains(&index) {
            "joined"
        } else {
            "pending"
        };
        println!("{:<16} {host:<18} {status:<10}", format!("workerplane-{index}"));
    }
    Ok(())
}
