//! pedge-node: power-edge node agent.
//!
//! Loads the desired state (control plane, then local file), starts the
//! event watchers, the periodic scheduler, the optional GitOps sync and the
//! local HTTP surface, and runs until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pedge_state::{ControlPlaneClient, WatcherConfig};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pedge_node::host::{CommandRunner, SystemRunner};
use pedge_node::metrics::Collector;
use pedge_node::reconciler::{ReconcileMode, Reconciler};
use pedge_node::rest::{AppState, create_router};
use pedge_node::scheduler::Scheduler;
use pedge_node::shutdown::{self, ShutdownTrigger};
use pedge_node::source::gitops::{GitOpsConfig, GitOpsSync};
use pedge_node::source::{StateHandle, load_initial};
use pedge_node::watcher::EventWatcher;

/// power-edge node agent
#[derive(Parser, Debug)]
#[command(name = "pedge-node", version, about)]
struct Args {
    /// Local state document (fallback and cache for the control plane copy)
    #[arg(long, default_value = "/etc/power-edge/state.yaml")]
    state_config: PathBuf,

    /// Watcher configuration document
    #[arg(long, default_value = "/etc/power-edge/watcher.yaml")]
    watcher_config: PathBuf,

    /// HTTP listen address for /metrics, /health, /version and /status
    #[arg(long, default_value = "0.0.0.0:9100")]
    listen: String,

    /// Seconds between periodic checks
    #[arg(long, default_value = "30")]
    check_interval: u64,

    /// Reconciliation mode: disabled, dry-run or enforce
    #[arg(long, default_value = "disabled")]
    reconcile: ReconcileMode,

    /// Control plane URL (e.g. http://localhost:8080)
    #[arg(long)]
    server_url: Option<String>,

    /// Node ID (defaults to hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Git repository holding the state document
    #[arg(long)]
    gitops_repo: Option<String>,

    /// Branch to follow
    #[arg(long, default_value = "main")]
    gitops_branch: String,

    /// State document path inside the repository
    #[arg(long, default_value = "state.yaml")]
    gitops_path: PathBuf,

    /// Seconds between pulls
    #[arg(long, default_value = "30")]
    gitops_interval: u64,

    /// Local checkout directory
    #[arg(long)]
    gitops_dir: Option<PathBuf>,

    /// Never run two reconciliation passes at once
    #[arg(long)]
    serialize_passes: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pedge_node=info,pedge_state=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let node_id = args.node_id.clone().unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!("Starting pedge-node {}", env!("CARGO_PKG_VERSION"));
    info!("Node ID: {}", node_id);
    info!("Local state: {}", args.state_config.display());
    info!("Watcher config: {}", args.watcher_config.display());
    info!("Check interval: {}s", args.check_interval);
    info!("Reconcile mode: {}", args.reconcile);

    let client = args
        .server_url
        .as_deref()
        .map(ControlPlaneClient::new)
        .transpose()
        .context("Invalid control plane URL")?;
    let (initial, origin) = load_initial(
        &args.state_config,
        client.as_ref().map(|c| (c, node_id.as_str())),
    )
    .await?;
    info!(
        "Loaded state {} for {} ({}) via {:?}",
        initial.version, initial.metadata.site, initial.metadata.environment, origin
    );
    let state = StateHandle::new(initial);

    let watcher_cfg = WatcherConfig::load(&args.watcher_config).with_context(|| {
        format!(
            "Failed to load watcher config {}",
            args.watcher_config.display()
        )
    })?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let mut reconciler = Reconciler::new(runner.clone(), args.reconcile);
    if args.serialize_passes {
        reconciler = reconciler.with_serialized_passes();
    }
    let reconciler = Arc::new(reconciler);
    if let Err(e) = reconciler.health_check() {
        warn!("Host is missing core tools, reconciliation will fail: {}", e);
    }

    let collector = Arc::new(Collector::new(runner.clone()).context("Failed to register metrics")?);

    // Bind before spawning anything that can touch the host.
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("HTTP server listening on {}", args.listen);

    let (trigger, shutdown) = shutdown::channel();

    let watcher = EventWatcher::new(watcher_cfg, reconciler.clone(), state.clone());
    let watchers_enabled = watcher.is_enabled();
    let watcher_handle = if watchers_enabled {
        let handle = watcher
            .start(shutdown.clone())
            .context("Failed to start watchers")?;
        info!("Event watchers started");
        Some(handle)
    } else {
        info!("Event watchers disabled");
        None
    };

    let gitops_handle = args.gitops_repo.as_ref().map(|repo| {
        let mut config = GitOpsConfig::new(repo.clone(), args.gitops_path.clone());
        config.branch = args.gitops_branch.clone();
        config.interval = Duration::from_secs(args.gitops_interval);
        if let Some(dir) = &args.gitops_dir {
            config.checkout_dir = dir.clone();
        }
        let handle = state.clone();
        let sync = GitOpsSync::new(
            config,
            runner.clone(),
            Box::new(move |new_state| {
                handle.replace(new_state);
                Ok(())
            }),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.run(shutdown).await {
                error!("GitOps sync failed: {:#}", e);
            }
        })
    });

    let scheduler = Scheduler::new(
        Duration::from_secs(args.check_interval),
        collector.clone(),
        reconciler.clone(),
        state.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    let app = Arc::new(AppState::new(
        runner,
        reconciler,
        collector,
        state,
        watchers_enabled,
    ));
    let mut server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, create_router(app))
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    wait_for_signal(&trigger).await?;
    info!("Shutting down gracefully...");

    match server.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = watcher_handle {
        handle.join().await;
    }
    if let Some(handle) = gitops_handle {
        let _ = handle.await;
    }
    let _ = scheduler_handle.await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal(trigger: &ShutdownTrigger) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    trigger.trigger();
    Ok(())
}
