//! Poll a Git repository for the node's state document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pedge_state::State;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::host::{CommandRunner, run_checked};
use crate::shutdown::Shutdown;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GitOpsConfig {
    pub repo_url: String,
    pub branch: String,
    /// State document path relative to the repository root.
    pub state_path: PathBuf,
    pub interval: Duration,
    /// Local clone directory.
    pub checkout_dir: PathBuf,
}

impl GitOpsConfig {
    pub fn new(repo_url: impl Into<String>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: DEFAULT_BRANCH.to_string(),
            state_path: state_path.into(),
            interval: DEFAULT_INTERVAL,
            checkout_dir: std::env::temp_dir().join("pedge-gitops"),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.checkout_dir.join(&self.state_path)
    }
}

/// Callback receiving every freshly validated state document.
pub type OnUpdate = Box<dyn Fn(State) -> Result<()> + Send + Sync>;

pub struct GitOpsSync {
    config: GitOpsConfig,
    runner: Arc<dyn CommandRunner>,
    on_update: OnUpdate,
}

/// Whether `git pull` output reports new commits.
pub fn contains_change(pull_output: &str) -> bool {
    let out = pull_output.trim();
    !(out.is_empty() || out == "Already up to date." || out == "Already up-to-date.")
}

impl GitOpsSync {
    pub fn new(config: GitOpsConfig, runner: Arc<dyn CommandRunner>, on_update: OnUpdate) -> Self {
        Self {
            config,
            runner,
            on_update,
        }
    }

    pub fn config(&self) -> &GitOpsConfig {
        &self.config
    }

    /// Clone (or reuse) the checkout, then pull on every interval until shutdown.
    /// Only a failed initial clone is an error.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        info!(
            "Starting GitOps sync: {}@{} every {:?} ({})",
            self.config.repo_url,
            self.config.branch,
            self.config.interval,
            self.config.state_path.display()
        );

        self.ensure_checkout().await.context("Initial clone failed")?;
        if let Err(e) = self.check_and_update() {
            warn!("Initial GitOps state load failed: {:#}", e);
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick is immediate; the checkout was just read
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.pull().await {
                        Ok(output) if contains_change(&output) => {
                            info!("Pulled new commits from {}", self.config.repo_url);
                        }
                        Ok(_) => debug!("GitOps checkout already up to date"),
                        Err(e) => {
                            warn!("GitOps pull failed: {:#}", e);
                            continue;
                        }
                    }
                    if let Err(e) = self.check_and_update() {
                        warn!("GitOps update failed: {:#}", e);
                    }
                }
                _ = shutdown.wait() => break,
            }
        }

        info!("GitOps sync stopped");
        Ok(())
    }

    async fn ensure_checkout(&self) -> Result<()> {
        let dir = &self.config.checkout_dir;
        if dir.join(".git").exists() {
            info!("Reusing GitOps checkout at {}", dir.display());
            return Ok(());
        }
        info!("Cloning {} into {}", self.config.repo_url, dir.display());
        let dir = path_arg(dir)?;
        run_checked(
            self.runner.as_ref(),
            "git",
            &[
                "clone",
                "--depth=1",
                "--branch",
                &self.config.branch,
                &self.config.repo_url,
                dir,
            ],
        )
        .await?;
        Ok(())
    }

    async fn pull(&self) -> Result<String> {
        let dir = path_arg(&self.config.checkout_dir)?;
        let out = run_checked(
            self.runner.as_ref(),
            "git",
            &["-C", dir, "pull", "origin", &self.config.branch],
        )
        .await?;
        Ok(out.stdout)
    }

    /// Re-read and validate the state document, then hand it to the callback.
    pub fn check_and_update(&self) -> Result<State> {
        let file = self.config.state_file();
        let state = State::load(&file)
            .with_context(|| format!("Failed to load GitOps state {}", file.display()))?;
        info!("GitOps state version {} loaded, applying", state.version);
        (self.on_update)(state.clone()).context("Update callback failed")?;
        Ok(state)
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Non UTF-8 path {}", path.display()))
}
