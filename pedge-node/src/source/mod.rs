//! Where desired state comes from and how the active snapshot is shared.

pub mod gitops;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use pedge_state::{ControlPlaneClient, State};
use tracing::{info, warn};

/// Shared pointer to the active desired state.
///
/// Readers take a snapshot with [`load`](Self::load) at the start of an
/// operation and keep it for the whole operation. Writers swap in a new
/// document wholesale; an in-flight pass keeps the snapshot it started with.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<ArcSwap<State>>,
}

impl StateHandle {
    pub fn new(state: State) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(state)),
        }
    }

    pub fn load(&self) -> Arc<State> {
        self.inner.load_full()
    }

    pub fn replace(&self, state: State) {
        let previous = self.inner.swap(Arc::new(state));
        info!(
            "Active state replaced (version {} -> {})",
            previous.version,
            self.inner.load().version
        );
    }
}

/// Where the startup state was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    /// Fetched from the control plane and cached locally.
    Remote,
    /// Local file, used because the control plane could not be reached.
    LocalFallback,
    Local,
}

/// Load the startup state.
///
/// With a control plane configured the remote document wins and is cached to
/// `local_path`; on any remote failure the local file is used instead. Fails
/// only when no usable document can be found at all.
pub async fn load_initial(
    local_path: &Path,
    remote: Option<(&ControlPlaneClient, &str)>,
) -> Result<(State, StateOrigin)> {
    let mut origin = StateOrigin::Local;

    if let Some((client, node_id)) = remote {
        match client.get_state(node_id).await {
            Ok(state) => {
                info!(
                    "Fetched state version {} for node {} from {}",
                    state.version,
                    node_id,
                    client.base_url()
                );
                if let Err(e) = state.save(local_path) {
                    warn!("Failed to cache state to {}: {}", local_path.display(), e);
                }
                return Ok((state, StateOrigin::Remote));
            }
            Err(e) => {
                warn!(
                    "Failed to fetch state from control plane, falling back to {}: {}",
                    local_path.display(),
                    e
                );
                origin = StateOrigin::LocalFallback;
            }
        }
    }

    let state = State::load(local_path)
        .with_context(|| format!("Failed to load state from {}", local_path.display()))?;
    info!(
        "Loaded state version {} from {}",
        state.version,
        local_path.display()
    );
    Ok((state, origin))
}
