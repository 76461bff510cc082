use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{Event, EventSender, Listener, QUEUE_CAPACITY};
use crate::shutdown::Shutdown;

/// Filesystem changes under the configured paths.
pub struct InotifyListener {
    paths: Vec<PathBuf>,
}

impl InotifyListener {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

/// Writes and creations count; reads, renames and removals do not.
fn is_modification(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
    )
}

type RawEvent = notify::Result<notify::Event>;

/// Callback handed to notify. It runs on notify's own thread, so a full
/// channel parks that thread until the listener catches up.
fn forward(tx: mpsc::Sender<RawEvent>) -> impl FnMut(RawEvent) + Send + 'static {
    move |res| {
        let _ = tx.blocking_send(res);
    }
}

#[async_trait]
impl Listener for InotifyListener {
    fn name(&self) -> &'static str {
        "inotify"
    }

    async fn run(self: Box<Self>, mut events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        if self.paths.is_empty() {
            info!("[inotify] No paths configured, skipping");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(forward(tx))
            .context("Failed to create inotify watcher")?;

        for path in &self.paths {
            match watcher.watch(path, RecursiveMode::Recursive) {
                Ok(()) => info!("[inotify] Watching {}", path.display()),
                Err(e) => warn!("[inotify] Failed to watch {}: {}", path.display(), e),
            }
        }

        loop {
            tokio::select! {
                res = rx.recv() => match res {
                    Some(Ok(event)) if is_modification(&event.kind) => {
                        for path in &event.paths {
                            if !events.send(Event::file_modified("inotify", path)).await {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("[inotify] Watch error: {}", e),
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        // Release a callback parked on a full channel before stopping notify.
        drop(rx);
        drop(watcher);
        Ok(())
    }
}
