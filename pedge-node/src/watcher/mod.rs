//! Event-driven drift detection.
//!
//! Each enabled listener runs as its own task and pushes [`Event`]s into one
//! bounded queue. A single consumer drains the queue and asks the reconciler
//! for a pass when an event may indicate drift.
//!
//! Producers block when the queue is full; nothing is dropped. Listeners are
//! only implemented for Linux. Elsewhere every enabled listener logs that it
//! is unavailable and idles until shutdown, leaving periodic checks as the
//! only drift detection.

mod event;

#[cfg(target_os = "linux")]
mod auditd;
#[cfg(target_os = "linux")]
mod dbus;
#[cfg(target_os = "linux")]
mod inotify;
#[cfg(target_os = "linux")]
mod journald;
#[cfg(not(target_os = "linux"))]
mod stub;

pub use event::{Event, EventKind, affects_managed_state};

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pedge_state::{State, WatcherConfig, Watchers};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, error, info, warn};

use crate::reconciler::{ReconcileResult, Reconciler};
use crate::shutdown::Shutdown;
use crate::source::StateHandle;

/// Capacity of the shared event queue.
pub const QUEUE_CAPACITY: usize = 100;

/// What the event consumer needs from the reconciler.
#[async_trait]
pub trait EventReconciler: Send + Sync {
    async fn reconcile_event(
        &self,
        event_type: &str,
        resource: &str,
        state: &State,
    ) -> Vec<ReconcileResult>;
}

#[async_trait]
impl EventReconciler for Reconciler {
    async fn reconcile_event(
        &self,
        event_type: &str,
        resource: &str,
        state: &State,
    ) -> Vec<ReconcileResult> {
        Reconciler::reconcile_event(self, event_type, resource, state).await
    }
}

/// Producer side of the event queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    shutdown: Shutdown,
}

impl EventSender {
    /// Queue an event, waiting while the queue is full. Returns `false` once
    /// shutdown has started or the consumer is gone; the listener should exit.
    pub async fn send(&mut self, event: Event) -> bool {
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.shutdown.wait() => false,
        }
    }
}

/// One OS event source.
#[async_trait]
pub trait Listener: Send {
    fn name(&self) -> &'static str;

    /// Run until shutdown or until the source goes away.
    async fn run(self: Box<Self>, events: EventSender, shutdown: Shutdown) -> Result<()>;
}

/// Turns queued events into reconciliation requests.
pub struct Dispatcher {
    reconciler: Arc<dyn EventReconciler>,
    state: StateHandle,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<dyn EventReconciler>, state: StateHandle) -> Self {
        Self { reconciler, state }
    }

    /// Handle one event. Returns whether a reconciliation was triggered.
    pub async fn handle(&self, event: &Event) -> bool {
        info!(
            kind = %event.kind,
            source = event.source,
            subject = event.subject(),
            "Event received at {}",
            event.timestamp.to_rfc3339()
        );

        let trigger = match event.kind {
            EventKind::FileModified | EventKind::UnitStateChanged => true,
            EventKind::ServiceLog => false,
            EventKind::CommandExecuted => event
                .command
                .as_deref()
                .is_some_and(affects_managed_state),
        };
        if !trigger {
            return false;
        }

        let state = self.state.load();
        let results = self
            .reconciler
            .reconcile_event(event.kind.as_str(), event.subject(), &state)
            .await;
        let failed = results.iter().filter(|r| r.is_failed()).count();
        if failed > 0 {
            warn!(
                "Event-triggered reconciliation for {} had {} failures",
                event.subject(),
                failed
            );
        }
        true
    }
}

/// Supervises the listeners and the consumer.
pub struct EventWatcher {
    config: Watchers,
    dispatcher: Arc<Dispatcher>,
}

impl EventWatcher {
    pub fn new(
        config: WatcherConfig,
        reconciler: Arc<dyn EventReconciler>,
        state: StateHandle,
    ) -> Self {
        Self {
            config: config.watchers,
            dispatcher: Arc::new(Dispatcher::new(reconciler, state)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start the consumer and every enabled platform listener.
    pub fn start(&self, shutdown: Shutdown) -> Result<WatcherHandle> {
        if !self.config.enabled {
            bail!("watchers are disabled in config");
        }
        Ok(self.start_with(platform_listeners(&self.config), shutdown))
    }

    /// Start the consumer with an explicit listener set.
    pub fn start_with(&self, listeners: Vec<Box<dyn Listener>>, shutdown: Shutdown) -> WatcherHandle {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut tasks = JoinSet::new();

        tasks.spawn(consume(self.dispatcher.clone(), rx, shutdown.clone()));

        for listener in listeners {
            let name = listener.name();
            info!("Starting {} watcher", name);
            let events = EventSender {
                tx: tx.clone(),
                shutdown: shutdown.clone(),
            };
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                match listener.run(events, shutdown).await {
                    Ok(()) => info!("{} watcher stopped", name),
                    Err(e) => error!("{} watcher failed: {:#}", name, e),
                }
            });
        }

        WatcherHandle { tasks }
    }
}

/// Running watcher tasks.
pub struct WatcherHandle {
    tasks: JoinSet<()>,
}

impl WatcherHandle {
    /// Wait for every task to exit. Call after triggering shutdown.
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!("Watcher task panicked: {}", e);
            }
        }
        info!("Event watchers stopped");
    }
}

async fn consume(dispatcher: Arc<Dispatcher>, mut rx: mpsc::Receiver<Event>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    dispatcher.handle(&event).await;
                }
                None => break,
            },
            _ = shutdown.wait() => break,
        }
    }
    debug!("Event consumer exited");
}

#[cfg(target_os = "linux")]
fn platform_listeners(cfg: &Watchers) -> Vec<Box<dyn Listener>> {
    let mut listeners: Vec<Box<dyn Listener>> = Vec::new();
    if cfg.inotify.enabled {
        listeners.push(Box::new(inotify::InotifyListener::new(cfg.inotify.paths.clone())));
    }
    if cfg.journald.enabled {
        listeners.push(Box::new(journald::JournaldListener::new(cfg.journald.units.clone())));
    }
    if cfg.auditd.enabled {
        listeners.push(Box::new(auditd::AuditdListener::new(cfg.auditd.commands.clone())));
    }
    if cfg.dbus.enabled {
        listeners.push(Box::new(dbus::DbusListener));
    }
    listeners
}

#[cfg(not(target_os = "linux"))]
fn platform_listeners(cfg: &Watchers) -> Vec<Box<dyn Listener>> {
    stub::listeners(cfg)
}

/// Spawn a long-running reader process and stream its stdout lines.
pub(crate) fn follow(program: &str, args: &[&str]) -> Result<(Child, LinesStream<BufReader<ChildStdout>>)> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("No stdout from {program}"))?;
    Ok((child, LinesStream::new(BufReader::new(stdout).lines())))
}
