use anyhow::Result;
use async_trait::async_trait;
use pedge_state::Watchers;
use tracing::warn;

use super::{EventSender, Listener};
use crate::shutdown::Shutdown;

/// Stand-in for a listener this platform cannot provide.
struct Unavailable(&'static str);

#[async_trait]
impl Listener for Unavailable {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn run(self: Box<Self>, _events: EventSender, mut shutdown: Shutdown) -> Result<()> {
        warn!(
            "[{}] Not available on {}, relying on periodic checks",
            self.0,
            std::env::consts::OS
        );
        shutdown.wait().await;
        Ok(())
    }
}

pub(super) fn listeners(cfg: &Watchers) -> Vec<Box<dyn Listener>> {
    [
        ("inotify", cfg.inotify.enabled),
        ("journald", cfg.journald.enabled),
        ("auditd", cfg.auditd.enabled),
        ("dbus", cfg.dbus.enabled),
    ]
    .into_iter()
    .filter(|(_, enabled)| *enabled)
    .map(|(name, _)| Box::new(Unavailable(name)) as Box<dyn Listener>)
    .collect()
}
