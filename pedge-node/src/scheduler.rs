//! Periodic driver: compliance check, then a reconciliation pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::metrics::Collector;
use crate::reconciler::{ReconcileMode, Reconciler};
use crate::shutdown::Shutdown;
use crate::source::StateHandle;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    interval: Duration,
    collector: Arc<Collector>,
    reconciler: Arc<Reconciler>,
    state: StateHandle,
}

impl Scheduler {
    pub fn new(
        interval: Duration,
        collector: Arc<Collector>,
        reconciler: Arc<Reconciler>,
        state: StateHandle,
    ) -> Self {
        Self {
            interval,
            collector,
            reconciler,
            state,
        }
    }

    /// One tick: metrics first, then reconciliation unless disabled.
    pub async fn tick(&self) {
        let state = self.state.load();
        self.collector.check_and_update(&state).await;

        if self.reconciler.mode() == ReconcileMode::Disabled {
            debug!("Reconciliation disabled, skipping pass");
            return;
        }
        self.reconciler.reconcile_all(&state).await;
    }

    /// Tick immediately, then every interval until shutdown. A tick that is
    /// already running when shutdown fires is finished first.
    pub async fn run(self, mut shutdown: Shutdown) {
        info!("Scheduler started (interval {:?})", self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.wait() => break,
            }
        }
        info!("Scheduler stopped");
    }
}
