//! Process-wide shutdown signal shared by every long-running task.

use tokio::sync::watch;

/// Trigger side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Cloneable listener side.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

/// Create a linked trigger/listener pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown has been triggered (immediately if it already was).
    /// A dropped trigger counts as shutdown.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}
