pub mod sweeper;

use tokio::sync::broadcast;

/// Coordinator for background tasks.
/// Holds a shutdown broadcast sender.
pub struct BackgroundCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl BackgroundCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver for a background task.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal all background tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Default for BackgroundCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
