//! Cooperative shutdown signal shared by the seeder's tasks.

use tokio::sync::watch;

/// Creates a connected trigger and signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

/// Fires the shutdown signal. Dropping the trigger also counts as firing it.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Err only means every signal is already gone.
        let _ = self.0.send(true);
    }
}

/// Observes the shutdown signal. Cheap to clone, one per task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}
