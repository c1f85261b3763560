//! Stop signal shared by the engine task and the tasks running alongside it.
//!
//! [`shutdown_pair`] returns a [`ShutdownTrigger`], kept by whoever owns the task, and a [`ShutdownSignal`], moved into
//! the task and polled from its `select!` loop.

use tokio::sync::oneshot;

/// Creates a connected trigger and signal.
pub fn shutdown_pair() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = oneshot::channel();
    (ShutdownTrigger { tx }, ShutdownSignal { rx: Some(rx) })
}

/// Asks a task to stop. Dropping the trigger has the same effect as firing it.
pub struct ShutdownTrigger {
    tx: oneshot::Sender<()>,
}

impl ShutdownTrigger {
    /// Fires the trigger.
    pub fn trigger(self) {
        let _ = self.tx.send(());
    }
}

/// The receiving side of a [`ShutdownTrigger`].
pub struct ShutdownSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    /// Resolves once the trigger has fired or been dropped.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves the signal armed, so it can be recreated on
    /// every `select!` iteration. Once resolved, later calls return immediately.
    pub async fn triggered(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let _ = rx.await;
            self.rx = None;
        }
    }
}
