//! Cooperative cancellation shared by the controller and the deployment
//! driver.

use anyhow::Result;
use speedrun_common::SpeedrunError;
use std::future::Future;
use tokio::sync::watch;

/// Raises the paired [`CancelSignal`].
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is gone without having cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Drive `fut` unless cancellation wins first, in which case `fut` is
/// dropped and [`SpeedrunError::Cancelled`] is returned.
pub async fn until_cancelled<T>(cancel: &CancelSignal, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        res = fut => res,
        _ = cancel.cancelled() => {
            println!("🛑 Cancellation requested, cleaning up...");
            Err(SpeedrunError::Cancelled.into())
        }
    }
}
