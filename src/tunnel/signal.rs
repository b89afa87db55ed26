//! Close signals and single-use completions shared by links, sessions and the tunnel

use super::TunnelError;
use tokio::sync::{oneshot, watch};

/// A broadcast "closed" flag that can be set once and awaited by anyone
#[derive(Debug)]
pub struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Set the flag. Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for only fails if we are torn down
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Create a linked completion pair
///
/// The [`Completer`] travels with a queued request; the [`Completion`] stays
/// with the caller, which awaits the outcome.
pub fn completion() -> (Completer, Completion) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx: Some(tx) }, Completion { rx })
}

/// Sending half of a completion
#[derive(Debug)]
pub struct Completer {
    tx: Option<oneshot::Sender<Result<(), TunnelError>>>,
}

impl Completer {
    /// A completer nobody waits on
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Report the outcome. Later calls are ignored.
    pub fn complete(&mut self, result: Result<(), TunnelError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

/// Receiving half of a completion
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), TunnelError>>,
}

impl Completion {
    /// Wait for the outcome. A dropped completer counts as `Closed`.
    pub async fn wait(self) -> Result<(), TunnelError> {
        self.rx.await.unwrap_or(Err(TunnelError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_signal_once() {
        let signal = Arc::new(CloseSignal::new());
        assert!(!signal.is_closed());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };

        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_completion() {
        let (mut done, pending) = completion();
        done.complete(Err(TunnelError::LinkNotFound));
        done.complete(Ok(()));
        assert!(matches!(pending.wait().await, Err(TunnelError::LinkNotFound)));

        let (done, pending) = completion();
        drop(done);
        assert!(matches!(pending.wait().await, Err(TunnelError::Closed)));
    }
}
