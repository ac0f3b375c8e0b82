//! Caller-supplied cancellation and deadlines.
//!
//! Every driver operation takes a [`Context`]. Cancellation is delivered
//! through a `watch` channel owned by a [`CancelHandle`]; a deadline is an
//! optional [`Instant`]. Long waits race their future against
//! [`Context::cancelled`] so a cancelled caller is never left hanging.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{TopoError, TopoResult};

/// Cancellation scope passed to every runtime operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Owner side of a cancellable [`Context`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every context derived from this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled through the returned handle.
    #[must_use]
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel: Some(rx),
                deadline: None,
            },
            CancelHandle { tx },
        )
    }

    /// Derive a context that additionally expires after `timeout`.
    ///
    /// An earlier parent deadline is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the handle fired or the deadline passed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let cancel = async {
            match &self.cancel {
                Some(rx) => {
                    let mut rx = rx.clone();
                    // a dropped handle can no longer cancel
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = cancel => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => cancel.await,
        }
    }

    /// The abort error matching why this context finished.
    #[must_use]
    pub fn abort_error(&self, operation: &str) -> TopoError {
        let cancelled = self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        if !cancelled && self.deadline.is_some_and(|d| Instant::now() >= d) {
            TopoError::DeadlineExceeded {
                operation: operation.to_string(),
            }
        } else {
            TopoError::Cancelled {
                operation: operation.to_string(),
            }
        }
    }

    /// Fail fast if the context is already finished.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::Cancelled`] or [`TopoError::DeadlineExceeded`].
    pub fn check(&self, operation: &str) -> TopoResult<()> {
        if self.is_done() {
            return Err(self.abort_error(operation));
        }
        Ok(())
    }

    /// Run `fut` until it completes or the context finishes.
    ///
    /// The future is dropped on abort, which kills any child process
    /// spawned with `kill_on_drop`.
    ///
    /// # Errors
    ///
    /// Returns the future's error, or an abort error naming `operation`.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> TopoResult<T>
    where
        F: Future<Output = TopoResult<T>>,
    {
        tokio::select! {
            res = fut => res,
            () = self.cancelled() => {
                tracing::debug!(operation, "operation aborted by caller");
                Err(self.abort_error(operation))
            }
        }
    }
}
