//! Deadlines and Cancellation
//!
//! Every operation that waits on the store takes a [`Deadline`]: an optional
//! instant after which the wait is abandoned, plus an optional cancellation
//! signal. Either one firing turns the pending exchange into a
//! [`TransportError`] (`DeadlineElapsed` or `Cancelled`).
//!
//! Cancellation uses a `tokio::sync::watch` channel, the same shutdown
//! mechanism the expiry sweeper uses. One [`CancelHandle`] can stop any
//! number of deadlines derived from it.
//!
//! ```
//! use flashkv_client::channel::Deadline;
//! use std::time::Duration;
//!
//! let (deadline, cancel) = Deadline::cancellable();
//! let deadline = deadline.with_timeout(Duration::from_secs(5));
//!
//! assert!(deadline.check().is_ok());
//! cancel.cancel();
//! assert!(deadline.check().is_err());
//! ```

use crate::error::TransportError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// When to give up on a store exchange.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Deadline {
    /// Waits as long as the store takes.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            cancel: None,
        }
    }

    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// A deadline without a time limit, plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let handle = CancelHandle::new();
        (handle.deadline(), handle)
    }

    /// Adds (or tightens) a time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.at = Some(self.at.map_or(at, |current| current.min(at)));
        self
    }

    /// Also stops when `handle` fires.
    pub fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel = Some(handle.tx.subscribe());
        self
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left before expiry, if there is a time limit.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Fails if the deadline has already fired.
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else if self.is_expired() {
            Err(TransportError::DeadlineElapsed)
        } else {
            Ok(())
        }
    }

    /// Drives `operation` until it completes or the deadline fires.
    ///
    /// Cancellation wins over expiry, and both win over an operation that
    /// becomes ready at the same moment.
    pub async fn run<F>(&self, operation: F) -> Result<F::Output, TransportError>
    where
        F: Future,
    {
        self.check()?;

        let mut cancel = self.cancel.clone();
        let cancelled = async move {
            match cancel.as_mut() {
                Some(rx) => {
                    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                    if closed {
                        // Handle dropped without cancelling
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(TransportError::Cancelled),
            _ = expired => Err(TransportError::DeadlineElapsed),
            output = operation => Ok(output),
        }
    }
}

/// Fires every [`Deadline`] derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new deadline, without time limit, stopped by this handle.
    pub fn deadline(&self) -> Deadline {
        Deadline::none().with_cancel(self)
    }
}
