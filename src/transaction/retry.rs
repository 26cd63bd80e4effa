//! Bounded retries for aborted transactions.
//!
//! A transaction never retries by itself. [`RetryState`] is the explicit loop
//! counter a caller keeps across attempts: each abort goes through
//! [`RetryState::on_conflict`], which either sleeps the backoff or reports
//! [`Error::RetriesExhausted`]. [`run_with_retries`] packages the whole loop.
//!
//! Backoff grows geometrically from `initial_backoff` by `multiplier` and is
//! capped at `max_backoff`:
//!
//! ```text
//! attempt   1     2     3     4     5
//! backoff   5ms   10ms  20ms  40ms  80ms   (defaults)
//! ```

use crate::channel::{CommandChannel, Deadline};
use crate::error::{ConflictError, Error, Result};
use crate::reply::Reply;
use crate::transaction::{OptimisticTransaction, TransactionOutcome};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included (default: 5)
    pub max_attempts: u32,
    /// Wait after the first abort (default: 5ms)
    pub initial_backoff: Duration,
    /// Upper bound for any wait (default: 200ms)
    pub max_backoff: Duration,
    /// Growth factor between consecutive waits (default: 2)
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Retries immediately.
    pub fn without_backoff(mut self) -> Self {
        self.initial_backoff = Duration::ZERO;
        self.max_backoff = Duration::ZERO;
        self
    }

    /// The wait after the `attempt`-th abort (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut backoff = self.initial_backoff;
        for _ in 1..attempt {
            if backoff >= self.max_backoff || backoff.is_zero() || self.multiplier <= 1 {
                break;
            }
            backoff = backoff.saturating_mul(self.multiplier);
        }
        backoff.min(self.max_backoff)
    }
}

/// Attempts made so far under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Aborted attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records an aborted attempt.
    ///
    /// Waits the backoff and returns `Ok` when another attempt is allowed.
    /// Fails with [`Error::RetriesExhausted`] once `max_attempts` attempts
    /// have aborted, or with a transport error if the deadline fires while
    /// waiting.
    pub async fn on_conflict(&mut self, conflict: ConflictError, deadline: &Deadline) -> Result<()> {
        self.attempts += 1;

        if self.attempts >= self.policy.max_attempts.max(1) {
            warn!(
                attempts = self.attempts,
                keys = conflict.keys().len(),
                "Giving up on transaction"
            );
            return Err(Error::RetriesExhausted {
                attempts: self.attempts,
                last: conflict,
            });
        }

        let backoff = self.policy.backoff_for(self.attempts);
        debug!(
            attempt = self.attempts,
            backoff_ms = backoff.as_millis() as u64,
            "Retrying aborted transaction"
        );
        if !backoff.is_zero() {
            deadline.run(tokio::time::sleep(backoff)).await?;
        }
        Ok(())
    }
}

/// A boxed, sendable future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a successful [`run_with_retries`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport<T> {
    /// Value returned by the last (committed) run of the body
    pub value: T,
    /// Replies to the committed writes
    pub replies: Vec<Reply>,
    /// Attempts made, the committed one included
    pub attempts: u32,
}

/// Runs a transaction body until it commits or the policy gives up.
///
/// Each attempt begins on `keys`, hands the transaction to `body` (which
/// reads and queues writes), then commits. Aborts are retried per `policy`.
/// Errors from the body and failed commits end the loop immediately.
///
/// # Example
///
/// ```
/// use flashkv_client::channel::{Deadline, MemoryStore};
/// use flashkv_client::transaction::{run_with_retries, RetryPolicy};
/// use flashkv_client::{Command, Reply};
/// use bytes::Bytes;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let keys = [Bytes::from("hits")];
///
/// let report = run_with_retries(&store, &keys, &RetryPolicy::default(), &Deadline::none(), |tx, deadline| {
///     Box::pin(async move {
///         let hits = tx.read("hits", deadline).await?.map_or(0, |v| v.len());
///         tx.queue_write(Command::incr("hits"))?;
///         Ok::<_, flashkv_client::Error>(hits)
///     })
/// })
/// .await
/// .unwrap();
///
/// assert_eq!(report.attempts, 1);
/// assert_eq!(report.replies, vec![Reply::integer(1)]);
/// # });
/// ```
pub async fn run_with_retries<C, T, F>(
    channel: C,
    keys: &[Bytes],
    policy: &RetryPolicy,
    deadline: &Deadline,
    mut body: F,
) -> Result<CommitReport<T>>
where
    C: CommandChannel,
    F: for<'a> FnMut(&'a mut OptimisticTransaction<C>, &'a Deadline) -> BoxFuture<'a, Result<T>>,
{
    let mut tx = OptimisticTransaction::new(channel);
    let mut retry = RetryState::new(policy.clone());

    loop {
        tx.begin(keys.iter().cloned(), deadline).await?;
        let value = body(&mut tx, deadline).await?;

        match tx.commit(deadline).await? {
            TransactionOutcome::Committed(replies) => {
                return Ok(CommitReport {
                    value,
                    replies,
                    attempts: tx.attempt(),
                })
            }
            TransactionOutcome::Aborted(conflict) => retry.on_conflict(conflict, deadline).await?,
            TransactionOutcome::Failed(err) => return Err(err),
        }
    }
}
