//! Optimistic Transactions
//!
//! An [`OptimisticTransaction`] is a watch-then-commit attempt over one or
//! more keys. It records a fingerprint for every key it watches, lets the
//! caller read live values and queue writes, and at commit time applies the
//! queued writes atomically only if no watched key changed in between.
//!
//! ## State Machine
//!
//! ```text
//!            begin(keys)          queue_write
//!   Idle ───────────────► Watching ──────────► Planning ◄──┐
//!    ▲                      │  ▲ read            │  │      │ read /
//!    │                      │  └──┘              │  └──────┘ queue_write
//!    │                      └────── commit ──────┤
//!    │                                           ▼
//!    │                                       Committing
//!    │                               ┌───────────┼───────────┐
//!    │                               ▼           ▼           ▼
//!    │                           Committed    Aborted      Failed
//!    └── begin (new attempt) ────────┴───────────┴───────────┘
//! ```
//!
//! Conflicts are outcomes, not errors: [`commit`](OptimisticTransaction::commit)
//! returns [`TransactionOutcome::Aborted`] with the keys that moved. Nothing
//! here retries on its own; see [`retry`] for the bounded loop.

pub mod retry;
pub mod watch;

pub use retry::{run_with_retries, BoxFuture, CommitReport, RetryPolicy, RetryState};
pub use watch::{TransactionPlan, WatchSet};

use crate::channel::{CommandChannel, Deadline, Exchange, SendError};
use crate::commands::Command;
use crate::error::{CommandError, ConflictError, Error, Result, TransportError, UsageError};
use crate::reply::Reply;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Idle,
    Watching,
    Planning,
    Committing,
    Committed,
    Aborted,
    Failed,
}

impl TxState {
    pub fn name(self) -> &'static str {
        match self {
            TxState::Idle => "idle",
            TxState::Watching => "watching",
            TxState::Planning => "planning",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
            TxState::Failed => "failed",
        }
    }

    /// Reads, writes and commit are accepted.
    pub fn is_active(self) -> bool {
        matches!(self, TxState::Watching | TxState::Planning)
    }

    /// The attempt is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted | TxState::Failed)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a commit attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Every queued write was applied; one reply per write, in plan order
    Committed(Vec<Reply>),
    /// A watched key changed; nothing was applied
    Aborted(ConflictError),
    /// The attempt could not complete; nothing was applied
    Failed(Error),
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TransactionOutcome::Aborted(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TransactionOutcome::Failed(_))
    }

    /// The terminal state this outcome puts the transaction in.
    pub fn state(&self) -> TxState {
        match self {
            TransactionOutcome::Committed(_) => TxState::Committed,
            TransactionOutcome::Aborted(_) => TxState::Aborted,
            TransactionOutcome::Failed(_) => TxState::Failed,
        }
    }

    /// The keys that moved, for an aborted attempt.
    pub fn conflict(&self) -> Option<&ConflictError> {
        match self {
            TransactionOutcome::Aborted(conflict) => Some(conflict),
            _ => None,
        }
    }

    /// Turns aborts and failures into errors.
    pub fn into_result(self) -> Result<Vec<Reply>> {
        match self {
            TransactionOutcome::Committed(replies) => Ok(replies),
            TransactionOutcome::Aborted(conflict) => Err(Error::Conflict(conflict)),
            TransactionOutcome::Failed(err) => Err(err),
        }
    }
}

/// One watch-then-commit attempt at a time over a shared channel.
///
/// # Example
///
/// ```
/// use flashkv_client::channel::{Deadline, MemoryStore};
/// use flashkv_client::{Command, OptimisticTransaction, Reply};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// store.execute(&Command::set("balance", "100")).unwrap();
///
/// let deadline = Deadline::none();
/// let mut tx = OptimisticTransaction::new(&store);
/// tx.begin(["balance"], &deadline).await.unwrap();
///
/// let balance = tx.read("balance", &deadline).await.unwrap().unwrap();
/// let balance: i64 = std::str::from_utf8(&balance).unwrap().parse().unwrap();
/// tx.queue_write(Command::set("balance", (balance + 50).to_string())).unwrap();
///
/// let outcome = tx.commit(&deadline).await.unwrap();
/// assert!(outcome.is_committed());
/// assert_eq!(store.execute(&Command::get("balance")), Ok(Reply::bulk("150")));
/// # });
/// ```
#[derive(Debug)]
pub struct OptimisticTransaction<C> {
    channel: C,
    state: TxState,
    watch: WatchSet,
    plan: TransactionPlan,
    attempt: u32,
}

impl<C: CommandChannel> OptimisticTransaction<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            state: TxState::Idle,
            watch: WatchSet::new(),
            plan: TransactionPlan::new(),
            attempt: 0,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch
    }

    pub fn plan(&self) -> &TransactionPlan {
        &self.plan
    }

    /// Number of attempts started with [`begin`](Self::begin).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Abandons the current attempt without sending anything.
    pub fn reset(&mut self) {
        self.state = TxState::Idle;
        self.watch = WatchSet::new();
        self.plan = TransactionPlan::new();
    }

    /// Starts an attempt by fingerprinting every key in `keys`.
    ///
    /// Valid from `Idle` or after a finished attempt. Duplicated keys are
    /// watched once. If the store cannot be reached the attempt is `Failed`.
    pub async fn begin<I, K>(&mut self, keys: I, deadline: &Deadline) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        if self.state != TxState::Idle && !self.state.is_terminal() {
            return Err(self.invalid("begin"));
        }

        let keys: Vec<Bytes> = keys
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Err(UsageError::EmptyWatchSet.into());
        }

        self.attempt += 1;
        self.watch = WatchSet::new();
        self.plan = TransactionPlan::new();

        let tokens = match self.channel.fingerprints(&keys, deadline).await {
            Ok(tokens) if tokens.len() == keys.len() => tokens,
            Ok(tokens) => {
                return Err(self.fail(TransportError::Protocol(format!(
                    "expected {} fingerprints, got {}",
                    keys.len(),
                    tokens.len()
                ))))
            }
            Err(err) => return Err(self.fail(err)),
        };

        for (key, token) in keys.into_iter().zip(tokens) {
            self.watch.insert(key, token);
        }
        self.state = TxState::Watching;
        debug!(
            attempt = self.attempt,
            keys = self.watch.len(),
            "Transaction watching"
        );
        Ok(())
    }

    /// Reads the live string value of `key`, watching it if needed.
    pub async fn read(&mut self, key: impl Into<Bytes>, deadline: &Deadline) -> Result<Option<Bytes>> {
        match self.read_with(Command::get(key), deadline).await? {
            Reply::Bulk(value) => Ok(Some(value)),
            Reply::Nil => Ok(None),
            other => Err(self.fail(TransportError::Protocol(format!(
                "unexpected reply to GET: {:?}",
                other
            )))),
        }
    }

    /// Runs a read command inside the attempt.
    ///
    /// A key outside the watch set is fingerprinted before it is read, so a
    /// write that lands between the two is still caught at commit. A store
    /// rejection (such as `WRONGTYPE`) is returned without ending the attempt.
    pub async fn read_with(&mut self, command: Command, deadline: &Deadline) -> Result<Reply> {
        self.ensure_active("read")?;
        if command.is_write() {
            return Err(UsageError::NotARead(command.verb()).into());
        }
        if !command.verb().is_keyed() {
            return Err(UsageError::NotKeyed(command.verb()).into());
        }

        let key = command.key().clone();
        if !self.watch.contains(&key) {
            let token = match self.channel.fingerprint(&key, deadline).await {
                Ok(token) => token,
                Err(err) => return Err(self.fail(err)),
            };
            trace!(key = %String::from_utf8_lossy(&key), "Implicitly watching key");
            self.watch.insert(key, token);
        }

        let mut results = match self.channel.send(Exchange::pipelined(vec![command]), deadline).await {
            Ok(results) => results,
            Err(SendError::Transport(err)) => return Err(self.fail(err)),
            Err(other) => {
                return Err(self.fail(TransportError::Protocol(format!(
                    "unexpected answer to read: {}",
                    other
                ))))
            }
        };

        match (results.pop(), results.is_empty()) {
            (Some(Ok(reply)), true) => Ok(reply),
            (Some(Err(CommandError::Server(message))), true) => {
                Err(Error::Command(CommandError::Server(message)))
            }
            (Some(Err(CommandError::Transport(err))), true) => Err(self.fail(err)),
            _ => Err(self.fail(TransportError::Protocol(
                "expected exactly one result for a read".into(),
            ))),
        }
    }

    /// Queues a write for commit. Nothing is sent.
    pub fn queue_write(&mut self, command: Command) -> Result<()> {
        self.ensure_active("queue a write")?;
        if !command.is_write() {
            return Err(UsageError::NotAWrite(command.verb()).into());
        }

        self.plan.push(command);
        self.state = TxState::Planning;
        Ok(())
    }

    /// Verifies the watch set and applies the plan atomically.
    ///
    /// Returns `Err` only for misuse (no active attempt). Everything the
    /// store decides comes back as a [`TransactionOutcome`], and the
    /// transaction ends in the matching terminal state.
    pub async fn commit(&mut self, deadline: &Deadline) -> Result<TransactionOutcome> {
        self.ensure_active("commit")?;
        self.state = TxState::Committing;

        let outcome = self.try_commit(deadline).await;
        self.state = outcome.state();

        match &outcome {
            TransactionOutcome::Committed(replies) => info!(
                attempt = self.attempt,
                writes = replies.len(),
                "Transaction committed"
            ),
            TransactionOutcome::Aborted(conflict) => debug!(
                attempt = self.attempt,
                keys = conflict.keys().len(),
                "Transaction aborted: watched keys changed"
            ),
            TransactionOutcome::Failed(err) => warn!(
                attempt = self.attempt,
                error = %err,
                "Transaction failed"
            ),
        }
        Ok(outcome)
    }

    async fn try_commit(&self, deadline: &Deadline) -> TransactionOutcome {
        let keys: Vec<Bytes> = self.watch.keys().cloned().collect();
        let tokens = match self.channel.fingerprints(&keys, deadline).await {
            Ok(tokens) if tokens.len() == keys.len() => tokens,
            Ok(tokens) => {
                return TransactionOutcome::Failed(Error::Transport(TransportError::Protocol(
                    format!("expected {} fingerprints, got {}", keys.len(), tokens.len()),
                )))
            }
            Err(err) => return TransactionOutcome::Failed(err.into()),
        };

        let changed = self.watch.changed_keys(keys.into_iter().zip(tokens));
        if !changed.is_empty() {
            return TransactionOutcome::Aborted(ConflictError::new(changed));
        }

        if self.plan.is_empty() {
            return TransactionOutcome::Committed(Vec::new());
        }

        let exchange = Exchange::atomic(self.plan.commands().to_vec(), self.watch.guards());
        match self.channel.send(exchange, deadline).await {
            Ok(results) if results.len() == self.plan.len() => collect_replies(results),
            Ok(results) => TransactionOutcome::Failed(Error::Transport(TransportError::Protocol(
                format!(
                    "expected {} results, got {}",
                    self.plan.len(),
                    results.len()
                ),
            ))),
            Err(SendError::Conflict(conflict)) => TransactionOutcome::Aborted(conflict),
            Err(err) => TransactionOutcome::Failed(err.into()),
        }
    }

    fn ensure_active(&self, operation: &'static str) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        UsageError::InvalidState {
            operation,
            state: self.state,
        }
        .into()
    }

    fn fail(&mut self, err: TransportError) -> Error {
        warn!(attempt = self.attempt, error = %err, "Transaction failed");
        self.state = TxState::Failed;
        Error::Transport(err)
    }
}

fn collect_replies(results: Vec<crate::error::CommandResult>) -> TransactionOutcome {
    let mut replies = Vec::with_capacity(results.len());
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(reply) => replies.push(reply),
            Err(CommandError::Server(message)) => {
                return TransactionOutcome::Failed(Error::Rejected { index, message })
            }
            Err(CommandError::Transport(err)) => return TransactionOutcome::Failed(err.into()),
        }
    }
    TransactionOutcome::Committed(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryStore, StoreConfig, VersionToken};
    use crate::error::CommandResult;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio_test::{assert_err, assert_ok};

    fn none() -> Deadline {
        Deadline::none()
    }

    fn get(store: &MemoryStore, key: &'static str) -> Reply {
        store.execute(&Command::get(key)).unwrap()
    }

    /// Lets another client write right before each atomic exchange lands.
    struct InterleavingChannel {
        store: MemoryStore,
        intruder: Command,
    }

    impl CommandChannel for InterleavingChannel {
        async fn send(
            &self,
            exchange: Exchange,
            deadline: &Deadline,
        ) -> std::result::Result<Vec<CommandResult>, SendError> {
            if exchange.is_atomic() {
                self.store.execute(&self.intruder).unwrap();
            }
            self.store.send(exchange, deadline).await
        }

        async fn fingerprint(
            &self,
            key: &Bytes,
            deadline: &Deadline,
        ) -> std::result::Result<VersionToken, TransportError> {
            self.store.fingerprint(key, deadline).await
        }
    }

    #[tokio::test]
    async fn test_commit_without_contention() {
        let store = MemoryStore::new();
        store.execute(&Command::set("a", "1")).unwrap();

        let mut tx = OptimisticTransaction::new(&store);
        assert_ok!(tx.begin(["a", "b"], &none()).await);
        assert_eq!(tx.state(), TxState::Watching);

        tx.queue_write(Command::set("a", "10")).unwrap();
        tx.queue_write(Command::set("b", "20")).unwrap();
        assert_eq!(tx.state(), TxState::Planning);

        let outcome = tx.commit(&none()).await.unwrap();

        assert_eq!(
            outcome,
            TransactionOutcome::Committed(vec![Reply::ok(), Reply::ok()])
        );
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(get(&store, "a"), Reply::bulk("10"));
        assert_eq!(get(&store, "b"), Reply::bulk("20"));
    }

    #[tokio::test]
    async fn test_external_write_aborts_commit() {
        let store = MemoryStore::new();
        store.execute(&Command::set("balance", "100")).unwrap();

        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["balance", "audit"], &none()).await.unwrap();
        tx.queue_write(Command::incr_by("balance", 50)).unwrap();
        tx.queue_write(Command::set("audit", "deposit")).unwrap();

        store.execute(&Command::set("balance", "0")).unwrap();

        let outcome = tx.commit(&none()).await.unwrap();
        assert_eq!(
            outcome.conflict(),
            Some(&ConflictError::new([Bytes::from("balance")]))
        );
        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(get(&store, "balance"), Reply::bulk("0"));
        assert_eq!(get(&store, "audit"), Reply::Nil);
    }

    #[tokio::test]
    async fn test_read_watches_new_key() {
        let store = MemoryStore::new();
        store.execute(&Command::set("price", "7")).unwrap();

        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["cart"], &none()).await.unwrap();

        let price = tx.read("price", &none()).await.unwrap();
        assert_eq!(price, Some(Bytes::from("7")));
        assert!(tx.watch_set().contains(b"price"));

        tx.queue_write(Command::set("cart", "7")).unwrap();
        store.execute(&Command::set("price", "9")).unwrap();

        let outcome = tx.commit(&none()).await.unwrap();
        assert!(outcome.conflict().unwrap().contains(b"price"));
        assert_eq!(get(&store, "cart"), Reply::Nil);
    }

    #[tokio::test]
    async fn test_read_of_missing_key_is_none() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["k"], &none()).await.unwrap();

        assert_eq!(tx.read("k", &none()).await, Ok(None));
    }

    #[tokio::test]
    async fn test_empty_plan_commits_trivially() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["a"], &none()).await.unwrap();

        let exchanges_before = store.stats().exchanges.load(std::sync::atomic::Ordering::Relaxed);
        let outcome = tx.commit(&none()).await.unwrap();

        assert_eq!(outcome, TransactionOutcome::Committed(vec![]));
        assert_eq!(
            store.stats().exchanges.load(std::sync::atomic::Ordering::Relaxed),
            exchanges_before
        );
    }

    #[tokio::test]
    async fn test_usage_errors() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);

        assert_eq!(
            tx.commit(&none()).await,
            Err(Error::Usage(UsageError::InvalidState {
                operation: "commit",
                state: TxState::Idle
            }))
        );
        assert_err!(tx.queue_write(Command::set("a", "1")));
        assert_eq!(
            tx.begin(Vec::<Bytes>::new(), &none()).await,
            Err(Error::Usage(UsageError::EmptyWatchSet))
        );
        assert_eq!(tx.state(), TxState::Idle);

        tx.begin(["a"], &none()).await.unwrap();
        assert_eq!(
            tx.queue_write(Command::get("a")),
            Err(Error::Usage(UsageError::NotAWrite(crate::Verb::Get)))
        );
        assert_eq!(
            tx.read_with(Command::del("a"), &none()).await,
            Err(Error::Usage(UsageError::NotARead(crate::Verb::Del)))
        );
        assert!(matches!(
            tx.begin(["b"], &none()).await,
            Err(Error::Usage(UsageError::InvalidState { .. }))
        ));
    }

    #[tokio::test]
    async fn test_begin_after_terminal_state_starts_new_attempt() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);

        tx.begin(["a"], &none()).await.unwrap();
        tx.queue_write(Command::set("a", "1")).unwrap();
        tx.commit(&none()).await.unwrap();
        assert_eq!(tx.attempt(), 1);

        tx.begin(["a", "a", "b"], &none()).await.unwrap();
        assert_eq!(tx.attempt(), 2);
        assert_eq!(tx.state(), TxState::Watching);
        assert_eq!(tx.watch_set().len(), 2);
        assert!(tx.plan().is_empty());
    }

    #[tokio::test]
    async fn test_read_with_store_error_keeps_attempt_alive() {
        let store = MemoryStore::new();
        store.execute(&Command::lpush("queue", ["job"])).unwrap();

        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["queue"], &none()).await.unwrap();

        let err = tx.read("queue", &none()).await.unwrap_err();
        assert!(matches!(err, Error::Command(CommandError::Server(_))));
        assert_eq!(tx.state(), TxState::Watching);

        let len = tx.read_with(Command::llen("queue"), &none()).await.unwrap();
        assert_eq!(len, Reply::integer(1));
    }

    #[tokio::test]
    async fn test_pattern_read_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["summary"], &none()).await.unwrap();

        assert_eq!(
            tx.read_with(Command::keys("user:*"), &none()).await,
            Err(Error::Usage(UsageError::NotKeyed(crate::Verb::Keys)))
        );
        assert!(!tx.watch_set().contains(b"user:*"));
        assert_eq!(tx.state(), TxState::Watching);

        tx.queue_write(Command::set("summary", "0 users")).unwrap();
        store.execute(&Command::set("summary", "1 user")).unwrap();

        let outcome = tx.commit(&none()).await.unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(get(&store, "summary"), Reply::bulk("1 user"));
    }

    #[tokio::test]
    async fn test_write_between_check_and_apply_is_caught() {
        let channel = InterleavingChannel {
            store: MemoryStore::new(),
            intruder: Command::set("seat", "taken"),
        };

        let mut tx = OptimisticTransaction::new(&channel);
        tx.begin(["seat"], &none()).await.unwrap();
        tx.queue_write(Command::set("seat", "mine")).unwrap();

        let outcome = tx.commit(&none()).await.unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(get(&channel.store, "seat"), Reply::bulk("taken"));
    }

    #[tokio::test]
    async fn test_rejected_write_applies_nothing() {
        let store = MemoryStore::new();
        store.execute(&Command::set("count", "1")).unwrap();
        store.execute(&Command::sadd("members", ["x"])).unwrap();

        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["count", "members"], &none()).await.unwrap();
        tx.queue_write(Command::incr("count")).unwrap();
        tx.queue_write(Command::incr("members")).unwrap();

        let outcome = tx.commit(&none()).await.unwrap();

        match outcome {
            TransactionOutcome::Failed(Error::Rejected { index, message }) => {
                assert_eq!(index, 1);
                assert!(message.starts_with("WRONGTYPE"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(tx.state(), TxState::Failed);
        assert_eq!(get(&store, "count"), Reply::bulk("1"));
        // The plan stays inspectable after the attempt
        assert_eq!(tx.plan().len(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_during_begin() {
        let store = MemoryStore::new();
        store.inject_fault(TransportError::ConnectionLost("refused".into()));

        let mut tx = OptimisticTransaction::new(&store);
        let err = tx.begin(["a"], &none()).await.unwrap_err();

        assert!(err.is_transport());
        assert_eq!(tx.state(), TxState::Failed);
        assert_ok!(tx.begin(["a"], &none()).await);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_fails_commit_without_writes() {
        let store = MemoryStore::with_config(
            StoreConfig::default().with_latency(Duration::from_millis(100)),
        );
        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["k"], &none()).await.unwrap();
        tx.queue_write(Command::set("k", "v")).unwrap();

        let outcome = tx
            .commit(&Deadline::after(Duration::from_millis(10)))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TransactionOutcome::Failed(Error::Transport(TransportError::DeadlineElapsed))
        );
        assert_eq!(get(&store, "k"), Reply::Nil);
    }

    #[tokio::test]
    async fn test_cancelled_commit_fails_without_writes() {
        let store = MemoryStore::new();
        let mut tx = OptimisticTransaction::new(&store);
        tx.begin(["k"], &none()).await.unwrap();
        tx.queue_write(Command::set("k", "v")).unwrap();

        let (deadline, cancel) = Deadline::cancellable();
        cancel.cancel();
        let outcome = tx.commit(&deadline).await.unwrap();

        assert!(outcome.is_failed());
        assert_eq!(get(&store, "k"), Reply::Nil);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disjoint_transactions_both_commit() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|key| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut tx = OptimisticTransaction::new(store);
                    tx.begin([key], &Deadline::none()).await?;
                    tx.queue_write(Command::set(key, "done"))?;
                    tx.commit(&Deadline::none()).await
                })
            })
            .collect();

        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(outcome.is_committed());
        }
        assert_eq!(get(&store, "left"), Reply::bulk("done"));
        assert_eq!(get(&store, "right"), Reply::bulk("done"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_transactions_never_both_commit() {
        let store = Arc::new(MemoryStore::new());
        store.execute(&Command::set("counter", "0")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    let deadline = Deadline::none();
                    let mut tx = OptimisticTransaction::new(store);
                    tx.begin(["counter"], &deadline).await?;
                    let current = tx.read("counter", &deadline).await?.unwrap_or_default();
                    let current: i64 = std::str::from_utf8(&current).unwrap().parse().unwrap();

                    // Both have read the same value before either commits
                    barrier.wait().await;

                    tx.queue_write(Command::set("counter", (current + 1).to_string()))?;
                    tx.commit(&deadline).await
                })
            })
            .collect();

        let mut committed = 0;
        let mut aborted = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                TransactionOutcome::Committed(_) => committed += 1,
                TransactionOutcome::Aborted(_) => aborted += 1,
                TransactionOutcome::Failed(err) => panic!("unexpected failure: {}", err),
            }
        }

        assert_eq!((committed, aborted), (1, 1));
        assert_eq!(get(&store, "counter"), Reply::bulk("1"));
    }

    #[test]
    fn test_outcome_into_result() {
        let aborted = TransactionOutcome::Aborted(ConflictError::new([Bytes::from("k")]));
        assert!(aborted.clone().into_result().unwrap_err().is_conflict());
        assert_eq!(aborted.state(), TxState::Aborted);

        let committed = TransactionOutcome::Committed(vec![Reply::ok()]);
        assert_eq!(committed.into_result(), Ok(vec![Reply::ok()]));
    }
}
