//! In-Process Store Endpoint
//!
//! [`MemoryStore`] implements [`CommandChannel`] on top of the sharded
//! [`StorageEngine`]. There is no socket and no codec: an exchange is handed
//! to the [`CommandHandler`] directly, after an optional simulated round-trip
//! latency that honours the caller's [`Deadline`].
//!
//! ## Isolation
//!
//! ```text
//!   pipelined command ──► gate.read()  ──► CommandHandler ──► StorageEngine
//!   fingerprint       ──► gate.read()  ──► StorageEngine::version
//!   atomic exchange   ──► gate.write() ──► check guards
//!                                          snapshot targets
//!                                          execute all ──(error)──► restore
//! ```
//!
//! Single commands already run under their shard lock. The gate only keeps
//! them (and fingerprint lookups) from observing an atomic exchange halfway.
//!
//! ## Tokens
//!
//! A [`VersionToken`] is nine bytes: a tag (`P` present, `A` absent) followed
//! by the big-endian revision from [`KeyVersion`].

use crate::channel::{CommandChannel, Deadline, Exchange, ExchangeMode, Guard, SendError, VersionToken};
use crate::commands::{Command, CommandHandler};
use crate::error::{CommandResult, ConflictError, TransportError};
use crate::storage::{ExpiryConfig, ExpirySweeper, KeyVersion, StorageEngine};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Simulated round-trip time added to every exchange and lookup
    pub latency: Duration,

    /// Settings for the sweeper started by [`MemoryStore::start_sweeper`]
    pub expiry: ExpiryConfig,
}

impl StoreConfig {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Counters for traffic through a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Exchanges that reached the store
    pub exchanges: AtomicU64,
    /// Commands carried by those exchanges
    pub commands: AtomicU64,
    /// Fingerprint round trips
    pub fingerprints: AtomicU64,
    /// Atomic exchanges refused because a guard moved
    pub conflicts: AtomicU64,
    /// Atomic exchanges rolled back because a command failed
    pub rejections: AtomicU64,
}

impl ChannelStats {
    fn record_exchange(&self, commands: usize) {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        self.commands.fetch_add(commands as u64, Ordering::Relaxed);
    }
}

/// An in-process store that batches and transactions can talk to.
///
/// # Example
///
/// ```
/// use flashkv_client::channel::{CommandChannel, Deadline, Exchange, MemoryStore};
/// use flashkv_client::{Command, Reply};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let results = store
///     .send(
///         Exchange::pipelined(vec![Command::set("k", "v"), Command::get("k")]),
///         &Deadline::none(),
///     )
///     .await
///     .unwrap();
///
/// assert_eq!(results[1], Ok(Reply::bulk("v")));
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    handler: CommandHandler,
    gate: RwLock<()>,
    config: StoreConfig,
    stats: ChannelStats,
    fault: Mutex<Option<TransportError>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_engine(Arc::new(StorageEngine::new()), config)
    }

    /// Serves an existing engine.
    pub fn with_engine(engine: Arc<StorageEngine>, config: StoreConfig) -> Self {
        Self {
            handler: CommandHandler::new(engine),
            gate: RwLock::new(()),
            config,
            stats: ChannelStats::default(),
            fault: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        self.handler.storage()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Starts active expiry on the current Tokio runtime.
    pub fn start_sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::start(Arc::clone(self.engine()), self.config.expiry.clone())
    }

    /// Executes one command immediately, as another client would.
    ///
    /// Bypasses latency, deadlines and statistics.
    pub fn execute(&self, command: &Command) -> CommandResult {
        let _gate = self.gate.read();
        self.handler.execute(command)
    }

    /// Makes the next exchange or fingerprint lookup fail with `error`.
    pub fn inject_fault(&self, error: TransportError) {
        *self.fault.lock() = Some(error);
    }

    fn take_fault(&self) -> Result<(), TransportError> {
        match self.fault.lock().take() {
            Some(error) => {
                warn!(error = %error, "Injected transport fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Waits out the simulated round trip.
    async fn round_trip(&self, deadline: &Deadline) -> Result<(), TransportError> {
        self.take_fault()?;
        if self.config.latency.is_zero() {
            deadline.check()
        } else {
            deadline.run(tokio::time::sleep(self.config.latency)).await
        }
    }

    fn token(&self, key: &Bytes) -> VersionToken {
        let (tag, revision) = match self.engine().version(key) {
            KeyVersion::Present(revision) => (b'P', revision),
            KeyVersion::Absent(revision) => (b'A', revision),
        };
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(tag);
        buf.put_u64(revision);
        VersionToken::new(buf.freeze())
    }

    fn lookup(&self, keys: &[Bytes]) -> Vec<VersionToken> {
        let _gate = self.gate.read();
        self.stats.fingerprints.fetch_add(1, Ordering::Relaxed);
        keys.iter().map(|key| self.token(key)).collect()
    }

    fn apply_pipelined(&self, commands: &[Command]) -> Vec<CommandResult> {
        commands
            .iter()
            .map(|command| {
                let _gate = self.gate.read();
                self.handler.execute(command)
            })
            .collect()
    }

    fn apply_atomic(
        &self,
        commands: &[Command],
        guards: &[Guard],
    ) -> Result<Vec<CommandResult>, SendError> {
        let _gate = self.gate.write();

        let moved: Vec<Bytes> = guards
            .iter()
            .filter(|guard| self.token(&guard.key) != guard.token)
            .map(|guard| guard.key.clone())
            .collect();
        if !moved.is_empty() {
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(keys = moved.len(), "Atomic exchange refused: guards moved");
            return Err(ConflictError::new(moved).into());
        }

        let snapshot = self.engine().snapshot(commands.iter().map(Command::key));
        let mut results = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            match self.handler.execute(command) {
                Ok(reply) => results.push(Ok(reply)),
                Err(err) => {
                    self.engine().restore(snapshot);
                    self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(index, command = %command, "Atomic exchange rolled back");
                    return Err(SendError::Rejected {
                        index,
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(results)
    }
}

impl CommandChannel for MemoryStore {
    async fn send(
        &self,
        exchange: Exchange,
        deadline: &Deadline,
    ) -> Result<Vec<CommandResult>, SendError> {
        self.round_trip(deadline).await?;

        self.stats.record_exchange(exchange.len());
        let (commands, mode) = exchange.into_parts();
        match mode {
            ExchangeMode::Pipelined => Ok(self.apply_pipelined(&commands)),
            ExchangeMode::Atomic { guards } => self.apply_atomic(&commands, &guards),
        }
    }

    async fn fingerprint(
        &self,
        key: &Bytes,
        deadline: &Deadline,
    ) -> Result<VersionToken, TransportError> {
        self.round_trip(deadline).await?;
        let mut tokens = self.lookup(std::slice::from_ref(key));
        tokens.pop().ok_or_else(|| TransportError::Protocol("empty fingerprint reply".into()))
    }

    /// All keys in one round trip.
    async fn fingerprints(
        &self,
        keys: &[Bytes],
        deadline: &Deadline,
    ) -> Result<Vec<VersionToken>, TransportError> {
        self.round_trip(deadline).await?;
        Ok(self.lookup(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::Reply;
    use crate::CommandError;

    fn key(s: &'static str) -> Bytes {
        Bytes::from(s)
    }

    async fn token(store: &MemoryStore, k: &'static str) -> VersionToken {
        store.fingerprint(&key(k), &Deadline::none()).await.unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_exchange_keeps_order() {
        let store = MemoryStore::new();
        let exchange = Exchange::pipelined(vec![
            Command::set("k", "v"),
            Command::incr("k"),
            Command::get("k"),
        ]);

        let results = store.send(exchange, &Deadline::none()).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(Reply::ok()));
        assert!(matches!(results[1], Err(CommandError::Server(_))));
        assert_eq!(results[2], Ok(Reply::bulk("v")));
        assert_eq!(store.stats().exchanges.load(Ordering::Relaxed), 1);
        assert_eq!(store.stats().commands.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_writes() {
        let store = MemoryStore::new();

        let absent = token(&store, "k").await;
        assert_eq!(token(&store, "k").await, absent);

        store.execute(&Command::set("k", "1")).unwrap();
        let present = token(&store, "k").await;
        assert_ne!(present, absent);

        store.execute(&Command::get("k")).unwrap();
        assert_eq!(token(&store, "k").await, present);

        // Same value written again still counts
        store.execute(&Command::set("k", "1")).unwrap();
        assert_ne!(token(&store, "k").await, present);
    }

    #[tokio::test]
    async fn test_fingerprint_sees_delete_and_recreate() {
        let store = MemoryStore::new();
        store.execute(&Command::set("k", "1")).unwrap();
        let before = token(&store, "k").await;

        store.execute(&Command::del("k")).unwrap();
        store.execute(&Command::set("k", "1")).unwrap();

        assert_ne!(token(&store, "k").await, before);
    }

    #[tokio::test]
    async fn test_fingerprint_sees_expiry() {
        let store = MemoryStore::new();
        store
            .execute(&Command::set_with_ttl("k", "v", Duration::from_millis(20)))
            .unwrap();
        let before = token(&store, "k").await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_ne!(token(&store, "k").await, before);
    }

    #[tokio::test]
    async fn test_atomic_exchange_applies_when_guards_hold() {
        let store = MemoryStore::new();
        let guard = Guard::new(key("k"), token(&store, "k").await);

        let exchange = Exchange::atomic(
            vec![Command::set("k", "1"), Command::incr("k")],
            vec![guard],
        );
        let results = store.send(exchange, &Deadline::none()).await.unwrap();

        assert_eq!(results, vec![Ok(Reply::ok()), Ok(Reply::integer(2))]);
    }

    #[tokio::test]
    async fn test_atomic_exchange_refused_when_guard_moved() {
        let store = MemoryStore::new();
        let guard = Guard::new(key("k"), token(&store, "k").await);
        store.execute(&Command::set("k", "theirs")).unwrap();

        let exchange = Exchange::atomic(vec![Command::set("k", "mine")], vec![guard]);
        let err = store.send(exchange, &Deadline::none()).await.unwrap_err();

        assert_eq!(err, SendError::Conflict(ConflictError::new([key("k")])));
        assert_eq!(store.execute(&Command::get("k")), Ok(Reply::bulk("theirs")));
        assert_eq!(store.stats().conflicts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_atomic_exchange_rolls_back_on_rejection() {
        let store = MemoryStore::new();
        store.execute(&Command::set("balance", "100")).unwrap();
        store.execute(&Command::lpush("log", ["opened"])).unwrap();
        let balance_token = token(&store, "balance").await;

        let exchange = Exchange::atomic(
            vec![
                Command::incr_by("balance", 50),
                Command::set("fresh", "x"),
                Command::incr("log"),
            ],
            vec![],
        );
        let err = store.send(exchange, &Deadline::none()).await.unwrap_err();

        assert!(matches!(err, SendError::Rejected { index: 2, .. }));
        assert_eq!(store.execute(&Command::get("balance")), Ok(Reply::bulk("100")));
        assert_eq!(store.execute(&Command::exists("fresh")), Ok(Reply::integer(0)));
        assert_eq!(token(&store, "balance").await, balance_token);
        assert_eq!(store.stats().rejections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_hits_next_exchange_only() {
        let store = MemoryStore::new();
        store.inject_fault(TransportError::ConnectionLost("reset".into()));

        let exchange = Exchange::pipelined(vec![Command::set("k", "v")]);
        let err = store.send(exchange.clone(), &Deadline::none()).await.unwrap_err();
        assert_eq!(
            err,
            SendError::Transport(TransportError::ConnectionLost("reset".into()))
        );
        assert_eq!(store.execute(&Command::exists("k")), Ok(Reply::integer(0)));

        assert!(store.send(exchange, &Deadline::none()).await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_elapses_before_apply() {
        let store = MemoryStore::with_config(
            StoreConfig::default().with_latency(Duration::from_millis(200)),
        );
        let deadline = Deadline::after(Duration::from_millis(20));

        let exchange = Exchange::pipelined(vec![Command::set("k", "v")]);
        let err = store.send(exchange, &deadline).await.unwrap_err();

        assert_eq!(err, SendError::Transport(TransportError::DeadlineElapsed));
        assert_eq!(store.execute(&Command::exists("k")), Ok(Reply::integer(0)));
        assert_eq!(store.stats().exchanges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_fingerprints_use_one_round_trip() {
        let store = MemoryStore::new();
        let keys = vec![key("a"), key("b"), key("c")];

        let tokens = store.fingerprints(&keys, &Deadline::none()).await.unwrap();

        assert_eq!(tokens.len(), 3);
        assert_eq!(store.stats().fingerprints.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shared_through_arc() {
        let store = Arc::new(MemoryStore::new());
        let shared = Arc::clone(&store);

        let task = tokio::spawn(async move {
            shared
                .send(
                    Exchange::pipelined(vec![Command::set("k", "from-task")]),
                    &Deadline::none(),
                )
                .await
        });
        task.await.unwrap().unwrap();

        assert_eq!(store.execute(&Command::get("k")), Ok(Reply::bulk("from-task")));
    }
}
