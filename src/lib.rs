//! # FlashKV Client - Pipelining and Optimistic Transactions
//!
//! The client-side execution layer for a FlashKV / Redis-style key-value
//! store. It does two things on top of a request/response channel:
//!
//! - **Pipelining**: a [`Batcher`] queues commands locally and sends them in
//!   one round trip, returning one result per command in submission order.
//! - **Optimistic transactions**: an [`OptimisticTransaction`] watches keys,
//!   reads through the store, queues writes and commits them atomically only
//!   if none of the watched keys changed in the meantime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           flashkv-client                                │
//! │                                                                         │
//! │  ┌─────────────┐        ┌───────────────────────┐    ┌──────────────┐   │
//! │  │   Batcher   │        │ OptimisticTransaction │◄───│ RetryPolicy  │   │
//! │  │  (pipeline) │        │ WatchSet + Plan       │    │ RetryState   │   │
//! │  └──────┬──────┘        └───────────┬───────────┘    └──────────────┘   │
//! │         │ Pipelined                 │ fingerprint / Atomic{guards}      │
//! │         ▼                           ▼                                   │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │          CommandChannel (capability)         │                       │
//! │  └──────────────────────┬───────────────────────┘                       │
//! │                         │ MemoryStore                                   │
//! │                         ▼                                               │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Command    │───>│              StorageEngine                   │   │
//! │  │  Handler    │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  └─────────────┘    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! │                                               ▲                         │
//! │                     ┌─────────────────────────┴───────────────────────┐ │
//! │                     │           ExpirySweeper                         │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use flashkv_client::channel::{Deadline, MemoryStore};
//! use flashkv_client::{Batcher, Command, OptimisticTransaction, Reply};
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//! let deadline = Deadline::none();
//!
//! // Three commands, one round trip
//! let mut batch = Batcher::new(&store);
//! batch.enqueue(Command::set("balance", "100"));
//! batch.enqueue(Command::set("name", "Ariz"));
//! let name = batch.enqueue(Command::get("name"));
//! let results = batch.flush(&deadline).await;
//! assert_eq!(results.get(name), Some(&Ok(Reply::bulk("Ariz"))));
//!
//! // Watch, read, write, commit
//! let mut tx = OptimisticTransaction::new(&store);
//! tx.begin(["balance"], &deadline).await.unwrap();
//! tx.queue_write(Command::incr_by("balance", 50)).unwrap();
//! let outcome = tx.commit(&deadline).await.unwrap();
//! assert!(outcome.is_committed());
//! # });
//! ```
//!
//! ## Module Overview
//!
//! - [`channel`]: the `CommandChannel` capability, deadlines, `MemoryStore`
//! - [`pipeline`]: the `Batcher`
//! - [`transaction`]: `OptimisticTransaction`, watch sets, retry loop
//! - [`commands`]: `Command` values and their execution
//! - [`storage`]: the sharded keyspace behind `MemoryStore`
//! - [`reply`] and [`error`]: results and failures
//!
//! ## Design Highlights
//!
//! ### Fingerprints
//!
//! A key's fingerprint is an opaque [`VersionToken`]. The core only compares
//! tokens. `MemoryStore` derives them from a revision counter bumped on every
//! write, deletion and expiry.
//!
//! ### Guarded Commits
//!
//! Commit compares fingerprints client-side, then sends the writes as one
//! atomic exchange carrying the same fingerprints as guards. The channel
//! re-checks them inside its atomic section, so a write that slips in between
//! still aborts the transaction.

pub mod channel;
pub mod commands;
pub mod error;
pub mod pipeline;
pub mod reply;
pub mod storage;
pub mod transaction;

// Re-export commonly used types for convenience
pub use channel::{
    CancelHandle, CommandChannel, Deadline, Exchange, ExchangeMode, Guard, MemoryStore,
    SendError, StoreConfig, VersionToken,
};
pub use commands::{Command, Verb};
pub use error::{
    CommandError, CommandResult, ConflictError, Error, Result, TransportError, UsageError,
};
pub use pipeline::{BatchHandle, BatchResults, Batcher};
pub use reply::Reply;
pub use transaction::{
    run_with_retries, OptimisticTransaction, RetryPolicy, RetryState, TransactionOutcome, TxState,
};

/// Version of the FlashKV client
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
