//! Storage Engine Module
//!
//! The keyspace behind [`MemoryStore`](crate::channel::MemoryStore): a
//! sharded, typed key-value map with TTL support, per-key revisions and a
//! background expiry sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │          revision counter → KeyVersion per key             │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use flashkv_client::storage::{End, StorageEngine};
//! use bytes::Bytes;
//!
//! let engine = StorageEngine::new();
//! let key = Bytes::from("tasks");
//!
//! engine.push(&key, vec![Bytes::from("t1"), Bytes::from("t2")], End::Tail).unwrap();
//! assert_eq!(engine.llen(b"tasks"), Ok(2));
//! assert_eq!(engine.key_type(b"tasks"), "list");
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{
    End, Entry, KeyVersion, SetCondition, SetOptions, Slot, Snapshot, SortedSet, StorageEngine,
    StorageStats, StoreError, Value,
};
pub use expiry::{ExpiryConfig, ExpirySweeper};
