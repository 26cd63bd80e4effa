//! Command Module
//!
//! Commands are the unit of work the batcher and the transaction move around.
//! This module defines them and executes them against the in-process store.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────┐
//! │    Command      │  verb + key + args (this module)
//! └────────┬────────┘
//!          │ carried by Batcher / OptimisticTransaction
//!          ▼
//! ┌─────────────────┐
//! │ CommandChannel  │  (channel module)
//! └────────┬────────┘
//!          │ MemoryStore only
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  dispatch + validate + execute
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Strings
//! - `GET`, `SET [EX|PX] [NX|XX]`, `INCR`, `INCRBY`, `DECR`, `DECRBY`, `APPEND`, `STRLEN`
//!
//! ### Keys
//! - `DEL`, `EXISTS`, `PEXPIRE`, `PERSIST`, `TTL`, `PTTL`, `TYPE`, `KEYS`
//!
//! ### Hashes
//! - `HSET`, `HGET`, `HGETALL`, `HDEL`, `HLEN`
//!
//! ### Lists
//! - `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `LRANGE`, `LLEN`
//!
//! ### Sets
//! - `SADD`, `SREM`, `SMEMBERS`, `SISMEMBER`, `SCARD`
//!
//! ### Sorted Sets
//! - `ZADD`, `ZRANGE [WITHSCORES]`, `ZREVRANGE [WITHSCORES]`, `ZSCORE`

pub mod command;
pub mod handler;

pub use command::{Command, Verb};
pub use handler::CommandHandler;
