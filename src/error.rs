//! Error taxonomy for batches and transactions.
//!
//! Four kinds of failure flow through the crate:
//!
//! - [`TransportError`]: the exchange with the store did not complete
//!   (connection lost, deadline elapsed, cancelled, malformed answer). It
//!   applies uniformly to every slot of the exchange that hit it.
//! - [`CommandError`]: the outcome of a single slot. Either the store rejected
//!   that one command, or the whole exchange failed in transport.
//! - [`UsageError`]: the caller broke a precondition (empty watch set, commit
//!   before begin, ...). Fatal to the call, harmless to the store.
//! - [`ConflictError`]: watched keys changed. Transactions report this as an
//!   outcome rather than raising it; it only becomes an [`Error`] when a
//!   caller converts an aborted outcome or runs out of retries.

use crate::commands::Verb;
use crate::reply::Reply;
use crate::storage::StoreError;
use crate::transaction::TxState;
use bytes::Bytes;
use std::collections::BTreeSet;
use thiserror::Error;

/// The exchange with the store failed as a whole.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the store was lost or refused
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The caller-supplied deadline passed before the exchange finished
    #[error("deadline elapsed")]
    DeadlineElapsed,

    /// The caller cancelled the exchange
    #[error("operation cancelled")]
    Cancelled,

    /// The store answered with something the exchange did not ask for
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure of one command slot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The store executed the command and rejected it
    #[error("{0}")]
    Server(String),

    /// The exchange carrying the command failed in transport
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        CommandError::Server(err.to_string())
    }
}

/// Outcome of a single command: its reply, or why it has none.
pub type CommandResult = std::result::Result<Reply, CommandError>;

/// The caller violated a precondition of the operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// `begin` was called without any key to watch
    #[error("watch set must contain at least one key")]
    EmptyWatchSet,

    /// The operation is not valid in the transaction's current state
    #[error("cannot {operation} while the transaction is {state}")]
    InvalidState {
        operation: &'static str,
        state: TxState,
    },

    /// A write command was handed to a read operation
    #[error("'{0}' modifies the store and cannot be used as a read")]
    NotARead(Verb),

    /// A read command was queued as a transaction write
    #[error("'{0}' does not modify the store and cannot be queued as a write")]
    NotAWrite(Verb),

    /// A command without a single target key was handed to a read operation
    #[error("'{0}' has no single target key and cannot be watched")]
    NotKeyed(Verb),
}

/// Watched keys whose fingerprint changed between watch and commit.
#[derive(Debug, Error, Clone, PartialEq, Eq, Default)]
#[error("watched keys changed: {}", join_keys(.keys))]
pub struct ConflictError {
    keys: BTreeSet<Bytes>,
}

impl ConflictError {
    pub fn new(keys: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// The conflicting keys, in byte order.
    pub fn keys(&self) -> &BTreeSet<Bytes> {
        &self.keys
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_ref() == key)
    }

    pub fn into_keys(self) -> BTreeSet<Bytes> {
        self.keys
    }
}

fn join_keys(keys: &BTreeSet<Bytes>) -> String {
    keys.iter()
        .map(|key| String::from_utf8_lossy(key))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Crate-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("command failed: {0}")]
    Command(CommandError),

    #[error("transaction aborted: {0}")]
    Conflict(#[from] ConflictError),

    /// The store refused one command of an atomic batch; nothing was applied
    #[error("atomic batch rejected at command {index}: {message}")]
    Rejected { index: usize, message: String },

    /// Every permitted attempt was aborted by a conflict
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ConflictError },
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Transport(e) => Error::Transport(e),
            server => Error::Command(server),
        }
    }
}

impl Error {
    /// Returns true if retrying the same transaction could succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::RetriesExhausted { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
