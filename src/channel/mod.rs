//! Channel Module
//!
//! The capability the batcher and the transaction issue commands through.
//! A [`CommandChannel`] knows how to carry an ordered [`Exchange`] to a single
//! logical store endpoint and bring the answers back, and how to fingerprint
//! a key. How it connects and how it encodes commands is its own business.
//!
//! ## Exchanges
//!
//! ```text
//!   Batcher::flush ──────────► Exchange { commands, Pipelined }
//!                                   │  one round trip, per-slot results
//!                                   ▼
//!                            ┌───────────────┐
//!                            │CommandChannel │──► fingerprint(key)
//!                            └───────────────┘         ▲
//!                                   ▲                  │ begin / read / commit
//!                                   │                  │
//!   OptimisticTransaction::commit ► Exchange { writes, Atomic { guards } }
//!                                      all-or-nothing, guarded by tokens
//! ```
//!
//! An atomic exchange carries the fingerprints captured when the keys were
//! watched. The channel re-checks them inside its atomic section and refuses
//! the whole exchange with [`SendError::Conflict`] if any moved.

pub mod deadline;
pub mod memory;

pub use deadline::{CancelHandle, Deadline};
pub use memory::{ChannelStats, MemoryStore, StoreConfig};

use crate::commands::Command;
use crate::error::{CommandResult, ConflictError, Error, TransportError};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Opaque fingerprint of a key's state.
///
/// Equal across observations with no intervening write; different after any
/// write, deletion, re-creation or expiry of the key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(Bytes);

impl VersionToken {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionToken(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// A key and the token it must still have for an atomic exchange to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub key: Bytes,
    pub token: VersionToken,
}

impl Guard {
    pub fn new(key: Bytes, token: VersionToken) -> Self {
        Self { key, token }
    }
}

/// How the channel must apply an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Each command on its own, each with its own result
    Pipelined,
    /// All commands or none, provided every guard still holds
    Atomic { guards: Vec<Guard> },
}

/// An ordered group of commands sent in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    commands: Vec<Command>,
    mode: ExchangeMode,
}

impl Exchange {
    pub fn pipelined(commands: Vec<Command>) -> Self {
        Self {
            commands,
            mode: ExchangeMode::Pipelined,
        }
    }

    pub fn atomic(commands: Vec<Command>, guards: Vec<Guard>) -> Self {
        Self {
            commands,
            mode: ExchangeMode::Atomic { guards },
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn mode(&self) -> &ExchangeMode {
        &self.mode
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self.mode, ExchangeMode::Atomic { .. })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Command>, ExchangeMode) {
        (self.commands, self.mode)
    }
}

/// Why a channel could not produce per-command results for an exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A guard of an atomic exchange no longer held; nothing was applied
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// A command of an atomic exchange failed; nothing was applied
    #[error("command {index} rejected: {message}")]
    Rejected { index: usize, message: String },
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Transport(e) => Error::Transport(e),
            SendError::Conflict(e) => Error::Conflict(e),
            SendError::Rejected { index, message } => Error::Rejected { index, message },
        }
    }
}

/// Request/response access to one logical store endpoint.
///
/// Implementations must be safe to share: many batchers and transactions may
/// issue exchanges through the same channel concurrently.
pub trait CommandChannel: Send + Sync {
    /// Carries one exchange to the store.
    ///
    /// On success there is one result per command, in order.
    fn send(
        &self,
        exchange: Exchange,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<CommandResult>, SendError>> + Send;

    /// Returns the current fingerprint of `key`.
    fn fingerprint(
        &self,
        key: &Bytes,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<VersionToken, TransportError>> + Send;

    /// Fingerprints several keys, in order.
    ///
    /// The provided implementation asks for each key in turn.
    fn fingerprints(
        &self,
        keys: &[Bytes],
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<VersionToken>, TransportError>> + Send {
        async move {
            let mut tokens = Vec::with_capacity(keys.len());
            for key in keys {
                tokens.push(self.fingerprint(key, deadline).await?);
            }
            Ok(tokens)
        }
    }
}

impl<C: CommandChannel> CommandChannel for &C {
    fn send(
        &self,
        exchange: Exchange,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<CommandResult>, SendError>> + Send {
        (**self).send(exchange, deadline)
    }

    fn fingerprint(
        &self,
        key: &Bytes,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<VersionToken, TransportError>> + Send {
        (**self).fingerprint(key, deadline)
    }

    fn fingerprints(
        &self,
        keys: &[Bytes],
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<VersionToken>, TransportError>> + Send {
        (**self).fingerprints(keys, deadline)
    }
}

impl<C: CommandChannel> CommandChannel for Arc<C> {
    fn send(
        &self,
        exchange: Exchange,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<CommandResult>, SendError>> + Send {
        (**self).send(exchange, deadline)
    }

    fn fingerprint(
        &self,
        key: &Bytes,
        deadline: &Deadline,
    ) -> impl Future<Output = Result<VersionToken, TransportError>> + Send {
        (**self).fingerprint(key, deadline)
    }

    fn fingerprints(
        &self,
        keys: &[Bytes],
        deadline: &Deadline,
    ) -> impl Future<Output = Result<Vec<VersionToken>, TransportError>> + Send {
        (**self).fingerprints(keys, deadline)
    }
}
