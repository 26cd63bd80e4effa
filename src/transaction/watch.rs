//! Per-attempt bookkeeping: the watched keys with the fingerprints captured
//! for them, and the writes queued for commit.

use crate::channel::{Guard, VersionToken};
use crate::commands::Command;
use bytes::Bytes;
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

/// Keys watched by one attempt, each with the token seen when it was first
/// watched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    tokens: BTreeMap<Bytes, VersionToken>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches `key`. A key already watched keeps its original token and
    /// this returns false.
    pub fn insert(&mut self, key: Bytes, token: VersionToken) -> bool {
        match self.tokens.entry(key) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.tokens.contains_key(key)
    }

    pub fn token(&self, key: &[u8]) -> Option<&VersionToken> {
        self.tokens.get(key)
    }

    /// Watched keys in byte order.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.tokens.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &VersionToken)> {
        self.tokens.iter()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Keys whose current token differs from the captured one.
    ///
    /// Keys that are not watched are ignored.
    pub fn changed_keys(
        &self,
        current: impl IntoIterator<Item = (Bytes, VersionToken)>,
    ) -> BTreeSet<Bytes> {
        current
            .into_iter()
            .filter(|(key, token)| self.token(key).is_some_and(|captured| captured != token))
            .map(|(key, _)| key)
            .collect()
    }

    /// One guard per watched key, for an atomic exchange.
    pub fn guards(&self) -> Vec<Guard> {
        self.tokens
            .iter()
            .map(|(key, token)| Guard::new(key.clone(), token.clone()))
            .collect()
    }
}

/// Writes queued by one attempt, in the order they will be applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionPlan {
    writes: Vec<Command>,
}

impl TransactionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.writes.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.writes
    }

    /// Distinct keys the plan writes to.
    pub fn targets(&self) -> BTreeSet<&Bytes> {
        self.writes.iter().map(Command::key).collect()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
