//! Sharded Keyspace with Revisions
//!
//! The storage engine behind [`MemoryStore`](crate::channel::MemoryStore).
//! It keeps typed values (strings, lists, hashes, sets, sorted sets) in a
//! sharded map and stamps every modification with a revision drawn from one
//! engine-wide counter. Revisions are what key fingerprints are made of.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ entries │ │ entries │ │ entries │ │ entries │           │
//! │  │ removed │ │ removed │ │ removed │ │ removed │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │                  revision: AtomicU64                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Versions
//!
//! A present key's version is the revision of its last modification. A
//! missing key's version is the revision of the last removal in its shard, so
//! a key that is created and deleted again between two observations never
//! looks untouched. Unrelated removals in the same shard can change an absent
//! key's version too; that only ever produces a spurious conflict, never a
//! missed one.
//!
//! ## Expiry
//!
//! Expired entries are invisible to readers. Writers and version lookups
//! remove them on contact (recording a removal), and the background sweeper
//! removes the rest.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Errors raised by typed operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR increment or decrement would overflow")]
    Overflow,
}

/// A typed value held under one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
    SortedSet(SortedSet),
}

impl Value {
    /// The name `TYPE` reports for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }

    /// Collections that become empty are removed, like Redis does.
    fn is_empty_collection(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
        }
    }

    fn as_string(&self) -> Result<&Bytes, StoreError> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_list(&self) -> Result<&VecDeque<Bytes>, StoreError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_list_mut(&mut self) -> Result<&mut VecDeque<Bytes>, StoreError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_hash(&self) -> Result<&HashMap<Bytes, Bytes>, StoreError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_hash_mut(&mut self) -> Result<&mut HashMap<Bytes, Bytes>, StoreError> {
        match self {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_set(&self) -> Result<&HashSet<Bytes>, StoreError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_set_mut(&mut self) -> Result<&mut HashSet<Bytes>, StoreError> {
        match self {
            Value::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_sorted_set(&self) -> Result<&SortedSet, StoreError> {
        match self {
            Value::SortedSet(z) => Ok(z),
            _ => Err(StoreError::WrongType),
        }
    }

    fn as_sorted_set_mut(&mut self) -> Result<&mut SortedSet, StoreError> {
        match self {
            Value::SortedSet(z) => Ok(z),
            _ => Err(StoreError::WrongType),
        }
    }
}

/// Members ordered by score, ties broken by member bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
}

impl SortedSet {
    /// Inserts or rescores a member. Returns true if the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        self.scores.insert(member, score).is_none()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// All members, lowest score first.
    pub fn ordered(&self) -> Vec<(Bytes, f64)> {
        let mut members: Vec<(Bytes, f64)> = self
            .scores
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// A stored value with its expiry and last-modified revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Revision of the last modification
    pub revision: u64,
}

impl Entry {
    fn new(value: Value, expires_at: Option<Instant>) -> Self {
        Self {
            value,
            expires_at,
            revision: 0,
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }

    /// Remaining time to live in milliseconds, or None without expiry.
    pub fn remaining_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()).as_millis() as u64)
    }
}

/// The observable version of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVersion {
    /// The key exists; carries the revision of its last modification
    Present(u64),
    /// The key is missing; carries the revision of its shard's last removal
    Absent(u64),
}

/// Which end of a list to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Head,
    Tail,
}

/// Condition attached to a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// `NX`: only when the key is missing
    IfAbsent,
    /// `XX`: only when the key exists
    IfPresent,
}

/// Options for [`StorageEngine::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub condition: Option<SetCondition>,
}

/// Mutable view of one key handed to [`StorageEngine::modify`].
///
/// Every method that changes the entry marks the slot dirty, which gives the
/// entry a fresh revision when the modification is stored back.
#[derive(Debug)]
pub struct Slot {
    entry: Option<Entry>,
    dirty: bool,
}

impl Slot {
    pub fn value(&self) -> Option<&Value> {
        self.entry.as_ref().map(|e| &e.value)
    }

    pub fn exists(&self) -> bool {
        self.entry.is_some()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.entry.as_ref().and_then(|e| e.expires_at)
    }

    pub fn value_mut(&mut self) -> Option<&mut Value> {
        let entry = self.entry.as_mut()?;
        self.dirty = true;
        Some(&mut entry.value)
    }

    /// Replaces the value, dropping any expiry.
    pub fn replace(&mut self, value: Value) {
        self.replace_with_expiry(value, None);
    }

    /// Replaces the value, keeping the current expiry.
    pub fn replace_keep_ttl(&mut self, value: Value) {
        let expires_at = self.expires_at();
        self.replace_with_expiry(value, expires_at);
    }

    pub fn replace_with_expiry(&mut self, value: Value, expires_at: Option<Instant>) {
        self.entry = Some(Entry::new(value, expires_at));
        self.dirty = true;
    }

    /// Sets or clears the expiry. Returns false if the key is missing.
    pub fn set_expiry(&mut self, expires_at: Option<Instant>) -> bool {
        match self.entry.as_mut() {
            Some(entry) => {
                entry.expires_at = expires_at;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Removes the key. Returns true if it existed.
    pub fn clear(&mut self) -> bool {
        let existed = self.entry.take().is_some();
        self.dirty |= existed;
        existed
    }

    fn get_or_create(&mut self, create: impl FnOnce() -> Value) -> &mut Value {
        self.dirty = true;
        &mut self
            .entry
            .get_or_insert_with(|| Entry::new(create(), None))
            .value
    }
}

/// Entries captured before an atomic batch, used to undo it.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: Vec<(Bytes, Option<Entry>)>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: RwLock<HashMap<Bytes, Entry>>,
    /// Revision of the most recent removal from this shard
    removed: AtomicU64,
}

/// Engine statistics.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Live keys
    pub keys: usize,
    /// Read operations served
    pub reads: u64,
    /// Modifications applied
    pub writes: u64,
    /// Expired keys removed (lazily or by the sweeper)
    pub expired: u64,
    /// Latest revision handed out
    pub revision: u64,
}

/// The keyspace behind the in-process store.
///
/// # Example
///
/// ```
/// use flashkv_client::storage::{KeyVersion, SetOptions, StorageEngine};
/// use bytes::Bytes;
///
/// let engine = StorageEngine::new();
/// let key = Bytes::from("name");
///
/// let before = engine.version(&key);
/// engine.set(&key, Bytes::from("Ariz"), SetOptions::default());
/// assert_ne!(engine.version(&key), before);
/// assert_eq!(engine.get(&key).unwrap(), Some(Bytes::from("Ariz")));
/// ```
pub struct StorageEngine {
    shards: Vec<Shard>,
    revision: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    expired: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("revision", &self.revision.load(Ordering::Relaxed))
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            revision: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    #[inline]
    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_removal(&self, shard: &Shard) {
        shard.removed.store(self.next_revision(), Ordering::Relaxed);
    }

    /// Runs `f` against the live entry for `key`, if any.
    fn inspect<T>(&self, key: &[u8], f: impl FnOnce(Option<&Entry>) -> T) -> T {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.shard(key).entries.read();
        f(entries.get(key).filter(|e| !e.is_expired()))
    }

    fn read_value<T>(
        &self,
        key: &[u8],
        f: impl FnOnce(Option<&Value>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.inspect(key, |entry| f(entry.map(|e| &e.value)))
    }

    /// Applies a read-modify-write to one key under its shard's write lock.
    ///
    /// Expired entries are removed before `f` sees the slot. If `f` marks
    /// the slot dirty the entry gets a new revision; if the key ends up
    /// missing (or an emptied collection) the removal is recorded.
    pub fn modify<T>(&self, key: &Bytes, f: impl FnOnce(&mut Slot) -> T) -> T {
        let shard = self.shard(key);
        let mut entries = shard.entries.write();

        let mut entry = entries.remove(key);
        let existed = entry.is_some();
        if entry.as_ref().is_some_and(Entry::is_expired) {
            entry = None;
            self.expired.fetch_add(1, Ordering::Relaxed);
        }

        let mut slot = Slot {
            entry,
            dirty: false,
        };
        let output = f(&mut slot);

        if slot.dirty {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        match slot.entry {
            Some(mut entry) if !entry.value.is_empty_collection() => {
                if slot.dirty {
                    entry.revision = self.next_revision();
                }
                entries.insert(key.clone(), entry);
            }
            _ if existed => self.record_removal(shard),
            _ => {}
        }

        output
    }

    /// Returns the current version of `key`, removing it first if expired.
    pub fn version(&self, key: &Bytes) -> KeyVersion {
        let shard = self.shard(key);
        let mut entries = shard.entries.write();

        if entries.get(key).is_some_and(Entry::is_expired) {
            entries.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.record_removal(shard);
        }

        match entries.get(key) {
            Some(entry) => KeyVersion::Present(entry.revision),
            None => KeyVersion::Absent(shard.removed.load(Ordering::Relaxed)),
        }
    }

    /// Captures the raw entries for `keys` so they can be put back later.
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a Bytes>) -> Snapshot {
        let keys: BTreeSet<&Bytes> = keys.into_iter().collect();
        let entries = keys
            .into_iter()
            .map(|key| {
                let entry = self.shard(key).entries.read().get(key).cloned();
                (key.clone(), entry)
            })
            .collect();
        Snapshot { entries }
    }

    /// Puts back the entries captured by [`snapshot`](Self::snapshot),
    /// revisions included.
    pub fn restore(&self, snapshot: Snapshot) {
        for (key, entry) in snapshot.entries {
            let shard = self.shard(&key);
            let mut entries = shard.entries.write();
            match entry {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    if entries.remove(&key).is_some() {
                        self.record_removal(shard);
                    }
                }
            }
        }
    }

    // ========================================================================
    // STRINGS
    // ========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.read_value(key, |value| value.map(|v| v.as_string().cloned()).transpose())
    }

    /// Stores a string, replacing whatever the key held.
    ///
    /// Returns false when the `NX`/`XX` condition prevented the write.
    pub fn set(&self, key: &Bytes, value: Bytes, options: SetOptions) -> bool {
        self.modify(key, |slot| {
            let allowed = match options.condition {
                None => true,
                Some(SetCondition::IfAbsent) => !slot.exists(),
                Some(SetCondition::IfPresent) => slot.exists(),
            };
            if allowed {
                let expires_at = options.ttl.map(|ttl| Instant::now() + ttl);
                slot.replace_with_expiry(Value::String(value), expires_at);
            }
            allowed
        })
    }

    /// Adds `delta` to an integer string, treating a missing key as 0.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StoreError> {
        self.modify(key, |slot| {
            let current = match slot.value() {
                Some(value) => parse_integer(value.as_string()?)?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
            slot.replace_keep_ttl(Value::String(Bytes::from(next.to_string())));
            Ok(next)
        })
    }

    /// Appends to a string, creating it if missing. Returns the new length.
    pub fn append(&self, key: &Bytes, suffix: &[u8]) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            let mut joined = match slot.value() {
                Some(value) => value.as_string()?.to_vec(),
                None => Vec::with_capacity(suffix.len()),
            };
            joined.extend_from_slice(suffix);
            let len = joined.len();
            slot.replace_keep_ttl(Value::String(Bytes::from(joined)));
            Ok(len)
        })
    }

    pub fn strlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.read_value(key, |value| {
            value.map_or(Ok(0), |v| v.as_string().map(|s| s.len()))
        })
    }

    // ========================================================================
    // KEYS
    // ========================================================================

    /// Removes a key of any type. Returns true if it existed.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.modify(key, Slot::clear)
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.inspect(key, |entry| entry.is_some())
    }

    /// Sets a time-to-live. Returns false if the key is missing.
    pub fn expire(&self, key: &Bytes, ttl: Duration) -> bool {
        self.modify(key, |slot| slot.set_expiry(Some(Instant::now() + ttl)))
    }

    /// Drops the expiry. Returns false if the key is missing or had none.
    pub fn persist(&self, key: &Bytes) -> bool {
        self.modify(key, |slot| slot.expires_at().is_some() && slot.set_expiry(None))
    }

    /// Remaining TTL in milliseconds: -2 if missing, -1 if no expiry.
    pub fn pttl(&self, key: &[u8]) -> i64 {
        self.inspect(key, |entry| match entry {
            None => -2,
            Some(entry) => entry.remaining_ms().map_or(-1, |ms| ms as i64),
        })
    }

    /// The type name of the key's value, or `none`.
    pub fn key_type(&self, key: &[u8]) -> &'static str {
        self.inspect(key, |entry| entry.map_or("none", |e| e.value.type_name()))
    }

    /// Returns all live keys matching a glob pattern, sorted.
    ///
    /// Supported patterns:
    /// - `*` matches any run of bytes, `?` exactly one
    /// - `[ae]`, `[a-z]`, `[^x]` match character classes
    /// - `\` escapes the next byte
    ///
    /// Scans every shard.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let mut matched: Vec<Bytes> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .entries
                    .read()
                    .iter()
                    .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        matched.sort();
        matched
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .entries
                    .read()
                    .values()
                    .filter(|e| !e.is_expired())
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    pub fn flush(&self) {
        for shard in &self.shards {
            let mut entries = shard.entries.write();
            if !entries.is_empty() {
                entries.clear();
                self.record_removal(shard);
            }
        }
    }

    /// Removes expired entries from every shard. Returns how many went.
    pub fn cleanup_expired(&self) -> u64 {
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let mut entries = shard.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired());

            let removed = (before - entries.len()) as u64;
            if removed > 0 {
                self.record_removal(shard);
                cleaned += removed;
            }
        }

        self.expired.fetch_add(cleaned, Ordering::Relaxed);
        cleaned
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            revision: self.revision.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // HASHES
    // ========================================================================

    /// Sets hash fields. Returns how many fields were newly created.
    pub fn hset(&self, key: &Bytes, fields: Vec<(Bytes, Bytes)>) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            if let Some(value) = slot.value() {
                value.as_hash()?;
            }
            let hash = slot
                .get_or_create(|| Value::Hash(HashMap::new()))
                .as_hash_mut()?;
            Ok(fields
                .into_iter()
                .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                .count())
        })
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>, StoreError> {
        self.read_value(key, |value| match value {
            Some(v) => Ok(v.as_hash()?.get(field).cloned()),
            None => Ok(None),
        })
    }

    /// All field/value pairs, ordered by field.
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        self.read_value(key, |value| {
            let Some(value) = value else {
                return Ok(Vec::new());
            };
            let mut pairs: Vec<(Bytes, Bytes)> = value
                .as_hash()?
                .iter()
                .map(|(f, v)| (f.clone(), v.clone()))
                .collect();
            pairs.sort();
            Ok(pairs)
        })
    }

    /// Removes hash fields. Returns how many existed.
    pub fn hdel(&self, key: &Bytes, fields: &[Bytes]) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            let Some(value) = slot.value() else {
                return Ok(0);
            };
            let hash = value.as_hash()?;
            if !fields.iter().any(|f| hash.contains_key(f)) {
                return Ok(0);
            }
            let Some(value) = slot.value_mut() else {
                return Ok(0);
            };
            let hash = value.as_hash_mut()?;
            Ok(fields.iter().filter(|f| hash.remove(*f).is_some()).count())
        })
    }

    pub fn hlen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.read_value(key, |value| value.map_or(Ok(0), |v| v.as_hash().map(HashMap::len)))
    }

    // ========================================================================
    // LISTS
    // ========================================================================

    /// Pushes values one at a time onto one end. Returns the new length.
    pub fn push(&self, key: &Bytes, values: Vec<Bytes>, end: End) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            if let Some(value) = slot.value() {
                value.as_list()?;
            }
            let list = slot
                .get_or_create(|| Value::List(VecDeque::new()))
                .as_list_mut()?;
            for value in values {
                match end {
                    End::Head => list.push_front(value),
                    End::Tail => list.push_back(value),
                }
            }
            Ok(list.len())
        })
    }

    pub fn pop(&self, key: &Bytes, end: End) -> Result<Option<Bytes>, StoreError> {
        self.modify(key, |slot| {
            let Some(value) = slot.value() else {
                return Ok(None);
            };
            value.as_list()?;
            let Some(value) = slot.value_mut() else {
                return Ok(None);
            };
            let list = value.as_list_mut()?;
            Ok(match end {
                End::Head => list.pop_front(),
                End::Tail => list.pop_back(),
            })
        })
    }

    /// Elements from `start` to `stop` inclusive; negative indices count
    /// from the tail.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, StoreError> {
        self.read_value(key, |value| {
            let Some(value) = value else {
                return Ok(Vec::new());
            };
            let list = value.as_list()?;
            Ok(match normalize_range(list.len(), start, stop) {
                Some(range) => list.range(range).cloned().collect(),
                None => Vec::new(),
            })
        })
    }

    pub fn llen(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.read_value(key, |value| value.map_or(Ok(0), |v| v.as_list().map(VecDeque::len)))
    }

    // ========================================================================
    // SETS
    // ========================================================================

    /// Adds members. Returns how many were new.
    pub fn sadd(&self, key: &Bytes, members: Vec<Bytes>) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            if let Some(value) = slot.value() {
                let set = value.as_set()?;
                if members.iter().all(|m| set.contains(m)) {
                    return Ok(0);
                }
            }
            let set = slot
                .get_or_create(|| Value::Set(HashSet::new()))
                .as_set_mut()?;
            Ok(members.into_iter().filter(|m| set.insert(m.clone())).count())
        })
    }

    /// Removes members. Returns how many existed.
    pub fn srem(&self, key: &Bytes, members: &[Bytes]) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            let Some(value) = slot.value() else {
                return Ok(0);
            };
            let set = value.as_set()?;
            if !members.iter().any(|m| set.contains(m)) {
                return Ok(0);
            }
            let Some(value) = slot.value_mut() else {
                return Ok(0);
            };
            let set = value.as_set_mut()?;
            Ok(members.iter().filter(|m| set.remove(*m)).count())
        })
    }

    /// All members, sorted.
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        self.read_value(key, |value| {
            let Some(value) = value else {
                return Ok(Vec::new());
            };
            let mut members: Vec<Bytes> = value.as_set()?.iter().cloned().collect();
            members.sort();
            Ok(members)
        })
    }

    pub fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool, StoreError> {
        self.read_value(key, |value| {
            value.map_or(Ok(false), |v| v.as_set().map(|s| s.contains(member)))
        })
    }

    pub fn scard(&self, key: &[u8]) -> Result<usize, StoreError> {
        self.read_value(key, |value| value.map_or(Ok(0), |v| v.as_set().map(HashSet::len)))
    }

    // ========================================================================
    // SORTED SETS
    // ========================================================================

    /// Adds or rescores members. Returns how many were new.
    pub fn zadd(&self, key: &Bytes, members: Vec<(f64, Bytes)>) -> Result<usize, StoreError> {
        self.modify(key, |slot| {
            if let Some(value) = slot.value() {
                value.as_sorted_set()?;
            }
            let zset = slot
                .get_or_create(|| Value::SortedSet(SortedSet::default()))
                .as_sorted_set_mut()?;
            Ok(members
                .into_iter()
                .filter(|(score, member)| zset.insert(member.clone(), *score))
                .count())
        })
    }

    /// Members by rank, ascending or (with `reverse`) descending.
    pub fn zrange(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<(Bytes, f64)>, StoreError> {
        self.read_value(key, |value| {
            let Some(value) = value else {
                return Ok(Vec::new());
            };
            let mut ordered = value.as_sorted_set()?.ordered();
            if reverse {
                ordered.reverse();
            }
            Ok(match normalize_range(ordered.len(), start, stop) {
                Some(range) => ordered.drain(range).collect(),
                None => Vec::new(),
            })
        })
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>, StoreError> {
        self.read_value(key, |value| match value {
            Some(v) => Ok(v.as_sorted_set()?.score(member)),
            None => Ok(None),
        })
    }
}

fn parse_integer(raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(StoreError::NotAnInteger)
}

/// Resolves an inclusive, possibly negative index pair against `len`.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<Range<usize>> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len {
        return None;
    }
    Some(start as usize..stop as usize + 1)
}

/// Glob matching over raw key bytes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((b'[', rest)) => {
            let Some((&c, text_rest)) = text.split_first() else {
                return false;
            };
            let Some(close) = rest.iter().position(|&b| b == b']') else {
                return false;
            };
            let (class, after) = (&rest[..close], &rest[close + 1..]);
            let (negate, class) = match class.split_first() {
                Some((b'^', tail)) => (true, tail),
                _ => (false, class),
            };
            class_contains(class, c) != negate && glob_match(after, text_rest)
        }
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some((&literal, rest)) => text.first() == Some(&literal) && glob_match(rest, &text[1..]),
    }
}

fn class_contains(class: &[u8], c: u8) -> bool {
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == b'-' {
            if (class[i]..=class[i + 2]).contains(&c) {
                return true;
            }
            i += 3;
        } else {
            if class[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from(s)
    }

    fn set(engine: &StorageEngine, k: &'static str, v: &'static str) {
        engine.set(&key(k), key(v), SetOptions::default());
    }

    #[test]
    fn test_set_and_get() {
        let engine = StorageEngine::new();

        set(&engine, "key", "value");
        assert_eq!(engine.get(b"key"), Ok(Some(key("value"))));
        assert_eq!(engine.get(b"missing"), Ok(None));
    }

    #[test]
    fn test_set_conditions() {
        let engine = StorageEngine::new();
        let nx = SetOptions {
            condition: Some(SetCondition::IfAbsent),
            ..Default::default()
        };
        let xx = SetOptions {
            condition: Some(SetCondition::IfPresent),
            ..Default::default()
        };

        assert!(!engine.set(&key("k"), key("1"), xx));
        assert!(engine.set(&key("k"), key("1"), nx));
        assert!(!engine.set(&key("k"), key("2"), nx));
        assert!(engine.set(&key("k"), key("3"), xx));
        assert_eq!(engine.get(b"k"), Ok(Some(key("3"))));
    }

    #[test]
    fn test_version_changes_on_every_write() {
        let engine = StorageEngine::new();
        let k = key("balance");

        let v0 = engine.version(&k);
        set(&engine, "balance", "100");
        let v1 = engine.version(&k);
        assert_ne!(v0, v1);
        assert!(matches!(v1, KeyVersion::Present(_)));

        // Rewriting the same bytes is still a write
        set(&engine, "balance", "100");
        let v2 = engine.version(&k);
        assert_ne!(v1, v2);

        // Reads leave the version alone
        engine.get(b"balance").unwrap();
        assert_eq!(engine.version(&k), v2);
    }

    #[test]
    fn test_version_detects_create_then_delete() {
        let engine = StorageEngine::new();
        let k = key("ghost");

        let before = engine.version(&k);
        set(&engine, "ghost", "boo");
        assert!(engine.delete(&k));
        let after = engine.version(&k);

        assert!(matches!(after, KeyVersion::Absent(_)));
        assert_ne!(before, after);
    }

    #[test]
    fn test_noop_modifications_keep_version() {
        let engine = StorageEngine::new();
        let k = key("tags");
        engine.sadd(&k, vec![key("go")]).unwrap();
        let before = engine.version(&k);

        assert_eq!(engine.sadd(&k, vec![key("go")]), Ok(0));
        assert_eq!(engine.srem(&k, &[key("rust")]), Ok(0));
        assert!(!engine.persist(&k));
        assert_eq!(engine.version(&k), before);
    }

    #[test]
    fn test_expiry_changes_version() {
        let engine = StorageEngine::new();
        let k = key("session");
        engine.set(
            &k,
            key("token"),
            SetOptions {
                ttl: Some(Duration::from_millis(20)),
                condition: None,
            },
        );
        let live = engine.version(&k);

        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(engine.get(b"session"), Ok(None));
        assert_ne!(engine.version(&k), live);
        assert_eq!(engine.stats().expired, 1);
    }

    #[test]
    fn test_incr_by() {
        let engine = StorageEngine::new();

        assert_eq!(engine.incr_by(&key("counter"), 1), Ok(1));
        assert_eq!(engine.incr_by(&key("counter"), 41), Ok(42));
        assert_eq!(engine.incr_by(&key("counter"), -50), Ok(-8));

        set(&engine, "text", "hello");
        assert_eq!(engine.incr_by(&key("text"), 1), Err(StoreError::NotAnInteger));

        set(&engine, "big", "9223372036854775807");
        assert_eq!(engine.incr_by(&key("big"), 1), Err(StoreError::Overflow));
    }

    #[test]
    fn test_incr_keeps_ttl() {
        let engine = StorageEngine::new();
        engine.set(
            &key("n"),
            key("1"),
            SetOptions {
                ttl: Some(Duration::from_secs(60)),
                condition: None,
            },
        );
        engine.incr_by(&key("n"), 1).unwrap();
        assert!(engine.pttl(b"n") > 0);
    }

    #[test]
    fn test_append_and_strlen() {
        let engine = StorageEngine::new();

        assert_eq!(engine.append(&key("greeting"), b"Hello"), Ok(5));
        assert_eq!(engine.append(&key("greeting"), b" World"), Ok(11));
        assert_eq!(engine.strlen(b"greeting"), Ok(11));
        assert_eq!(engine.strlen(b"missing"), Ok(0));
    }

    #[test]
    fn test_wrong_type_is_rejected_without_change() {
        let engine = StorageEngine::new();
        engine
            .push(&key("tasks"), vec![key("a")], End::Head)
            .unwrap();
        let before = engine.version(&key("tasks"));

        assert_eq!(engine.get(b"tasks"), Err(StoreError::WrongType));
        assert_eq!(
            engine.hset(&key("tasks"), vec![(key("f"), key("v"))]),
            Err(StoreError::WrongType)
        );
        assert_eq!(engine.incr_by(&key("tasks"), 1), Err(StoreError::WrongType));
        assert_eq!(engine.version(&key("tasks")), before);
    }

    #[test]
    fn test_ttl_and_persist() {
        let engine = StorageEngine::new();

        assert_eq!(engine.pttl(b"missing"), -2);
        set(&engine, "k", "v");
        assert_eq!(engine.pttl(b"k"), -1);

        assert!(engine.expire(&key("k"), Duration::from_secs(60)));
        let ttl = engine.pttl(b"k");
        assert!(ttl > 59_000 && ttl <= 60_000);

        assert!(engine.persist(&key("k")));
        assert_eq!(engine.pttl(b"k"), -1);
        assert!(!engine.expire(&key("missing"), Duration::from_secs(1)));
    }

    #[test]
    fn test_hash_operations() {
        let engine = StorageEngine::new();
        let k = key("user:1001");

        let created = engine
            .hset(
                &k,
                vec![(key("name"), key("Li Si")), (key("age"), key("25"))],
            )
            .unwrap();
        assert_eq!(created, 2);
        assert_eq!(engine.hset(&k, vec![(key("age"), key("26"))]), Ok(0));

        assert_eq!(engine.hget(b"user:1001", b"age"), Ok(Some(key("26"))));
        assert_eq!(engine.hlen(b"user:1001"), Ok(2));
        assert_eq!(
            engine.hgetall(b"user:1001").unwrap(),
            vec![(key("age"), key("26")), (key("name"), key("Li Si"))]
        );

        assert_eq!(engine.hdel(&k, &[key("age"), key("nope")]), Ok(1));
        assert_eq!(engine.hdel(&k, &[key("name")]), Ok(1));
        // Emptied hashes disappear
        assert!(!engine.exists(b"user:1001"));
    }

    #[test]
    fn test_list_operations() {
        let engine = StorageEngine::new();
        let k = key("tasks");

        let len = engine
            .push(&k, vec![key("t1"), key("t2"), key("t3")], End::Head)
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(
            engine.lrange(b"tasks", 0, -1).unwrap(),
            vec![key("t3"), key("t2"), key("t1")]
        );

        assert_eq!(engine.pop(&k, End::Tail), Ok(Some(key("t1"))));
        assert_eq!(engine.llen(b"tasks"), Ok(2));
        assert_eq!(engine.lrange(b"tasks", 5, 10), Ok(vec![]));
        assert_eq!(engine.lrange(b"tasks", -1, -1), Ok(vec![key("t2")]));

        engine.pop(&k, End::Head).unwrap();
        engine.pop(&k, End::Head).unwrap();
        assert_eq!(engine.pop(&k, End::Head), Ok(None));
        assert_eq!(engine.key_type(b"tasks"), "none");
    }

    #[test]
    fn test_set_operations() {
        let engine = StorageEngine::new();
        let k = key("tags");

        let added = engine
            .sadd(&k, vec![key("go"), key("redis"), key("go")])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(engine.sismember(b"tags", b"go"), Ok(true));
        assert_eq!(engine.sismember(b"tags", b"rust"), Ok(false));
        assert_eq!(engine.smembers(b"tags"), Ok(vec![key("go"), key("redis")]));
        assert_eq!(engine.scard(b"tags"), Ok(2));
    }

    #[test]
    fn test_sorted_set_operations() {
        let engine = StorageEngine::new();
        let k = key("scores");

        engine
            .zadd(
                &k,
                vec![(95.5, key("zhang")), (88.0, key("li")), (92.5, key("wang"))],
            )
            .unwrap();

        let ascending = engine.zrange(b"scores", 0, -1, false).unwrap();
        assert_eq!(
            ascending.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>(),
            vec![key("li"), key("wang"), key("zhang")]
        );

        let top = engine.zrange(b"scores", 0, 0, true).unwrap();
        assert_eq!(top, vec![(key("zhang"), 95.5)]);

        assert_eq!(engine.zscore(b"scores", b"wang"), Ok(Some(92.5)));
        assert_eq!(engine.zadd(&k, vec![(99.0, key("li"))]), Ok(0));
        assert_eq!(engine.zrange(b"scores", -1, -1, false).unwrap()[0].0, key("li"));
    }

    #[test]
    fn test_snapshot_restore_undoes_changes() {
        let engine = StorageEngine::new();
        set(&engine, "a", "1");
        let a_version = engine.version(&key("a"));

        let snapshot = engine.snapshot([&key("a"), &key("b"), &key("a")]);
        assert_eq!(snapshot.len(), 2);

        set(&engine, "a", "2");
        set(&engine, "b", "new");
        engine.restore(snapshot);

        assert_eq!(engine.get(b"a"), Ok(Some(key("1"))));
        assert_eq!(engine.version(&key("a")), a_version);
        assert!(!engine.exists(b"b"));
    }

    #[test]
    fn test_keys_pattern() {
        let engine = StorageEngine::new();

        set(&engine, "hello", "1");
        set(&engine, "hallo", "2");
        set(&engine, "hxllo", "3");
        set(&engine, "hllo", "4");
        set(&engine, "world", "5");

        assert_eq!(engine.keys(b"*").len(), 5);
        assert_eq!(engine.keys(b"h?llo").len(), 3);
        assert_eq!(engine.keys(b"h[ae]llo"), vec![key("hallo"), key("hello")]);
        assert_eq!(engine.keys(b"h[^e]llo"), vec![key("hallo"), key("hxllo")]);
        assert_eq!(engine.keys(b"h[a-f]llo").len(), 2);
        assert_eq!(engine.keys(b"w*"), vec![key("world")]);
    }

    #[test]
    fn test_cleanup_expired() {
        let engine = StorageEngine::new();
        let short = SetOptions {
            ttl: Some(Duration::from_millis(10)),
            condition: None,
        };

        for i in 0..10 {
            engine.set(&Bytes::from(format!("key{}", i)), key("v"), short);
        }
        set(&engine, "persistent", "v");

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(engine.cleanup_expired(), 10);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_flush_changes_absent_versions() {
        let engine = StorageEngine::new();
        set(&engine, "k", "v");
        engine.flush();

        assert!(engine.is_empty());
        assert!(matches!(engine.version(&key("k")), KeyVersion::Absent(r) if r > 0));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(5, 0, -1), Some(0..5));
        assert_eq!(normalize_range(5, -2, -1), Some(3..5));
        assert_eq!(normalize_range(5, 1, 100), Some(1..5));
        assert_eq!(normalize_range(5, -100, 0), Some(0..1));
        assert_eq!(normalize_range(5, 3, 1), None);
        assert_eq!(normalize_range(0, 0, -1), None);
    }
}
