//! Store Commands
//!
//! A [`Command`] is an immutable request against the store: a [`Verb`], the
//! key it targets, and its remaining arguments. The batcher and transaction
//! treat commands as opaque; the only thing they inspect is the key (to watch
//! it) and whether the verb reads or writes.
//!
//! The constructors below cover the per-type calls the store understands.
//! Numeric arguments are encoded as decimal strings, the way a
//! Redis-compatible store expects them.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// The operation a command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    // Strings
    Get,
    Set,
    Incr,
    IncrBy,
    Decr,
    DecrBy,
    Append,
    StrLen,

    // Keys
    Del,
    Exists,
    PExpire,
    Persist,
    Ttl,
    PTtl,
    Type,
    Keys,

    // Hashes
    HSet,
    HGet,
    HGetAll,
    HDel,
    HLen,

    // Lists
    LPush,
    RPush,
    LPop,
    RPop,
    LRange,
    LLen,

    // Sets
    SAdd,
    SRem,
    SMembers,
    SIsMember,
    SCard,

    // Sorted sets
    ZAdd,
    ZRange,
    ZRevRange,
    ZScore,
}

impl Verb {
    /// Every verb, in declaration order.
    pub const ALL: &'static [Verb] = &[
        Verb::Get,
        Verb::Set,
        Verb::Incr,
        Verb::IncrBy,
        Verb::Decr,
        Verb::DecrBy,
        Verb::Append,
        Verb::StrLen,
        Verb::Del,
        Verb::Exists,
        Verb::PExpire,
        Verb::Persist,
        Verb::Ttl,
        Verb::PTtl,
        Verb::Type,
        Verb::Keys,
        Verb::HSet,
        Verb::HGet,
        Verb::HGetAll,
        Verb::HDel,
        Verb::HLen,
        Verb::LPush,
        Verb::RPush,
        Verb::LPop,
        Verb::RPop,
        Verb::LRange,
        Verb::LLen,
        Verb::SAdd,
        Verb::SRem,
        Verb::SMembers,
        Verb::SIsMember,
        Verb::SCard,
        Verb::ZAdd,
        Verb::ZRange,
        Verb::ZRevRange,
        Verb::ZScore,
    ];

    /// The command name as the store spells it.
    pub fn name(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Set => "SET",
            Verb::Incr => "INCR",
            Verb::IncrBy => "INCRBY",
            Verb::Decr => "DECR",
            Verb::DecrBy => "DECRBY",
            Verb::Append => "APPEND",
            Verb::StrLen => "STRLEN",
            Verb::Del => "DEL",
            Verb::Exists => "EXISTS",
            Verb::PExpire => "PEXPIRE",
            Verb::Persist => "PERSIST",
            Verb::Ttl => "TTL",
            Verb::PTtl => "PTTL",
            Verb::Type => "TYPE",
            Verb::Keys => "KEYS",
            Verb::HSet => "HSET",
            Verb::HGet => "HGET",
            Verb::HGetAll => "HGETALL",
            Verb::HDel => "HDEL",
            Verb::HLen => "HLEN",
            Verb::LPush => "LPUSH",
            Verb::RPush => "RPUSH",
            Verb::LPop => "LPOP",
            Verb::RPop => "RPOP",
            Verb::LRange => "LRANGE",
            Verb::LLen => "LLEN",
            Verb::SAdd => "SADD",
            Verb::SRem => "SREM",
            Verb::SMembers => "SMEMBERS",
            Verb::SIsMember => "SISMEMBER",
            Verb::SCard => "SCARD",
            Verb::ZAdd => "ZADD",
            Verb::ZRange => "ZRANGE",
            Verb::ZRevRange => "ZREVRANGE",
            Verb::ZScore => "ZSCORE",
        }
    }

    /// Looks a verb up by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Verb> {
        Verb::ALL
            .iter()
            .copied()
            .find(|verb| verb.name().eq_ignore_ascii_case(name))
    }

    /// Returns true if executing the verb can modify the store.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Verb::Set
                | Verb::Incr
                | Verb::IncrBy
                | Verb::Decr
                | Verb::DecrBy
                | Verb::Append
                | Verb::Del
                | Verb::PExpire
                | Verb::Persist
                | Verb::HSet
                | Verb::HDel
                | Verb::LPush
                | Verb::RPush
                | Verb::LPop
                | Verb::RPop
                | Verb::SAdd
                | Verb::SRem
                | Verb::ZAdd
        )
    }

    /// Returns true if the key position names the one key the verb touches.
    ///
    /// `KEYS` carries a pattern there instead.
    pub fn is_keyed(self) -> bool {
        !matches!(self, Verb::Keys)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One request against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    key: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    /// Creates a command from its parts.
    ///
    /// # Example
    /// ```
    /// use flashkv_client::{Command, Verb};
    /// use bytes::Bytes;
    ///
    /// let cmd = Command::new(Verb::Set, "name", vec![Bytes::from("Ariz")]);
    /// assert_eq!(cmd, Command::set("name", "Ariz"));
    /// assert!(cmd.is_write());
    /// ```
    pub fn new(verb: Verb, key: impl Into<Bytes>, args: Vec<Bytes>) -> Self {
        Self {
            verb,
            key: key.into(),
            args,
        }
    }

    fn with_args<I, A>(verb: Verb, key: impl Into<Bytes>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Self::new(verb, key, args.into_iter().map(Into::into).collect())
    }

    fn keyed(verb: Verb, key: impl Into<Bytes>) -> Self {
        Self::new(verb, key, Vec::new())
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn is_write(&self) -> bool {
        self.verb.is_write()
    }

    // ---- strings ----

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Get, key)
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Verb::Set, key, vec![value.into()])
    }

    /// `SET key value PX <ttl>`; sub-millisecond TTLs round up to 1ms.
    pub fn set_with_ttl(key: impl Into<Bytes>, value: impl Into<Bytes>, ttl: Duration) -> Self {
        Self::new(
            Verb::Set,
            key,
            vec![value.into(), Bytes::from_static(b"PX"), millis(ttl)],
        )
    }

    /// `SET key value NX`: only set when the key does not exist.
    pub fn set_nx(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Verb::Set, key, vec![value.into(), Bytes::from_static(b"NX")])
    }

    pub fn incr(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Incr, key)
    }

    pub fn incr_by(key: impl Into<Bytes>, delta: i64) -> Self {
        Self::new(Verb::IncrBy, key, vec![integer(delta)])
    }

    pub fn decr(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Decr, key)
    }

    pub fn decr_by(key: impl Into<Bytes>, delta: i64) -> Self {
        Self::new(Verb::DecrBy, key, vec![integer(delta)])
    }

    pub fn append(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Verb::Append, key, vec![value.into()])
    }

    pub fn strlen(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::StrLen, key)
    }

    // ---- keys ----

    pub fn del(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Del, key)
    }

    pub fn exists(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Exists, key)
    }

    /// Sets a time-to-live on the key (sent as `PEXPIRE`).
    pub fn expire(key: impl Into<Bytes>, ttl: Duration) -> Self {
        Self::new(Verb::PExpire, key, vec![millis(ttl)])
    }

    pub fn persist(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Persist, key)
    }

    pub fn ttl(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Ttl, key)
    }

    pub fn pttl(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::PTtl, key)
    }

    pub fn key_type(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Type, key)
    }

    /// `KEYS pattern`. The pattern travels in the key position.
    pub fn keys(pattern: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::Keys, pattern)
    }

    // ---- hashes ----

    pub fn hset<I, F, V>(key: impl Into<Bytes>, fields: I) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<Bytes>,
        V: Into<Bytes>,
    {
        let args = fields
            .into_iter()
            .flat_map(|(field, value)| -> [Bytes; 2] { [field.into(), value.into()] })
            .collect();
        Self::new(Verb::HSet, key, args)
    }

    pub fn hget(key: impl Into<Bytes>, field: impl Into<Bytes>) -> Self {
        Self::new(Verb::HGet, key, vec![field.into()])
    }

    pub fn hgetall(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::HGetAll, key)
    }

    pub fn hdel<I, F>(key: impl Into<Bytes>, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Bytes>,
    {
        Self::with_args(Verb::HDel, key, fields)
    }

    pub fn hlen(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::HLen, key)
    }

    // ---- lists ----

    pub fn lpush<I, V>(key: impl Into<Bytes>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        Self::with_args(Verb::LPush, key, values)
    }

    pub fn rpush<I, V>(key: impl Into<Bytes>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        Self::with_args(Verb::RPush, key, values)
    }

    pub fn lpop(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::LPop, key)
    }

    pub fn rpop(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::RPop, key)
    }

    /// `LRANGE key start stop`, both ends inclusive, negative from the tail.
    pub fn lrange(key: impl Into<Bytes>, start: i64, stop: i64) -> Self {
        Self::new(Verb::LRange, key, vec![integer(start), integer(stop)])
    }

    pub fn llen(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::LLen, key)
    }

    // ---- sets ----

    pub fn sadd<I, M>(key: impl Into<Bytes>, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Bytes>,
    {
        Self::with_args(Verb::SAdd, key, members)
    }

    pub fn srem<I, M>(key: impl Into<Bytes>, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Bytes>,
    {
        Self::with_args(Verb::SRem, key, members)
    }

    pub fn smembers(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::SMembers, key)
    }

    pub fn sismember(key: impl Into<Bytes>, member: impl Into<Bytes>) -> Self {
        Self::new(Verb::SIsMember, key, vec![member.into()])
    }

    pub fn scard(key: impl Into<Bytes>) -> Self {
        Self::keyed(Verb::SCard, key)
    }

    // ---- sorted sets ----

    pub fn zadd<I, M>(key: impl Into<Bytes>, members: I) -> Self
    where
        I: IntoIterator<Item = (f64, M)>,
        M: Into<Bytes>,
    {
        let args = members
            .into_iter()
            .flat_map(|(score, member)| [Bytes::from(score.to_string()), member.into()])
            .collect();
        Self::new(Verb::ZAdd, key, args)
    }

    /// `ZRANGE key start stop [WITHSCORES]`, lowest score first.
    pub fn zrange(key: impl Into<Bytes>, start: i64, stop: i64, with_scores: bool) -> Self {
        Self::new(Verb::ZRange, key, range_args(start, stop, with_scores))
    }

    /// `ZREVRANGE key start stop [WITHSCORES]`, highest score first.
    pub fn zrevrange(key: impl Into<Bytes>, start: i64, stop: i64, with_scores: bool) -> Self {
        Self::new(Verb::ZRevRange, key, range_args(start, stop, with_scores))
    }

    pub fn zscore(key: impl Into<Bytes>, member: impl Into<Bytes>) -> Self {
        Self::new(Verb::ZScore, key, vec![member.into()])
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, String::from_utf8_lossy(&self.key))?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

fn integer(n: i64) -> Bytes {
    Bytes::from(n.to_string())
}

fn millis(ttl: Duration) -> Bytes {
    let ms = ttl.as_millis().clamp(1, i64::MAX as u128);
    Bytes::from(ms.to_string())
}

fn range_args(start: i64, stop: i64, with_scores: bool) -> Vec<Bytes> {
    let mut args = vec![integer(start), integer(stop)];
    if with_scores {
        args.push(Bytes::from_static(b"WITHSCORES"));
    }
    args
}
