//! Command Handler Module
//!
//! Executes [`Command`]s against the [`StorageEngine`]. This is the
//! server-side half of the in-process store: it validates arity and options,
//! calls the typed engine operation and shapes the answer as a [`Reply`].
//!
//! Failures come back as [`CommandError::Server`] carrying the message a
//! Redis-compatible server would send (`ERR ...`, `WRONGTYPE ...`).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  execute()  │───>│  dispatch() │───>│   cmd_*()   │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      StorageEngine          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::commands::{Command, Verb};
use crate::error::{CommandError, CommandResult};
use crate::reply::Reply;
use crate::storage::{End, SetCondition, SetOptions, StorageEngine, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Executes commands against a storage engine.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Executes one command and returns its reply or the store's rejection.
    pub fn execute(&self, command: &Command) -> CommandResult {
        let result = self.dispatch(command);
        trace!(command = %command, ok = result.is_ok(), "Executed command");
        result
    }

    fn dispatch(&self, cmd: &Command) -> CommandResult {
        match cmd.verb() {
            // String commands
            Verb::Get => self.cmd_get(cmd),
            Verb::Set => self.cmd_set(cmd),
            Verb::Incr => self.cmd_incr_by(cmd, Some(1)),
            Verb::Decr => self.cmd_incr_by(cmd, Some(-1)),
            Verb::IncrBy | Verb::DecrBy => self.cmd_incr_by(cmd, None),
            Verb::Append => self.cmd_append(cmd),
            Verb::StrLen => self.cmd_strlen(cmd),

            // Key commands
            Verb::Del => self.cmd_del(cmd),
            Verb::Exists => self.cmd_exists(cmd),
            Verb::PExpire => self.cmd_pexpire(cmd),
            Verb::Persist => self.cmd_persist(cmd),
            Verb::Ttl | Verb::PTtl => self.cmd_ttl(cmd),
            Verb::Type => self.cmd_type(cmd),
            Verb::Keys => self.cmd_keys(cmd),

            // Hash commands
            Verb::HSet => self.cmd_hset(cmd),
            Verb::HGet => self.cmd_hget(cmd),
            Verb::HGetAll => self.cmd_hgetall(cmd),
            Verb::HDel => self.cmd_hdel(cmd),
            Verb::HLen => self.cmd_hlen(cmd),

            // List commands
            Verb::LPush => self.cmd_push(cmd, End::Head),
            Verb::RPush => self.cmd_push(cmd, End::Tail),
            Verb::LPop => self.cmd_pop(cmd, End::Head),
            Verb::RPop => self.cmd_pop(cmd, End::Tail),
            Verb::LRange => self.cmd_lrange(cmd),
            Verb::LLen => self.cmd_llen(cmd),

            // Set commands
            Verb::SAdd => self.cmd_sadd(cmd),
            Verb::SRem => self.cmd_srem(cmd),
            Verb::SMembers => self.cmd_smembers(cmd),
            Verb::SIsMember => self.cmd_sismember(cmd),
            Verb::SCard => self.cmd_scard(cmd),

            // Sorted set commands
            Verb::ZAdd => self.cmd_zadd(cmd),
            Verb::ZRange => self.cmd_zrange(cmd, false),
            Verb::ZRevRange => self.cmd_zrange(cmd, true),
            Verb::ZScore => self.cmd_zscore(cmd),
        }
    }

    // ========================================================================
    // String Commands
    // ========================================================================

    /// GET key
    fn cmd_get(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::optional(self.storage.get(cmd.key())?))
    }

    /// SET key value [EX seconds | PX milliseconds] [NX | XX]
    fn cmd_set(&self, cmd: &Command) -> CommandResult {
        let Some((value, options)) = cmd.args().split_first() else {
            return Err(wrong_arity(cmd));
        };

        let mut parsed = SetOptions::default();
        let mut rest = options.iter();
        while let Some(option) = rest.next() {
            let option = option.to_ascii_uppercase();
            match option.as_slice() {
                b"EX" | b"PX" => {
                    let amount = parse_integer(rest.next().ok_or_else(syntax_error)?)?;
                    if amount <= 0 {
                        return Err(server("ERR invalid expire time in 'set' command"));
                    }
                    parsed.ttl = Some(if option == b"EX" {
                        Duration::from_secs(amount as u64)
                    } else {
                        Duration::from_millis(amount as u64)
                    });
                }
                b"NX" | b"XX" => {
                    let condition = if option == b"NX" {
                        SetCondition::IfAbsent
                    } else {
                        SetCondition::IfPresent
                    };
                    if parsed.condition.is_some_and(|c| c != condition) {
                        return Err(syntax_error());
                    }
                    parsed.condition = Some(condition);
                }
                _ => return Err(syntax_error()),
            }
        }

        if self.storage.set(cmd.key(), value.clone(), parsed) {
            Ok(Reply::ok())
        } else {
            Ok(Reply::Nil)
        }
    }

    /// INCR / DECR (fixed delta) and INCRBY / DECRBY (delta argument)
    fn cmd_incr_by(&self, cmd: &Command, fixed: Option<i64>) -> CommandResult {
        let delta = match fixed {
            Some(delta) => {
                arity(cmd, cmd.args().is_empty())?;
                delta
            }
            None => {
                arity(cmd, cmd.args().len() == 1)?;
                let amount = parse_integer(&cmd.args()[0])?;
                if cmd.verb() == Verb::DecrBy {
                    amount.checked_neg().ok_or(StoreError::Overflow)?
                } else {
                    amount
                }
            }
        };
        Ok(Reply::integer(self.storage.incr_by(cmd.key(), delta)?))
    }

    /// APPEND key value
    fn cmd_append(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 1)?;
        let len = self.storage.append(cmd.key(), &cmd.args()[0])?;
        Ok(Reply::integer(len as i64))
    }

    /// STRLEN key
    fn cmd_strlen(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.strlen(cmd.key())? as i64))
    }

    // ========================================================================
    // Key Commands
    // ========================================================================

    /// DEL key
    fn cmd_del(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(flag(self.storage.delete(cmd.key())))
    }

    /// EXISTS key
    fn cmd_exists(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(flag(self.storage.exists(cmd.key())))
    }

    /// PEXPIRE key milliseconds; a non-positive TTL deletes the key
    fn cmd_pexpire(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 1)?;
        let ms = parse_integer(&cmd.args()[0])?;
        let applied = if ms <= 0 {
            self.storage.delete(cmd.key())
        } else {
            self.storage.expire(cmd.key(), Duration::from_millis(ms as u64))
        };
        Ok(flag(applied))
    }

    /// PERSIST key
    fn cmd_persist(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(flag(self.storage.persist(cmd.key())))
    }

    /// TTL key (rounded seconds) / PTTL key
    fn cmd_ttl(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        let pttl = self.storage.pttl(cmd.key());
        let ttl = match cmd.verb() {
            Verb::Ttl if pttl >= 0 => (pttl + 500) / 1000,
            _ => pttl,
        };
        Ok(Reply::integer(ttl))
    }

    /// TYPE key
    fn cmd_type(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::status(self.storage.key_type(cmd.key())))
    }

    /// KEYS pattern
    fn cmd_keys(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::bulks(self.storage.keys(cmd.key())))
    }

    // ========================================================================
    // Hash Commands
    // ========================================================================

    /// HSET key field value [field value ...]
    fn cmd_hset(&self, cmd: &Command) -> CommandResult {
        let args = cmd.args();
        arity(cmd, !args.is_empty() && args.len() % 2 == 0)?;
        let fields = args
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        Ok(Reply::integer(self.storage.hset(cmd.key(), fields)? as i64))
    }

    /// HGET key field
    fn cmd_hget(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 1)?;
        Ok(Reply::optional(self.storage.hget(cmd.key(), &cmd.args()[0])?))
    }

    /// HGETALL key, as a flat field/value array
    fn cmd_hgetall(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        let pairs = self.storage.hgetall(cmd.key())?;
        Ok(Reply::bulks(
            pairs.into_iter().flat_map(|(field, value)| [field, value]),
        ))
    }

    /// HDEL key field [field ...]
    fn cmd_hdel(&self, cmd: &Command) -> CommandResult {
        arity(cmd, !cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.hdel(cmd.key(), cmd.args())? as i64))
    }

    /// HLEN key
    fn cmd_hlen(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.hlen(cmd.key())? as i64))
    }

    // ========================================================================
    // List Commands
    // ========================================================================

    /// LPUSH / RPUSH key value [value ...]
    fn cmd_push(&self, cmd: &Command, end: End) -> CommandResult {
        arity(cmd, !cmd.args().is_empty())?;
        let len = self.storage.push(cmd.key(), cmd.args().to_vec(), end)?;
        Ok(Reply::integer(len as i64))
    }

    /// LPOP / RPOP key
    fn cmd_pop(&self, cmd: &Command, end: End) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::optional(self.storage.pop(cmd.key(), end)?))
    }

    /// LRANGE key start stop
    fn cmd_lrange(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 2)?;
        let start = parse_integer(&cmd.args()[0])?;
        let stop = parse_integer(&cmd.args()[1])?;
        Ok(Reply::bulks(self.storage.lrange(cmd.key(), start, stop)?))
    }

    /// LLEN key
    fn cmd_llen(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.llen(cmd.key())? as i64))
    }

    // ========================================================================
    // Set Commands
    // ========================================================================

    /// SADD key member [member ...]
    fn cmd_sadd(&self, cmd: &Command) -> CommandResult {
        arity(cmd, !cmd.args().is_empty())?;
        let added = self.storage.sadd(cmd.key(), cmd.args().to_vec())?;
        Ok(Reply::integer(added as i64))
    }

    /// SREM key member [member ...]
    fn cmd_srem(&self, cmd: &Command) -> CommandResult {
        arity(cmd, !cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.srem(cmd.key(), cmd.args())? as i64))
    }

    /// SMEMBERS key
    fn cmd_smembers(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::bulks(self.storage.smembers(cmd.key())?))
    }

    /// SISMEMBER key member
    fn cmd_sismember(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 1)?;
        Ok(flag(self.storage.sismember(cmd.key(), &cmd.args()[0])?))
    }

    /// SCARD key
    fn cmd_scard(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().is_empty())?;
        Ok(Reply::integer(self.storage.scard(cmd.key())? as i64))
    }

    // ========================================================================
    // Sorted Set Commands
    // ========================================================================

    /// ZADD key score member [score member ...]
    fn cmd_zadd(&self, cmd: &Command) -> CommandResult {
        let args = cmd.args();
        arity(cmd, !args.is_empty() && args.len() % 2 == 0)?;
        let members = args
            .chunks_exact(2)
            .map(|pair| Ok((parse_score(&pair[0])?, pair[1].clone())))
            .collect::<Result<Vec<_>, CommandError>>()?;
        Ok(Reply::integer(self.storage.zadd(cmd.key(), members)? as i64))
    }

    /// ZRANGE / ZREVRANGE key start stop [WITHSCORES]
    fn cmd_zrange(&self, cmd: &Command, reverse: bool) -> CommandResult {
        let args = cmd.args();
        arity(cmd, args.len() == 2 || args.len() == 3)?;
        let with_scores = match args.get(2) {
            Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
            Some(_) => return Err(syntax_error()),
            None => false,
        };
        let start = parse_integer(&args[0])?;
        let stop = parse_integer(&args[1])?;

        let members = self.storage.zrange(cmd.key(), start, stop, reverse)?;
        let reply = if with_scores {
            Reply::bulks(
                members
                    .into_iter()
                    .flat_map(|(member, score)| [member, format_score(score)]),
            )
        } else {
            Reply::bulks(members.into_iter().map(|(member, _)| member))
        };
        Ok(reply)
    }

    /// ZSCORE key member
    fn cmd_zscore(&self, cmd: &Command) -> CommandResult {
        arity(cmd, cmd.args().len() == 1)?;
        let score = self.storage.zscore(cmd.key(), &cmd.args()[0])?;
        Ok(Reply::optional(score.map(format_score)))
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn server(message: impl Into<String>) -> CommandError {
    CommandError::Server(message.into())
}

fn syntax_error() -> CommandError {
    server("ERR syntax error")
}

fn wrong_arity(cmd: &Command) -> CommandError {
    server(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd.verb().name().to_ascii_lowercase()
    ))
}

fn arity(cmd: &Command, valid: bool) -> Result<(), CommandError> {
    if valid {
        Ok(())
    } else {
        Err(wrong_arity(cmd))
    }
}

/// 1 for true, 0 for false.
fn flag(value: bool) -> Reply {
    Reply::integer(value as i64)
}

fn parse_integer(raw: &Bytes) -> Result<i64, CommandError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::NotAnInteger.into())
}

fn parse_score(raw: &Bytes) -> Result<f64, CommandError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|score| !score.is_nan())
        .ok_or_else(|| StoreError::NotAFloat.into())
}

fn format_score(score: f64) -> Bytes {
    Bytes::from(score.to_string())
}
