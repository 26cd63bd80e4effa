//! Typed Command Replies
//!
//! Every command that the store executes successfully produces a [`Reply`].
//! The shapes mirror what a Redis-compatible store answers with:
//!
//! - Status: `OK`, `PONG`, a type name
//! - Integer: counters, lengths, booleans encoded as `0`/`1`
//! - Bulk: binary-safe values
//! - Nil: a missing key or field
//! - Array: multi-value answers such as `LRANGE` or `HGETALL`
//!
//! Store-side failures are never replies. They travel as
//! [`CommandError::Server`](crate::CommandError::Server) in the command's
//! result slot.

use bytes::Bytes;
use std::fmt;

/// A successful answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A short, non-binary status line such as `OK`
    Status(String),

    /// A 64-bit signed integer
    Integer(i64),

    /// A binary-safe value
    Bulk(Bytes),

    /// The absence of a value
    Nil,

    /// An ordered sequence of replies
    Array(Vec<Reply>),
}

impl Reply {
    /// The `OK` status.
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    /// Creates a bulk reply.
    ///
    /// # Example
    /// ```
    /// use flashkv_client::Reply;
    /// let reply = Reply::bulk("hello");
    /// assert_eq!(reply.as_str(), Some("hello"));
    /// ```
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Bulk reply for a present value, nil for a missing one.
    pub fn optional(data: Option<Bytes>) -> Self {
        data.map_or(Reply::Nil, Reply::Bulk)
    }

    pub fn array(values: Vec<Reply>) -> Self {
        Reply::Array(values)
    }

    /// Builds an array of bulk replies.
    pub fn bulks(values: impl IntoIterator<Item = Bytes>) -> Self {
        Reply::Array(values.into_iter().map(Reply::Bulk).collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s == "OK")
    }

    /// The reply as text, for status and UTF-8 bulk replies.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Consumes a bulk or nil reply into an optional value.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Reads the reply as an integer, accepting numeric bulk strings.
    ///
    /// Stores keep counters as strings, so `GET counter` answers with a bulk
    /// reply that this turns back into a number.
    pub fn to_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            Reply::Status(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<Bytes> for Reply {
    fn from(data: Bytes) -> Self {
        Reply::Bulk(data)
    }
}

impl From<i64> for Reply {
    fn from(n: i64) -> Self {
        Reply::Integer(n)
    }
}

/// Renders the reply the way `redis-cli` prints it.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            Reply::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
