//! Atomic script contract.
//!
//! A [`Script`] is a named server-side operation with a documented,
//! positional key and argument layout. Each script carries two bodies: the
//! Lua source run by Redis and a native body run by the in-memory backend
//! under its keyspace lock. Callers never build key/argument vectors by
//! hand; they implement [`ScriptCall`] for each operation, and the executor
//! checks the arity before dispatching.

use crate::error::{StoreError, StoreResult};
use crate::memory::Keyspace;

/// Native script body used by the in-memory backend.
pub type NativeScript = fn(&mut Keyspace, &[String], &[String]) -> StoreResult<Reply>;

/// Expected length of a key or argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly `n` entries.
    Fixed(usize),
    /// A fixed header followed by any number of repetitions of a
    /// fixed-size group, one group per item of a batch.
    Grouped {
        /// Entries before the first group.
        header: usize,
        /// Entries per group.
        group: usize,
    },
}

impl Arity {
    /// Check a list length against this arity.
    pub fn accepts(&self, len: usize) -> bool {
        match *self {
            Arity::Fixed(n) => len == n,
            Arity::Grouped { header, group } => {
                group > 0 && len >= header && (len - header) % group == 0
            }
        }
    }

    /// Number of groups in a list of this length (1 for fixed arities).
    pub fn groups(&self, len: usize) -> usize {
        match *self {
            Arity::Fixed(_) => 1,
            Arity::Grouped { header, group } => (len.saturating_sub(header)) / group.max(1),
        }
    }
}

/// A named atomic operation.
#[derive(Debug)]
pub struct Script {
    /// Script name, used in logs and errors.
    pub name: &'static str,
    /// Lua source executed by Redis.
    pub lua: &'static str,
    /// Native body executed by the in-memory backend.
    pub native: NativeScript,
    /// Key list layout.
    pub keys: Arity,
    /// Argument list layout.
    pub args: Arity,
}

impl Script {
    /// Validate a key/argument layout against the contract.
    pub fn check(&self, keys: &[String], args: &[String]) -> StoreResult<()> {
        if !self.keys.accepts(keys.len()) {
            return Err(StoreError::contract(format!(
                "{}: expected keys {:?}, got {}",
                self.name,
                self.keys,
                keys.len()
            )));
        }
        if !self.args.accepts(args.len()) {
            return Err(StoreError::contract(format!(
                "{}: expected args {:?}, got {}",
                self.name,
                self.args,
                args.len()
            )));
        }
        if let (Arity::Grouped { .. }, Arity::Grouped { .. }) = (self.keys, self.args)
            && self.keys.groups(keys.len()) != self.args.groups(args.len())
        {
            return Err(StoreError::contract(format!(
                "{}: key and argument groups differ",
                self.name
            )));
        }
        Ok(())
    }
}

/// A script reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nil / false.
    Nil,
    /// Integer.
    Int(i64),
    /// Status reply.
    Status(String),
    /// Bulk string.
    Bulk(String),
    /// Array.
    Array(Vec<Reply>),
}

impl Reply {
    /// The `OK` status.
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// A status token.
    pub fn status(token: &str) -> Self {
        Reply::Status(token.to_string())
    }

    /// Check if this is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Text of a status or bulk reply.
    pub fn token(&self) -> Option<&str> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to an integer.
    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Status(s) | Reply::Bulk(s) => s
                .parse()
                .map_err(|_| StoreError::contract(format!("expected integer, got '{}'", s))),
            other => Err(StoreError::contract(format!("expected integer, got {:?}", other))),
        }
    }

    /// Convert to a string.
    pub fn into_string(self) -> StoreResult<String> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Ok(s),
            Reply::Int(n) => Ok(n.to_string()),
            other => Err(StoreError::contract(format!("expected string, got {:?}", other))),
        }
    }

    /// Convert to an optional string.
    pub fn into_opt_string(self) -> StoreResult<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            other => other.into_string().map(Some),
        }
    }

    /// Convert to an array.
    pub fn into_array(self) -> StoreResult<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(StoreError::contract(format!("expected array, got {:?}", other))),
        }
    }

    /// Convert a Redis value.
    pub fn from_redis(value: redis::Value) -> StoreResult<Self> {
        match value {
            redis::Value::Nil => Ok(Reply::Nil),
            redis::Value::Int(n) => Ok(Reply::Int(n)),
            redis::Value::Okay => Ok(Reply::ok()),
            redis::Value::SimpleString(s) => Ok(Reply::Status(s)),
            redis::Value::BulkString(bytes) => String::from_utf8(bytes)
                .map(Reply::Bulk)
                .map_err(|e| StoreError::contract(format!("non utf-8 reply: {}", e))),
            redis::Value::Array(items) => items
                .into_iter()
                .map(Reply::from_redis)
                .collect::<StoreResult<Vec<_>>>()
                .map(Reply::Array),
            other => Err(StoreError::contract(format!(
                "unsupported reply type: {:?}",
                other
            ))),
        }
    }
}

/// Typed builder for one invocation of a script.
///
/// Implementations own the positional layout of a single operation, so a
/// call site can never pass keys in the wrong order.
pub trait ScriptCall {
    /// Parsed reply.
    type Output;
    /// Error type produced when the reply carries a domain error token.
    type Error: From<StoreError>;

    /// The script this call invokes.
    fn script(&self) -> &'static Script;

    /// Ordered key list.
    fn keys(&self) -> Vec<String>;

    /// Ordered argument list.
    fn args(&self) -> Vec<String>;

    /// Parse the reply.
    fn parse(&self, reply: Reply) -> Result<Self::Output, Self::Error>;
}
