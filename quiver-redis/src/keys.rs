//! Deterministic, versioned key derivation.
//!
//! Every key has the shape
//! `prefix:version:namespace:key-type:entity-id[:sub-id...]`.
//! Entities that do not belong to a namespace (message records, background
//! jobs, locks, exchanges) live under the [`GLOBAL_NAMESPACE`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Namespace used for entities that are not scoped to a queue namespace.
pub const GLOBAL_NAMESPACE: &str = "global";

/// Kinds of keys in the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Pending list of a FIFO/LIFO queue (optionally per consumer group).
    Pending,
    /// Pending sorted set of a priority queue (optionally per consumer group).
    PriorityPending,
    /// Scheduled sorted set, scored by next delivery time.
    Scheduled,
    /// Delayed sorted set, scored by retry time.
    Delayed,
    /// Requeued list.
    Requeued,
    /// Per-consumer processing list.
    Processing,
    /// Acknowledged audit sorted set.
    Acknowledged,
    /// Dead-lettered audit sorted set.
    DeadLettered,
    /// Queue properties hash (type, delivery model, counters, state).
    Properties,
    /// Sorted set of every message id belonging to a queue.
    MessagesIndex,
    /// Set of consumer groups of a pub-sub queue.
    ConsumerGroups,
    /// Exchange binding sets.
    ExchangeBindings,
    /// Background jobs hash.
    BackgroundJobs,
    /// Lock keys.
    Locks,
    /// Message record hash.
    Message,
    /// Set of all queues.
    Queues,
    /// Set of all namespaces.
    Namespaces,
    /// Hash of consumer id to processing list key, per queue.
    ProcessingRegistry,
    /// Consumer heartbeat key.
    Heartbeat,
    /// Exchange metadata hash and exchanges index.
    Exchanges,
    /// Reverse index of exchanges a queue is bound to.
    QueueExchanges,
}

impl KeyType {
    /// Key segment for this key type.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Pending => "pending",
            KeyType::PriorityPending => "priority-pending",
            KeyType::Scheduled => "scheduled",
            KeyType::Delayed => "delayed",
            KeyType::Requeued => "requeued",
            KeyType::Processing => "processing",
            KeyType::Acknowledged => "acknowledged",
            KeyType::DeadLettered => "dead-lettered",
            KeyType::Properties => "properties",
            KeyType::MessagesIndex => "messages-index",
            KeyType::ConsumerGroups => "consumer-groups",
            KeyType::ExchangeBindings => "exchange-bindings",
            KeyType::BackgroundJobs => "background-jobs",
            KeyType::Locks => "locks",
            KeyType::Message => "message",
            KeyType::Queues => "queues",
            KeyType::Namespaces => "namespaces",
            KeyType::ProcessingRegistry => "processing-registry",
            KeyType::Heartbeat => "heartbeat",
            KeyType::Exchanges => "exchanges",
            KeyType::QueueExchanges => "queue-exchanges",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key prefix and schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyScheme {
    /// Leading key segment shared by every key.
    pub prefix: String,
    /// Schema version segment.
    pub version: String,
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self {
            prefix: "quiver".to_string(),
            version: "1".to_string(),
        }
    }
}

impl KeyScheme {
    /// Create a scheme with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Set the schema version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Build a key.
    pub fn key(&self, namespace: &str, kind: KeyType, entity: &str, sub: &[&str]) -> String {
        let mut key = self.kind_prefix(namespace, kind);
        key.push_str(entity);
        for part in sub {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Build a key in the global namespace.
    pub fn global(&self, kind: KeyType, entity: &str) -> String {
        self.key(GLOBAL_NAMESPACE, kind, entity, &[])
    }

    /// Everything up to and including the separator before the entity id.
    ///
    /// Scripts receive this as an argument and append ids themselves.
    pub fn kind_prefix(&self, namespace: &str, kind: KeyType) -> String {
        format!("{}:{}:{}:{}:", self.prefix, self.version, namespace, kind)
    }

    /// Parse a key produced by this scheme back into its parts.
    pub fn parse<'a>(&self, key: &'a str) -> Option<ParsedKey<'a>> {
        let head = format!("{}:{}:", self.prefix, self.version);
        let rest = key.strip_prefix(head.as_str())?;
        let mut parts = rest.splitn(3, ':');
        let namespace = parts.next()?;
        let kind = parts.next()?;
        let tail = parts.next()?;
        let mut ids = tail.split(':');
        let entity = ids.next()?;
        Some(ParsedKey {
            namespace,
            kind,
            entity,
            sub: ids.collect(),
        })
    }
}

/// The parts of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    /// Namespace segment.
    pub namespace: &'a str,
    /// Key type segment.
    pub kind: &'a str,
    /// Entity id.
    pub entity: &'a str,
    /// Sub ids.
    pub sub: Vec<&'a str>,
}

/// A name that cannot be embedded in a key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid name '{0}': expected lowercase alphanumerics, '_', '-' or '.'")]
pub struct InvalidKeyName(pub String);

/// Normalize and validate a namespace, queue, group or exchange name.
///
/// Names are lowercased. Allowed characters are ASCII alphanumerics, `_`,
/// `-` and `.`; the first character must be alphanumeric.
pub fn validate_name(name: &str) -> Result<String, InvalidKeyName> {
    let normalized = name.trim().to_ascii_lowercase();
    let mut chars = normalized.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(normalized)
    } else {
        Err(InvalidKeyName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        let scheme = KeyScheme::default();
        assert_eq!(
            scheme.key("billing", KeyType::Pending, "invoices", &[]),
            "quiver:1:billing:pending:invoices"
        );
        assert_eq!(
            scheme.key("billing", KeyType::Processing, "invoices", &["c-1"]),
            "quiver:1:billing:processing:invoices:c-1"
        );
        assert_eq!(
            scheme.global(KeyType::Message, "abc"),
            "quiver:1:global:message:abc"
        );
    }

    #[test]
    fn test_kind_prefix_concatenates_to_key() {
        let scheme = KeyScheme::new("app").with_version("7");
        let prefix = scheme.kind_prefix(GLOBAL_NAMESPACE, KeyType::Message);
        assert_eq!(
            format!("{}{}", prefix, "m1"),
            scheme.global(KeyType::Message, "m1")
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let scheme = KeyScheme::default();
        let key = scheme.key("ns", KeyType::Pending, "orders", &["group-a"]);
        let parsed = scheme.parse(&key).unwrap();
        assert_eq!(parsed.namespace, "ns");
        assert_eq!(parsed.kind, "pending");
        assert_eq!(parsed.entity, "orders");
        assert_eq!(parsed.sub, vec!["group-a"]);
        assert!(scheme.parse("other:1:ns:pending:q").is_none());
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("Orders").unwrap(), "orders");
        assert_eq!(validate_name("a.b-c_d9").unwrap(), "a.b-c_d9");
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("colon:sep").is_err());
    }
}
