//! Message envelope and addressing.
//!
//! Every message on the bus is an [`Envelope`]: a routing key, a message kind,
//! a fresh message id (the correlation seed), an optional correlation id
//! echoing the message being answered, a timestamp and an open header map.
//! Routing keys are dot-separated and hierarchical: `workers.<host>.<pool>`,
//! `managers.<host>`, or the literal `hq`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ControlError;

/// Wire-level message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "directive")]
    Directive,
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "receipt")]
    Receipt,
    #[serde(rename = "receipt.directive")]
    ReceiptDirective,
    #[serde(rename = "receipt.command")]
    ReceiptCommand,
}

impl MessageKind {
    pub fn is_receipt(self) -> bool {
        matches!(
            self,
            MessageKind::Receipt | MessageKind::ReceiptDirective | MessageKind::ReceiptCommand
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub routing_key: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: u64,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an originating message with a fresh id and no correlation.
    pub fn new(kind: MessageKind, routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            kind,
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            timestamp: now_ts(),
            headers: Map::new(),
            payload,
        }
    }

    /// Build a receipt answering this message, addressed back to HQ.
    ///
    /// The reply copies this message's id into `correlation_id` so the
    /// promise table on the other end can match it.
    pub fn reply(&self, kind: MessageKind, payload: Value) -> Envelope {
        let mut reply = Envelope::new(kind, HQ_KEY, payload);
        reply.correlation_id = Some(self.message_id.clone());
        reply
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }
}

pub const HQ_KEY: &str = "hq";
pub const WORKERS_TOPIC: &str = "workers";
pub const MANAGERS_TOPIC: &str = "managers";
/// Routing key console lines are published under on the direct exchange;
/// the originating server fqdn rides in the `server` header.
pub const STDOUT_KEY: &str = "stdout";

/// A parsed, validated routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Hq,
    Manager { host: String },
    Worker { host: String, pool: String },
}

impl RoutingKey {
    /// Parse and normalize a dotted routing key.
    ///
    /// Segments are lowercased; empty segments and unknown prefixes fail
    /// with a validation error.
    pub fn parse(raw: &str) -> Result<Self, ControlError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.iter().any(|s| s.is_empty() || s.contains(char::is_whitespace)) {
            return Err(ControlError::Validation(format!(
                "malformed routing key '{raw}'"
            )));
        }
        match segments.as_slice() {
            [k] if k.eq_ignore_ascii_case(HQ_KEY) => Ok(RoutingKey::Hq),
            [p, host] if p.eq_ignore_ascii_case(MANAGERS_TOPIC) => Ok(RoutingKey::Manager {
                host: host.to_ascii_lowercase(),
            }),
            [p, host, pool] if p.eq_ignore_ascii_case(WORKERS_TOPIC) => Ok(RoutingKey::Worker {
                host: host.to_ascii_lowercase(),
                pool: pool.to_ascii_lowercase(),
            }),
            _ => Err(ControlError::Validation(format!(
                "unroutable key '{raw}'"
            ))),
        }
    }

    pub fn manager(host: &str) -> Self {
        RoutingKey::Manager {
            host: host.to_ascii_lowercase(),
        }
    }

    pub fn worker(host: &str, pool: &str) -> Self {
        RoutingKey::Worker {
            host: host.to_ascii_lowercase(),
            pool: pool.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Hq => f.write_str(HQ_KEY),
            RoutingKey::Manager { host } => write!(f, "{MANAGERS_TOPIC}.{host}"),
            RoutingKey::Worker { host, pool } => write!(f, "{WORKERS_TOPIC}.{host}.{pool}"),
        }
    }
}

/// Topic-exchange pattern matching.
///
/// `*` matches exactly one dot segment, `#` matches zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_at(&pat, &key)
}

fn matches_at(pat: &[&str], key: &[&str]) -> bool {
    match pat.first() {
        None => key.is_empty(),
        Some(&"#") => {
            // `#` absorbs zero or more leading segments of the key.
            (0..=key.len()).any(|skip| matches_at(&pat[1..], &key[skip..]))
        }
        Some(&"*") => !key.is_empty() && matches_at(&pat[1..], &key[1..]),
        Some(seg) => key.first() == Some(seg) && matches_at(&pat[1..], &key[1..]),
    }
}

static POOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_[a-z]+(-[a-z]+)*-[0-9]+$").expect("pool name regex"));

/// Whether `name` matches the fixed pool-account naming pattern: a leading
/// underscore, lowercase letter groups separated by hyphens, and a numeric
/// suffix. Direct server commands whose target matches this pattern are
/// rejected so a pool account can never be addressed as if it were a server.
pub fn is_pool_name(name: &str) -> bool {
    POOL_NAME_RE.is_match(name)
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_round_trip() {
        let key = RoutingKey::parse("workers.Host1.poolA").unwrap();
        assert_eq!(
            key,
            RoutingKey::Worker {
                host: "host1".into(),
                pool: "poola".into()
            }
        );
        assert_eq!(key.to_string(), "workers.host1.poola");

        assert_eq!(RoutingKey::parse("hq").unwrap(), RoutingKey::Hq);
        assert_eq!(
            RoutingKey::parse("managers.h2").unwrap().to_string(),
            "managers.h2"
        );
    }

    #[test]
    fn malformed_keys_rejected() {
        for raw in ["", "workers", "workers.h", "managers.h.p", "hq.extra", "workers..p", "who.h.p"] {
            assert!(RoutingKey::parse(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("workers.#", "workers"));
        assert!(topic_matches("workers.#", "workers.h1.p1"));
        assert!(topic_matches("managers.#", "managers.h1"));
        assert!(!topic_matches("managers.#", "workers.h1.p1"));
        assert!(topic_matches("workers.*.p1", "workers.h1.p1"));
        assert!(!topic_matches("workers.*", "workers.h1.p1"));
        assert!(topic_matches("hq", "hq"));
        assert!(!topic_matches("hq", "workers"));
    }

    #[test]
    fn pool_name_pattern() {
        assert!(is_pool_name("_alpha-0"));
        assert!(is_pool_name("_north-field-12"));
        assert!(!is_pool_name("alpha-0"));
        assert!(!is_pool_name("_Alpha-0"));
        assert!(!is_pool_name("_alpha"));
        assert!(!is_pool_name("_alpha-"));
        assert!(!is_pool_name("myserver"));
    }

    #[test]
    fn reply_correlates() {
        let req = Envelope::new(MessageKind::Directive, "managers.h1", serde_json::json!({}));
        let rep = req.reply(MessageKind::ReceiptDirective, serde_json::json!({"ok": true}));
        assert_eq!(rep.correlation_id.as_deref(), Some(req.message_id.as_str()));
        assert_eq!(rep.routing_key, "hq");
        assert_ne!(rep.message_id, req.message_id);
    }

    #[test]
    fn kind_wire_names() {
        let e = Envelope::new(MessageKind::ReceiptDirective, "hq", Value::Null);
        let wire = serde_json::to_value(&e).unwrap();
        assert_eq!(wire["type"], "receipt.directive");
    }
}
