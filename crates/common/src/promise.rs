//! Correlation/promise table.
//!
//! Matches asynchronous replies back to the call that triggered them: a
//! pending call is a correlation id mapped to a one-shot completion
//! callback, invoked exactly once when a message bearing that correlation
//! id arrives. The table is memory-only and does not survive a restart, so
//! replies for ids this process does not own resolve nothing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Ok,
    Error,
    TimedOut,
}

impl ReceiptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Ok => "ok",
            ReceiptStatus::Error => "error",
            ReceiptStatus::TimedOut => "timed-out",
        }
    }
}

/// The resolved outcome handed to a pending call's callback.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub payload: Value,
    pub headers: Map<String, Value>,
    /// Message id of the reply that resolved the call, when one arrived.
    /// Absent on synthesized receipts (timeouts). Lets a caller correlate a
    /// follow-up message to the reply itself.
    pub message_id: Option<String>,
}

impl Receipt {
    pub fn timed_out() -> Self {
        Self {
            status: ReceiptStatus::TimedOut,
            payload: Value::Null,
            headers: Map::new(),
            message_id: None,
        }
    }
}

type ReplyFn = Box<dyn FnOnce(Receipt) + Send + 'static>;

struct Pending {
    reply: ReplyFn,
    registered_at: Instant,
}

#[derive(Default)]
pub struct PromiseTable {
    pending: HashMap<String, Pending>,
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_call(&mut self, id: &str, reply: impl FnOnce(Receipt) + Send + 'static) {
        self.pending.insert(
            id.to_string(),
            Pending {
                reply: Box::new(reply),
                registered_at: Instant::now(),
            },
        );
    }

    /// Invoke and discard the pending call for `id`. Unknown ids are a
    /// silent no-op. Returns whether a call was resolved.
    pub fn resolve(&mut self, id: &str, receipt: Receipt) -> bool {
        match self.pending.remove(id) {
            Some(pending) => {
                (pending.reply)(receipt);
                true
            }
            None => {
                debug!(correlation_id = id, "reply for unknown call, ignoring");
                false
            }
        }
    }

    /// Resolve every call older than `ttl` as timed out, surfacing the
    /// failure instead of retrying. Returns how many were reaped.
    pub fn reap_expired(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.registered_at) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                debug!(correlation_id = %id, "pending call timed out");
                (pending.reply)(Receipt::timed_out());
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ok_receipt(payload: Value) -> Receipt {
        Receipt {
            status: ReceiptStatus::Ok,
            payload,
            headers: Map::new(),
            message_id: Some("reply-1".into()),
        }
    }

    #[test]
    fn resolves_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut table = PromiseTable::new();
        let counter = calls.clone();
        table.register_call("id-1", move |receipt| {
            assert_eq!(receipt.status, ReceiptStatus::Ok);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(table.resolve("id-1", ok_receipt(Value::Null)));
        assert!(!table.resolve("id-1", ok_receipt(Value::Null)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_id_resolves_nothing() {
        let mut table = PromiseTable::new();
        assert!(!table.resolve("never-registered", ok_receipt(Value::Null)));
    }

    #[test]
    fn reaping_surfaces_timeouts() {
        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = PromiseTable::new();
        let sink = statuses.clone();
        table.register_call("slow", move |receipt| {
            sink.lock().unwrap().push(receipt.status);
        });

        assert_eq!(table.reap_expired(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(table.reap_expired(Duration::from_secs(0)), 1);
        assert_eq!(*statuses.lock().unwrap(), vec![ReceiptStatus::TimedOut]);
        // Reaped entries are gone; a late reply resolves nothing.
        assert!(!table.resolve("slow", ok_receipt(Value::Null)));
    }
}
