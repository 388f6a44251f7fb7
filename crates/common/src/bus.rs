//! Bus contract.
//!
//! The broker itself is an external collaborator: a topic-routed,
//! pattern-matchable publish/subscribe transport with at-least-once,
//! ordered-per-queue delivery. The control plane only depends on the
//! [`Bus`] trait. [`MemoryBus`] is the in-process implementation used by
//! tests and single-process development mode; a TCP client for an external
//! broker endpoint lives in [`crate::tcp_bus`].

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::{topic_matches, Envelope};

/// The two exchanges the control plane uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// Topic exchange carrying directives and commands; routing-key wildcard
    /// matching (`workers.#`, `managers.#`).
    Backend,
    /// Direct exchange carrying console output; exact routing-key match.
    Stdout,
}

impl Exchange {
    pub fn as_str(self) -> &'static str {
        match self {
            Exchange::Backend => "backend",
            Exchange::Stdout => "stdout",
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport: {0}")]
    Transport(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BusError>;

    /// Bind a fresh queue to `exchange` with `pattern` and return its
    /// consumer side. Topic bindings use wildcard matching, direct bindings
    /// exact match.
    async fn subscribe(
        &self,
        exchange: Exchange,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BusError>;
}

struct Binding {
    pattern: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// In-process bus with the same exchange semantics as the real broker.
#[derive(Default)]
pub struct MemoryBus {
    topic: Mutex<Vec<Binding>>,
    direct: Mutex<Vec<Binding>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self, exchange: Exchange) -> &Mutex<Vec<Binding>> {
        match exchange {
            Exchange::Backend => &self.topic,
            Exchange::Stdout => &self.direct,
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        let mut delivered = 0usize;
        let mut bindings = self
            .bindings(exchange)
            .lock()
            .expect("bus bindings poisoned");
        bindings.retain(|b| {
            let matches = match exchange {
                Exchange::Backend => topic_matches(&b.pattern, routing_key),
                Exchange::Stdout => b.pattern == routing_key,
            };
            if !matches {
                return true;
            }
            match b.tx.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Consumer went away; drop the binding.
                Err(_) => false,
            }
        });
        if delivered == 0 {
            debug!(
                exchange = exchange.as_str(),
                routing_key, "no binding matched, message dropped"
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        exchange: Exchange,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bindings(exchange)
            .lock()
            .expect("bus bindings poisoned")
            .push(Binding {
                pattern: pattern.to_string(),
                tx,
            });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use serde_json::json;

    #[tokio::test]
    async fn topic_routing_reaches_wildcard_binding() {
        let bus = MemoryBus::new();
        let mut workers = bus.subscribe(Exchange::Backend, "workers.#").await.unwrap();
        let mut managers = bus
            .subscribe(Exchange::Backend, "managers.#")
            .await
            .unwrap();

        let env = Envelope::new(MessageKind::Directive, "workers.h1.p1", json!({"n": 1}));
        bus.publish(Exchange::Backend, "workers.h1.p1", env)
            .await
            .unwrap();

        let got = workers.recv().await.unwrap();
        assert_eq!(got.routing_key, "workers.h1.p1");
        assert!(managers.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_key_hits_zero_segment_wildcard() {
        let bus = MemoryBus::new();
        let mut workers = bus.subscribe(Exchange::Backend, "workers.#").await.unwrap();
        let env = Envelope::new(MessageKind::Init, "workers", json!({}));
        bus.publish(Exchange::Backend, "workers", env).await.unwrap();
        assert!(workers.recv().await.is_some());
    }

    #[tokio::test]
    async fn direct_exchange_is_exact() {
        let bus = MemoryBus::new();
        let mut out = bus.subscribe(Exchange::Stdout, "stdout").await.unwrap();
        bus.publish(
            Exchange::Stdout,
            "stdout",
            Envelope::new(MessageKind::Receipt, "stdout", json!("line")),
        )
        .await
        .unwrap();
        bus.publish(
            Exchange::Stdout,
            "stdout.other",
            Envelope::new(MessageKind::Receipt, "stdout.other", json!("miss")),
        )
        .await
        .unwrap();
        assert_eq!(out.recv().await.unwrap().payload, json!("line"));
        assert!(out.try_recv().is_err());
    }
}
