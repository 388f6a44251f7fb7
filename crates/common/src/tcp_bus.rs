//! TCP client for an external broker endpoint.
//!
//! Speaks line-delimited JSON frames: `publish` and `subscribe` frames go
//! out, `Delivery` lines come back tagged with the queue id they were bound
//! under. The broker is assumed reliable-enough; a lost connection is
//! surfaced as closed consumer channels and is not retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Bus, BusError, Exchange};
use crate::envelope::Envelope;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame<'a> {
    Publish {
        exchange: &'static str,
        routing_key: &'a str,
        envelope: &'a Envelope,
    },
    Subscribe {
        exchange: &'static str,
        pattern: &'a str,
        queue: &'a str,
    },
}

#[derive(Deserialize)]
struct Delivery {
    queue: String,
    envelope: Envelope,
}

type QueueMap = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

pub struct TcpBus {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    queues: QueueMap,
}

impl TcpBus {
    pub async fn connect(addr: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BusError::Transport(format!("connect {addr}: {e}")))?;
        let (reader, writer) = stream.into_split();
        let queues: QueueMap = Arc::new(StdMutex::new(HashMap::new()));

        tokio::spawn(read_loop(reader, queues.clone()));

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            queues,
        })
    }

    async fn send_frame(&self, frame: &Frame<'_>) -> Result<(), BusError> {
        let line = serde_json::to_string(frame)
            .map_err(|e| BusError::Transport(format!("encode frame: {e}")))?
            + "\n";
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BusError::Transport(format!("broker write: {e}")))
    }
}

async fn read_loop(reader: OwnedReadHalf, queues: QueueMap) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }
                // Malformed lines are fatal only to the single message.
                let delivery: Delivery = match serde_json::from_str(raw) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("discarding unparseable broker line: {e}");
                        continue;
                    }
                };
                let mut map = queues.lock().expect("queue map poisoned");
                match map.get(&delivery.queue) {
                    Some(tx) => {
                        if tx.send(delivery.envelope).is_err() {
                            map.remove(&delivery.queue);
                        }
                    }
                    None => debug!(queue = %delivery.queue, "delivery for unknown queue"),
                }
            }
            Ok(None) => {
                warn!("broker connection closed");
                break;
            }
            Err(e) => {
                warn!("broker read failed: {e}");
                break;
            }
        }
    }
    // Dropping the senders ends every consumer.
    queues.lock().expect("queue map poisoned").clear();
}

#[async_trait]
impl Bus for TcpBus {
    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        self.send_frame(&Frame::Publish {
            exchange: exchange.as_str(),
            routing_key,
            envelope: &envelope,
        })
        .await
    }

    async fn subscribe(
        &self,
        exchange: Exchange,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BusError> {
        let queue = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues
            .lock()
            .expect("queue map poisoned")
            .insert(queue.clone(), tx);
        self.send_frame(&Frame::Subscribe {
            exchange: exchange.as_str(),
            pattern,
            queue: &queue,
        })
        .await?;
        Ok(rx)
    }
}
