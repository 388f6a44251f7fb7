//! Operator-facing Unix socket.
//!
//! One line-delimited JSON session per connection: an HMAC-authenticated
//! hello line establishes the operator's identity, then request lines flow
//! in and receipts/console lines stream back. Richer front-ends (HTTP,
//! WebSocket) sit outside this daemon and speak the same shapes.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::router::Router;

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
struct Hello {
    user: String,
    ts: u64,
    nonce: String,
    hmac: String,
}

/// Sign a hello body the way clients must: HMAC-SHA256 over
/// `user|ts|nonce`, base64-encoded.
pub fn sign_hello(secret: &str, user: &str, ts: u64, nonce: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{user}|{ts}|{nonce}").as_bytes());
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn verify_hello(secret: &str, hello: &Hello) -> bool {
    let expected = sign_hello(secret, &hello.user, hello.ts, &hello.nonce);
    expected == hello.hmac
}

pub async fn serve(listener: UnixListener, router: Arc<Router>, secret: String) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await.context("operator accept")?;
        let router = router.clone();
        let secret = secret.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, router, secret).await {
                debug!("operator connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    router: Arc<Router>,
    secret: String,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // First line must be the authenticated hello.
    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let hello: Hello = match serde_json::from_str(first.trim()) {
        Ok(h) => h,
        Err(e) => {
            warn!("rejecting operator with malformed hello: {e}");
            return Ok(());
        }
    };
    if !verify_hello(&secret, &hello) {
        warn!(user = %hello.user, "rejecting operator with invalid hello signature");
        return Ok(());
    }

    let (session_id, mut rx) = router.attach_session(&hello.user).await;
    let ack = serde_json::to_string(&json!({ "type": "hello", "ok": true, "user": hello.user }))?;
    writer.write_all(format!("{ack}\n").as_bytes()).await?;

    // Pump receipts and console lines back to the socket.
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let Ok(line) = serde_json::to_string(&reply) else {
                continue;
            };
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        // A malformed request line is fatal only to itself.
        let request: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %session_id, "discarding unparseable request: {e}");
                continue;
            }
        };
        router.handle_request(&session_id, request).await;
    }

    info!(session = %session_id, "operator disconnected");
    router.detach_session(&session_id).await;
    writer_task.abort();
    Ok(())
}
