//! In-memory connector: every `connect` hands the far end of a fresh pipe to
//! a [`MockListener`], where a test plays the server.

use super::{Connector, Inbound, Link, Outbound, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<MockPeer>,
    refuse_next: AtomicU32,
    stall_next: AtomicU32,
    attempts: Mutex<Vec<(String, Instant)>>,
}

#[derive(Debug)]
pub struct MockListener {
    rx: mpsc::UnboundedReceiver<MockPeer>,
}

/// Server side of one mock link.
#[derive(Debug)]
pub struct MockPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted: tx,
            refuse_next: AtomicU32::new(0),
            stall_next: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, MockListener { rx })
    }

    /// The next `count` connects fail with [`TransportError::Refused`].
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// The next `count` connects never complete.
    pub fn stall_next(&self, count: u32) {
        self.stall_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Link, TransportError> {
        self.attempts.lock().push((url.to_string(), Instant::now()));
        if take_one(&self.refuse_next) {
            return Err(TransportError::Refused);
        }
        if take_one(&self.stall_next) {
            std::future::pending::<()>().await;
        }
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let peer = MockPeer {
            url: url.to_string(),
            to_client: tx_in,
            from_client: rx_out,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Connect("mock listener dropped".into()))?;
        Ok(Link {
            outbound: tx_out,
            inbound: rx_in,
        })
    }
}

impl MockListener {
    pub async fn accept(&mut self) -> Option<MockPeer> {
        self.rx.recv().await
    }
}

impl MockPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Inbound::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Next frame from the client, heartbeats included.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Next JSON text frame, skipping control-channel pings.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.from_client.recv().await? {
                Outbound::Text(text) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if value.get("type").and_then(Value::as_str) == Some("ping") {
                        continue;
                    }
                    return Some(value);
                }
                Outbound::Close { .. } => return None,
            }
        }
    }

    /// Answers a correlated request with the paired response type.
    pub fn reply(&self, request: &Value, response_type: &str, data: Value) -> bool {
        let mut frame = serde_json::json!({
            "type": response_type,
            "status": "success",
            "data": data,
        });
        if let Some(id) = request.get("request_id") {
            frame["request_id"] = id.clone();
        }
        self.send_json(&frame)
    }

    pub fn reply_error(&self, request: &Value, response_type: &str, message: &str) -> bool {
        let mut frame = serde_json::json!({
            "type": response_type,
            "status": "error",
            "message": message,
        });
        if let Some(id) = request.get("request_id") {
            frame["request_id"] = id.clone();
        }
        self.send_json(&frame)
    }
}
