//! Raw text-frame links. The socket client and the execution channel both sit
//! on a [`Connector`], so tests can swap the network for in-memory pipes.

pub mod mock;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Terminal; nothing follows on this link.
    Closed { code: Option<u16>, reason: String },
}

/// One open connection. Dropping `outbound` lets the writer wind down; the
/// inbound side always ends with `Inbound::Closed` or channel closure.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid websocket url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("connection refused")]
    Refused,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// Close codes after which a client should not try to come back.
pub fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(NORMAL_CLOSURE) | Some(GOING_AWAY))
}
