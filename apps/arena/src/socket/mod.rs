//! Correlated request/response client over one control-channel WebSocket.
//!
//! Requests carry a generated correlation id. Responses settle the pending
//! request with the echoed id, or the oldest pending request expecting that
//! response type when the server leaves the id out. Everything else lands on
//! the push bus under its `type`.

mod backoff;
mod pending;

pub use backoff::ReconnectPolicy;

use crate::transport::{Connector, Inbound, NORMAL_CLOSURE, Outbound, is_clean_close};
use arena_bus::{Bus, BusError, LocalBus, PushMessage};
use arena_proto::{
    ControlFrame, ControlRequest, DecodeError, Envelope, RequestKind, ResponseKind, ping_frame,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use pending::PendingTable;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{0}")]
    RequestFailed(String),
    #[error("{request} timed out after {after:?}")]
    RequestTimeout {
        request: &'static str,
        after: Duration,
    },
    #[error("control channel is not connected")]
    NotConnected,
    #[error("control channel disconnected")]
    Disconnected,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(25),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Lifecycle notifications for observers such as the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened { generation: u64 },
    Closed { generation: u64, code: Option<u16> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), SocketError>>>;

enum LinkState {
    Idle,
    Connecting { attempt: u64, future: ConnectAttempt },
    Open(OpenLink),
}

struct OpenLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    heartbeat: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: SocketConfig,
    bus: LocalBus,
    state: Mutex<LinkState>,
    pending: Mutex<PendingTable>,
    next_attempt: AtomicU64,
    reconnect_attempts: AtomicU32,
    reconnect_enabled: AtomicBool,
    events: broadcast::Sender<SocketEvent>,
    /// Handlers installed through `on_message`, one per message type.
    handlers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let LinkState::Open(link) = std::mem::replace(self.state.get_mut(), LinkState::Idle) {
            link.heartbeat.abort();
        }
        for request in self.pending.get_mut().drain() {
            request.discard();
        }
        for (_, handler) in self.handlers.get_mut().drain() {
            handler.abort();
        }
    }
}

#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl SocketClient {
    pub fn new(connector: Arc<dyn Connector>, config: SocketConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                bus: LocalBus::new(),
                state: Mutex::new(LinkState::Idle),
                pending: Mutex::new(PendingTable::default()),
                next_attempt: AtomicU64::new(1),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_enabled: AtomicBool::new(true),
                events,
                handlers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.state.lock(), LinkState::Open(_))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the link if it is not already open. Concurrent callers share one
    /// attempt, so at most one socket exists per client.
    pub async fn connect(&self, url: &str) -> Result<(), SocketError> {
        self.inner.reconnect_enabled.store(true, Ordering::SeqCst);
        establish(&self.inner, url).await
    }

    /// Sends a correlated request and waits for its response data.
    pub async fn send(
        &self,
        request: ControlRequest,
        url: Option<&str>,
    ) -> Result<Value, SocketError> {
        if let Some(url) = url {
            establish(&self.inner, url).await?;
        }
        let outbound = self.outbound().ok_or(SocketError::NotConnected)?;
        let kind = request.kind();
        let request_id = Uuid::new_v4().to_string();
        let text = Envelope::correlated(&request, &request_id).to_text();

        let (reply, rx) = oneshot::channel();
        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.inner),
            request_id.clone(),
            kind,
            self.inner.config.request_timeout,
        ));
        self.inner
            .pending
            .lock()
            .insert(request_id.clone(), kind.response().as_str(), reply, timer);

        if outbound.send(Outbound::Text(text)).is_err() {
            let abandoned = self.inner.pending.lock().take_by_id(&request_id);
            if let Some(request) = abandoned {
                request.discard();
            }
            return Err(SocketError::NotConnected);
        }
        debug!(
            target = "arena::socket",
            request_id = %request_id,
            request = kind.as_str(),
            expects = kind.response().as_str(),
            "request sent"
        );
        rx.await.unwrap_or(Err(SocketError::Disconnected))
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        request: ControlRequest,
        url: Option<&str>,
    ) -> Result<T, SocketError> {
        let data = self.send(request, url).await?;
        serde_json::from_value(data).map_err(|err| SocketError::InvalidResponse(err.to_string()))
    }

    /// Transmits without tracking a reply.
    pub async fn send_one_way(
        &self,
        request: ControlRequest,
        url: Option<&str>,
    ) -> Result<(), SocketError> {
        if let Some(url) = url {
            establish(&self.inner, url).await?;
        }
        let outbound = self.outbound().ok_or(SocketError::NotConnected)?;
        let kind = request.kind();
        outbound
            .send(Outbound::Text(Envelope::one_way(&request).to_text()))
            .map_err(|_| SocketError::NotConnected)?;
        debug!(target = "arena::socket", request = kind.as_str(), "one-way message sent");
        Ok(())
    }

    /// Subscribes to unsolicited frames of `message_type`.
    pub fn subscribe(&self, message_type: &str) -> broadcast::Receiver<PushMessage> {
        self.inner.bus.subscribe(message_type)
    }

    /// Runs `handler` for every unsolicited frame of `message_type` until
    /// [`SocketClient::off_message`] removes it. A second handler for the same
    /// type replaces the first. Other subscribers of the topic are untouched.
    pub fn on_message<F>(&self, message_type: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe(message_type);
        let topic = message_type.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message.payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "arena::socket", topic = %topic, skipped, "push handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let replaced = self
            .inner
            .handlers
            .lock()
            .insert(message_type.to_string(), task);
        if let Some(previous) = replaced {
            previous.abort();
        }
    }

    /// Removes the handler installed by [`SocketClient::on_message`]; false
    /// when there was none.
    pub fn off_message(&self, message_type: &str) -> bool {
        match self.inner.handlers.lock().remove(message_type) {
            Some(handler) => {
                handler.abort();
                true
            }
            None => false,
        }
    }

    /// Closes with a normal-closure code, stops reconnecting and rejects
    /// everything still pending.
    pub fn disconnect(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *self.inner.state.lock(), LinkState::Idle);
        if let LinkState::Open(link) = previous {
            link.heartbeat.abort();
            let _ = link.outbound.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "Normal closure".into(),
            });
            let _ = self.inner.events.send(SocketEvent::Closed {
                generation: link.generation,
                code: Some(NORMAL_CLOSURE),
            });
        }
        let drained = self.inner.pending.lock().drain();
        let rejected = drained.len();
        for request in drained {
            request.settle(Err(SocketError::Disconnected));
        }
        for (_, handler) in self.inner.handlers.lock().drain() {
            handler.abort();
        }
        self.inner.bus.clear();
        info!(target = "arena::socket", rejected, "control channel disconnected");
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Outbound>> {
        match &*self.inner.state.lock() {
            LinkState::Open(link) => Some(link.outbound.clone()),
            _ => None,
        }
    }
}

async fn establish(inner: &Arc<Inner>, url: &str) -> Result<(), SocketError> {
    let future = {
        let mut state = inner.state.lock();
        match &*state {
            LinkState::Open(_) => return Ok(()),
            LinkState::Connecting { future, .. } => future.clone(),
            LinkState::Idle => {
                let attempt = inner.next_attempt.fetch_add(1, Ordering::SeqCst);
                let future = open(Arc::downgrade(inner), url.to_string(), attempt)
                    .boxed()
                    .shared();
                *state = LinkState::Connecting {
                    attempt,
                    future: future.clone(),
                };
                future
            }
        }
    };
    future.await
}

async fn open(weak: Weak<Inner>, url: String, attempt: u64) -> Result<(), SocketError> {
    let Some(inner) = weak.upgrade() else {
        return Err(SocketError::Disconnected);
    };
    let timeout = inner.config.connect_timeout;
    let outcome = tokio::time::timeout(timeout, inner.connector.connect(&url)).await;
    let link = match outcome {
        Ok(Ok(link)) => link,
        Ok(Err(err)) => {
            inner.abandon_attempt(attempt);
            warn!(target = "arena::socket", url = %url, error = %err, "control channel connect failed");
            return Err(SocketError::Connection(err.to_string()));
        }
        Err(_) => {
            inner.abandon_attempt(attempt);
            warn!(target = "arena::socket", url = %url, ?timeout, "control channel connect timed out");
            return Err(SocketError::Connection(format!(
                "timed out after {timeout:?}"
            )));
        }
    };

    let outbound = link.outbound;
    {
        let mut state = inner.state.lock();
        let current = matches!(&*state, LinkState::Connecting { attempt: a, .. } if *a == attempt);
        if !current {
            // disconnected while the handshake was in flight
            let _ = outbound.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "Normal closure".into(),
            });
            return Err(SocketError::Disconnected);
        }
        let heartbeat = tokio::spawn(heartbeat(
            outbound.clone(),
            inner.config.heartbeat_interval,
        ));
        tokio::spawn(read_loop(Arc::downgrade(&inner), link.inbound, attempt, url.clone()));
        *state = LinkState::Open(OpenLink {
            generation: attempt,
            outbound,
            heartbeat,
        });
    }
    inner.reconnect_attempts.store(0, Ordering::SeqCst);
    let _ = inner.events.send(SocketEvent::Opened {
        generation: attempt,
    });
    info!(target = "arena::socket", url = %url, generation = attempt, "control channel open");
    Ok(())
}

async fn heartbeat(outbound: mpsc::UnboundedSender<Outbound>, every: Duration) {
    if every.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(Outbound::Text(ping_frame())).is_err() {
            break;
        }
    }
}

async fn read_loop(
    weak: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    generation: u64,
    url: String,
) {
    let code = loop {
        match inbound.recv().await {
            Some(Inbound::Text(text)) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.dispatch(&text);
            }
            Some(Inbound::Closed { code, reason }) => {
                debug!(target = "arena::socket", ?code, reason = %reason, "control channel closed by peer");
                break code;
            }
            None => break None,
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.handle_close(generation, code, url);
    }
}

async fn expire_after(weak: Weak<Inner>, request_id: String, kind: RequestKind, after: Duration) {
    tokio::time::sleep(after).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let expired = inner.pending.lock().take_by_id(&request_id);
    if let Some(request) = expired {
        warn!(
            target = "arena::socket",
            request_id = %request_id,
            request = kind.as_str(),
            ?after,
            "request timed out"
        );
        request.expire(SocketError::RequestTimeout {
            request: kind.as_str(),
            after,
        });
    }
}

impl Inner {
    fn abandon_attempt(&self, attempt: u64) {
        let mut state = self.state.lock();
        if matches!(&*state, LinkState::Connecting { attempt: a, .. } if *a == attempt) {
            *state = LinkState::Idle;
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match ControlFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                log_decode_failure(text, &err);
                return;
            }
        };
        if frame.kind == ResponseKind::Info {
            debug!(
                target = "arena::socket",
                message = frame.message.as_deref().unwrap_or(""),
                "server info"
            );
            return;
        }

        let matched = {
            let mut pending = self.pending.lock();
            match frame.request_id.as_deref() {
                Some(id) => pending.take_by_id(id),
                None => pending.take_oldest(frame.kind.as_str()),
            }
        };
        if let Some(request) = matched {
            let outcome = if frame.is_error() {
                Err(SocketError::RequestFailed(frame.error_message()))
            } else {
                Ok(frame.data)
            };
            request.settle(outcome);
            return;
        }

        if frame.request_id.is_some() {
            debug!(
                target = "arena::socket",
                request_id = frame.request_id.as_deref().unwrap_or(""),
                kind = frame.kind.as_str(),
                "response for unknown or expired request"
            );
        }
        let topic = frame.kind.as_str();
        let payload = if frame.is_error() {
            serde_json::json!({ "message": frame.error_message(), "data": frame.data })
        } else {
            frame.data
        };
        match self.bus.publish(topic, payload) {
            Ok(delivered) => {
                debug!(target = "arena::socket", topic, delivered, "push message published")
            }
            Err(BusError::NoSubscribers(_)) => {
                debug!(target = "arena::socket", topic, "push message had no subscribers")
            }
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>, url: String) {
        {
            let mut state = self.state.lock();
            match &*state {
                LinkState::Open(link) if link.generation == generation => {
                    link.heartbeat.abort();
                    *state = LinkState::Idle;
                }
                _ => return,
            }
        }
        let _ = self.events.send(SocketEvent::Closed { generation, code });
        if is_clean_close(code) || !self.reconnect_enabled.load(Ordering::SeqCst) {
            info!(target = "arena::socket", ?code, "control channel closed");
            return;
        }
        warn!(target = "arena::socket", ?code, "control channel closed abnormally");
        self.schedule_reconnect(url);
    }

    fn schedule_reconnect(self: &Arc<Self>, url: String) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(delay) = self.config.reconnect.delay_for(attempt) else {
            self.reconnect_attempts
                .store(self.config.reconnect.max_attempts, Ordering::SeqCst);
            error!(
                target = "arena::socket",
                attempts = self.config.reconnect.max_attempts,
                "exhausted reconnect attempts"
            );
            let _ = self.events.send(SocketEvent::ReconnectExhausted {
                attempts: self.config.reconnect.max_attempts,
            });
            return;
        };
        let _ = self
            .events
            .send(SocketEvent::ReconnectScheduled { attempt, delay });
        info!(target = "arena::socket", attempt, ?delay, "reconnect scheduled");

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.reconnect_enabled.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = establish(&inner, &url).await {
                warn!(target = "arena::socket", attempt, error = %err, "reconnect attempt failed");
                if inner.reconnect_enabled.load(Ordering::SeqCst) {
                    inner.schedule_reconnect(url);
                }
            }
        });
    }
}

fn log_decode_failure(text: &str, err: &DecodeError) {
    let preview: String = text.chars().take(120).collect();
    warn!(target = "arena::socket", error = %err, frame = %preview, "dropping undecodable frame");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockListener, MockPeer};
    use serde_json::json;

    const URL: &str = "ws://lab.test/fs/lab-1";

    fn client_with(config: SocketConfig) -> (SocketClient, Arc<MockConnector>, MockListener) {
        let (connector, listener) = MockConnector::new();
        let client = SocketClient::new(connector.clone(), config);
        (client, connector, listener)
    }

    async fn connected(config: SocketConfig) -> (SocketClient, Arc<MockConnector>, MockListener, MockPeer) {
        let (client, connector, mut listener) = client_with(config);
        client.connect(URL).await.unwrap();
        let peer = listener.accept().await.unwrap();
        (client, connector, listener, peer)
    }

    fn fetch(path: &str) -> ControlRequest {
        ControlRequest::FetchFileContent { path: path.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_socket() {
        let (client, connector, mut listener) = client_with(SocketConfig::default());
        let (a, b, c) = tokio::join!(client.connect(URL), client.connect(URL), client.connect(URL));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        let _peer = listener.accept().await.unwrap();
        assert_eq!(connector.attempt_count(), 1);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_with_connection_error() {
        let (client, connector, _listener) = client_with(SocketConfig::default());
        connector.stall_next(1);
        let err = client.connect(URL).await.unwrap_err();
        assert!(matches!(err, SocketError::Connection(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn permuted_responses_settle_each_request_once() {
        let (client, _connector, _listener, mut peer) = connected(SocketConfig::default()).await;
        let paths = ["a.txt", "b.txt", "c.txt", "d.txt"];
        let mut calls = Vec::new();
        for path in paths {
            let client = client.clone();
            calls.push(tokio::spawn(async move { client.send(fetch(path), None).await }));
        }
        let mut requests = Vec::new();
        for _ in paths {
            requests.push(peer.recv_json().await.unwrap());
        }
        for index in [2usize, 0, 3, 1] {
            let request = &requests[index];
            let path = request["payload"]["path"].clone();
            peer.reply(request, "file_content", json!({ "path": path, "content": path }));
        }
        for (call, path) in calls.into_iter().zip(paths) {
            let data = call.await.unwrap().unwrap();
            assert_eq!(data["content"], path);
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ids_fall_back_to_fifo_per_type() {
        let (client, _connector, _listener, mut peer) = connected(SocketConfig::default()).await;
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.send(fetch("first"), None).await }
        });
        peer.recv_json().await.unwrap();
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.send(fetch("second"), None).await }
        });
        peer.recv_json().await.unwrap();

        for content in ["one", "two"] {
            peer.send_json(&json!({"type": "file_content", "status": "success", "data": {"content": content}}));
        }
        assert_eq!(first.await.unwrap().unwrap()["content"], "one");
        assert_eq!(second.await.unwrap().unwrap()["content"], "two");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_once_and_late_reply_is_ignored() {
        let config = SocketConfig {
            request_timeout: Duration::from_secs(8),
            ..SocketConfig::default()
        };
        let (client, _connector, _listener, mut peer) = connected(config).await;
        let mut pushes = client.subscribe("file_content");
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send(fetch("slow.txt"), None).await }
        });
        let request = peer.recv_json().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SocketError::RequestTimeout { request: "fs_fetch_file_content", .. }));
        assert_eq!(client.pending_count(), 0);

        peer.reply(&request, "file_content", json!({"content": "late"}));
        let stale = pushes.recv().await.unwrap();
        assert_eq!(stale.payload["content"], "late");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_status_rejects_with_server_message() {
        let (client, _connector, _listener, mut peer) = connected(SocketConfig::default()).await;
        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(ControlRequest::DeleteFile { path: "x".into() }, None)
                    .await
            }
        });
        let request = peer.recv_json().await.unwrap();
        peer.reply_error(&request, "file_deleted", "no such file");
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            SocketError::RequestFailed("no such file".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_frames_reach_handlers() {
        let (client, _connector, _listener, peer) = connected(SocketConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on_message("quest_meta", move |payload| {
            let _ = tx.send(payload);
        });
        peer.send_json(&json!({"type": "quest_meta", "status": "success", "data": {"files": []}}));
        assert_eq!(rx.recv().await.unwrap(), json!({"files": []}));
        assert!(client.off_message("quest_meta"));
        assert!(!client.off_message("quest_meta"));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_handler_keeps_other_subscribers() {
        let (client, _connector, _listener, peer) = connected(SocketConfig::default()).await;
        let mut internal = client.subscribe("file_updated");
        let (tx, mut handled) = mpsc::unbounded_channel();
        client.on_message("file_updated", move |payload| {
            let _ = tx.send(payload);
        });
        assert!(client.off_message("file_updated"));
        tokio::task::yield_now().await;

        let push = json!({"type": "file_updated", "status": "success", "data": {"path": "a.js", "success": true}});
        peer.send_json(&push);
        let message = internal.recv().await.unwrap();
        assert_eq!(message.payload["path"], "a.js");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handled.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn second_handler_replaces_the_first() {
        let (client, _connector, _listener, peer) = connected(SocketConfig::default()).await;
        let (first_tx, mut first) = mpsc::unbounded_channel();
        let (second_tx, mut second) = mpsc::unbounded_channel();
        client.on_message("quest_meta", move |payload| {
            let _ = first_tx.send(payload);
        });
        client.on_message("quest_meta", move |payload| {
            let _ = second_tx.send(payload);
        });
        peer.send_json(&json!({"type": "quest_meta", "status": "success", "data": {"files": []}}));
        assert_eq!(second.recv().await.unwrap(), json!({"files": []}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(first.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_way_send_has_no_correlation() {
        let (client, _connector, _listener, mut peer) = connected(SocketConfig::default()).await;
        client
            .send_one_way(
                ControlRequest::UpdateFileContent {
                    path: "a.js".into(),
                    content: "x".into(),
                },
                None,
            )
            .await
            .unwrap();
        let frame = peer.recv_json().await.unwrap();
        assert_eq!(frame["type"], "fs_file_content_update");
        assert!(frame.get("request_id").is_none());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_on_interval() {
        let config = SocketConfig {
            heartbeat_interval: Duration::from_secs(5),
            ..SocketConfig::default()
        };
        let (_client, _connector, _listener, mut peer) = connected(config).await;
        let started = tokio::time::Instant::now();
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame, Outbound::Text(json!({"type": "ping"}).to_string()));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_backs_off_and_resets_after_open() {
        let config = SocketConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(300),
                max_delay: Duration::from_secs(1),
                max_attempts: 10,
            },
            ..SocketConfig::default()
        };
        let (client, connector, mut listener, peer) = connected(config).await;
        let mut events = client.events();
        connector.refuse_next(3);
        peer.close(1006);

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                SocketEvent::ReconnectScheduled { delay, .. } => delays.push(delay),
                SocketEvent::Opened { .. } => break,
                _ => {}
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(300),
                Duration::from_millis(600),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(client.reconnect_attempts(), 0);
        let peer = listener.accept().await.unwrap();

        peer.close(1006);
        loop {
            if let SocketEvent::ReconnectScheduled { attempt, delay } = events.recv().await.unwrap() {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(300));
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_does_not_reconnect() {
        let (client, connector, _listener, peer) = connected(SocketConfig::default()).await;
        let mut events = client.events();
        peer.close(1000);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            events.try_recv().unwrap(),
            SocketEvent::Closed {
                generation: 1,
                code: Some(1000)
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(connector.attempt_count(), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_rejects_pending_and_closes_normally() {
        let (client, connector, _listener, mut peer) = connected(SocketConfig::default()).await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.send(fetch("a"), None).await }
        });
        peer.recv_json().await.unwrap();
        client.disconnect();
        assert_eq!(call.await.unwrap().unwrap_err(), SocketError::Disconnected);
        assert_eq!(
            peer.recv().await.unwrap(),
            Outbound::Close {
                code: 1000,
                reason: "Normal closure".into()
            }
        );
        peer.close(1006);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(client.pending_count(), 0);
    }
}
