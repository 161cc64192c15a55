//! PTY execution channel: terminal I/O, project runs and one-at-a-time
//! checkpoint tests.
//!
//! A test is correlated only by being the single one in flight, so a second
//! request while one is running is refused rather than queued.

mod results;

pub use results::ResultLog;

use crate::transport::{Connector, Inbound, NORMAL_CLOSURE, Outbound};
use arena_proto::{CheckpointResult, DecodeError, ExecCommand, ExecEvent, ExecFrame};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("execution channel is not connected")]
    NotReady,
    #[error("a checkpoint test is already running")]
    Busy,
    #[error("test failed: {0}")]
    TestFailed(String),
    #[error("test timed out after {0:?}")]
    TestTimeout(Duration),
    #[error("execution channel closed")]
    ChannelClosed,
    #[error("execution channel connect failed: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecConfig {
    pub connect_timeout: Duration,
    pub test_timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            test_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Project run progress as reported by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub installing: bool,
    pub running: bool,
    pub step: Option<String>,
    pub server_url: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSnapshot {
    pub state: ChannelState,
    pub testing_checkpoint: Option<String>,
    pub is_running_tests: bool,
    pub results: Vec<CheckpointResult>,
    pub current_checkpoint: Option<u32>,
    pub run: RunStatus,
    pub last_error: Option<String>,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ExecError>>>;

enum LinkState {
    Idle,
    Connecting {
        generation: u64,
        future: ConnectAttempt,
    },
    Open {
        generation: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
}

struct InFlightTest {
    token: u64,
    checkpoint_id: String,
    reply: oneshot::Sender<Result<(), ExecError>>,
    timer: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    url: String,
    config: ExecConfig,
    link: Mutex<LinkState>,
    test: Mutex<Option<InFlightTest>>,
    results: Mutex<ResultLog>,
    snapshot: watch::Sender<ExecSnapshot>,
    output: broadcast::Sender<String>,
    next_generation: AtomicU64,
    next_token: AtomicU64,
}

#[derive(Clone)]
pub struct ExecChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel")
            .field("url", &self.inner.url)
            .field("state", &self.inner.snapshot.borrow().state)
            .finish()
    }
}

impl ExecChannel {
    pub fn new(connector: Arc<dyn Connector>, url: impl Into<String>, config: ExecConfig) -> Self {
        let (snapshot, _) = watch::channel(ExecSnapshot::default());
        let (output, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                connector,
                url: url.into(),
                config,
                link: Mutex::new(LinkState::Idle),
                test: Mutex::new(None),
                results: Mutex::new(ResultLog::default()),
                snapshot,
                output,
                next_generation: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ExecSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Raw terminal output, in arrival order.
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.inner.output.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.link.lock(), LinkState::Open { .. })
    }

    pub fn latest_result(&self, checkpoint_id: &str) -> Option<CheckpointResult> {
        self.inner.results.lock().latest(checkpoint_id).cloned()
    }

    pub async fn connect(&self) -> Result<(), ExecError> {
        let future = {
            let mut link = self.inner.link.lock();
            match &*link {
                LinkState::Open { .. } => return Ok(()),
                LinkState::Connecting { future, .. } => future.clone(),
                LinkState::Idle => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let future = open(Arc::downgrade(&self.inner), generation).boxed().shared();
                    *link = LinkState::Connecting {
                        generation,
                        future: future.clone(),
                    };
                    // published under the link lock so it cannot land after `Connected`
                    self.inner.snapshot.send_if_modified(|snap| {
                        set_if_changed(&mut snap.state, ChannelState::Connecting)
                    });
                    future
                }
            }
        };
        future.await
    }

    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.link.lock(), LinkState::Idle);
        if let LinkState::Open { outbound, .. } = previous {
            let _ = outbound.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "Normal closure".into(),
            });
        }
        self.inner.settle_test(None, Err(ExecError::ChannelClosed));
        self.inner
            .snapshot
            .send_modify(|snap| snap.state = ChannelState::Disconnected);
        info!(target = "arena::exec", "execution channel disconnected");
    }

    pub fn write(&self, data: &str) -> Result<(), ExecError> {
        self.inner.transmit(&ExecCommand::Input(data.to_string()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.inner.transmit(&ExecCommand::Resize { cols, rows })
    }

    pub fn kill_processes(&self) -> Result<(), ExecError> {
        self.inner.transmit(&ExecCommand::KillUserProcesses)
    }

    pub fn run_project(&self, init_commands: &[String], run_command: &str) -> Result<(), ExecError> {
        self.inner.transmit(&ExecCommand::Run {
            init_commands: init_commands.to_vec(),
            run_command: run_command.to_string(),
        })?;
        self.inner.snapshot.send_modify(|snap| {
            snap.run = RunStatus {
                installing: true,
                running: true,
                step: Some("initializing".into()),
                ..RunStatus::default()
            };
        });
        info!(target = "arena::exec", run_command = %run_command, init = init_commands.len(), "project run requested");
        Ok(())
    }

    /// Starts a checkpoint test and waits for its terminating event. The
    /// timeout runs on its own task, so it fires even if this future is
    /// dropped.
    pub async fn run_checkpoint_test(
        &self,
        checkpoint_id: &str,
        language: &str,
    ) -> Result<(), ExecError> {
        let outbound = self.inner.outbound().ok_or(ExecError::NotReady)?;
        let (reply, rx) = oneshot::channel();
        let token = {
            let mut slot = self.inner.test.lock();
            if slot.is_some() {
                return Err(ExecError::Busy);
            }
            let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
            let timer = tokio::spawn(expire_test(
                Arc::downgrade(&self.inner),
                token,
                self.inner.config.test_timeout,
            ));
            *slot = Some(InFlightTest {
                token,
                checkpoint_id: checkpoint_id.to_string(),
                reply,
                timer,
            });
            token
        };
        self.inner.snapshot.send_modify(|snap| {
            snap.is_running_tests = true;
            snap.testing_checkpoint = Some(checkpoint_id.to_string());
            snap.last_error = None;
        });

        let command = ExecCommand::CheckpointTest {
            checkpoint_id: checkpoint_id.to_string(),
            language: language.to_string(),
        };
        if outbound.send(Outbound::Text(command.to_text())).is_err() {
            self.inner.settle_test(Some(token), Err(ExecError::ChannelClosed));
        } else {
            info!(target = "arena::exec", checkpoint = %checkpoint_id, language = %language, "checkpoint test started");
        }
        rx.await.unwrap_or(Err(ExecError::ChannelClosed))
    }

    /// Seeds the result log with history fetched from the provisioning API.
    pub fn hydrate_results(&self, history: Vec<CheckpointResult>, active_checkpoint: Option<u32>) {
        let entries = {
            let mut log = self.inner.results.lock();
            log.hydrate(history);
            log.entries()
        };
        self.inner.snapshot.send_modify(|snap| {
            snap.results = entries;
            if active_checkpoint.is_some() {
                snap.current_checkpoint = active_checkpoint;
            }
        });
    }
}

fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

async fn open(weak: Weak<Inner>, generation: u64) -> Result<(), ExecError> {
    let Some(inner) = weak.upgrade() else {
        return Err(ExecError::ChannelClosed);
    };
    let timeout = inner.config.connect_timeout;
    let link = match tokio::time::timeout(timeout, inner.connector.connect(&inner.url)).await {
        Ok(Ok(link)) => link,
        Ok(Err(err)) => return Err(inner.connect_failed(generation, err.to_string())),
        Err(_) => {
            return Err(inner.connect_failed(generation, format!("timed out after {timeout:?}")));
        }
    };

    let outbound = link.outbound;
    {
        let mut state = inner.link.lock();
        let current =
            matches!(&*state, LinkState::Connecting { generation: g, .. } if *g == generation);
        if !current {
            let _ = outbound.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "Normal closure".into(),
            });
            return Err(ExecError::ChannelClosed);
        }
        let _ = outbound.send(Outbound::Text(ExecCommand::Heartbeat.to_text()));
        tokio::spawn(read_loop(Arc::downgrade(&inner), link.inbound, generation));
        *state = LinkState::Open {
            generation,
            outbound,
        };
    }
    inner.snapshot.send_modify(|snap| {
        snap.state = ChannelState::Connected;
        snap.last_error = None;
    });
    info!(target = "arena::exec", url = %inner.url, generation, "execution channel open");
    Ok(())
}

async fn read_loop(weak: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<Inbound>, generation: u64) {
    let code = loop {
        match inbound.recv().await {
            Some(Inbound::Text(text)) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.dispatch(&text);
            }
            Some(Inbound::Closed { code, .. }) => break code,
            None => break None,
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.handle_close(generation, code);
    }
}

async fn expire_test(weak: Weak<Inner>, token: u64, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(inner) = weak.upgrade() {
        inner.settle_test(Some(token), Err(ExecError::TestTimeout(after)));
    }
}

impl Inner {
    fn outbound(&self) -> Option<mpsc::UnboundedSender<Outbound>> {
        match &*self.link.lock() {
            LinkState::Open { outbound, .. } => Some(outbound.clone()),
            _ => None,
        }
    }

    fn transmit(&self, command: &ExecCommand) -> Result<(), ExecError> {
        let outbound = self.outbound().ok_or(ExecError::NotReady)?;
        outbound
            .send(Outbound::Text(command.to_text()))
            .map_err(|_| ExecError::NotReady)
    }

    fn connect_failed(&self, generation: u64, reason: String) -> ExecError {
        {
            let mut state = self.link.lock();
            if matches!(&*state, LinkState::Connecting { generation: g, .. } if *g == generation) {
                *state = LinkState::Idle;
            }
        }
        self.snapshot.send_modify(|snap| {
            snap.state = ChannelState::Disconnected;
            snap.last_error = Some(reason.clone());
        });
        warn!(target = "arena::exec", url = %self.url, reason = %reason, "execution channel connect failed");
        ExecError::Connection(reason)
    }

    fn handle_close(&self, generation: u64, code: Option<u16>) {
        {
            let mut state = self.link.lock();
            match &*state {
                LinkState::Open { generation: g, .. } if *g == generation => *state = LinkState::Idle,
                _ => return,
            }
        }
        self.settle_test(None, Err(ExecError::ChannelClosed));
        self.snapshot
            .send_modify(|snap| snap.state = ChannelState::Disconnected);
        warn!(target = "arena::exec", ?code, "execution channel closed");
    }

    /// Resolves the in-flight test. A `token` restricts settlement to that
    /// particular test so a stale timer cannot end a newer one.
    fn settle_test(&self, token: Option<u64>, outcome: Result<(), ExecError>) {
        let taken = {
            let mut slot = self.test.lock();
            match (&*slot, token) {
                (Some(test), Some(token)) if test.token != token => None,
                _ => slot.take(),
            }
        };
        let Some(test) = taken else {
            return;
        };
        test.timer.abort();
        if let Err(err) = &outcome {
            warn!(target = "arena::exec", checkpoint = %test.checkpoint_id, error = %err, "checkpoint test ended");
        }
        let message = outcome.as_ref().err().map(ToString::to_string);
        self.snapshot.send_modify(|snap| {
            snap.is_running_tests = false;
            snap.testing_checkpoint = None;
            if let Some(message) = message {
                snap.last_error = Some(message);
            }
        });
        let _ = test.reply.send(outcome);
    }

    fn dispatch(&self, text: &str) {
        let frame = match ExecFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target = "arena::exec", error = %err, "dropping malformed execution frame");
                // a terminating frame ends the test even when its body is unreadable
                if let DecodeError::Malformed {
                    kind: "test_completed" | "test_error",
                    ..
                } = &err
                {
                    self.settle_test(None, Err(ExecError::TestFailed(err.to_string())));
                }
                return;
            }
        };
        let event = match frame {
            ExecFrame::Output(data) => {
                let _ = self.output.send(data);
                return;
            }
            ExecFrame::Event(event) => event,
        };
        match event {
            ExecEvent::TestStarted { checkpoint_id } => {
                debug!(target = "arena::exec", checkpoint = ?checkpoint_id, "test started");
                self.snapshot.send_modify(|snap| {
                    snap.is_running_tests = true;
                    if checkpoint_id.is_some() {
                        snap.testing_checkpoint = checkpoint_id;
                    }
                    snap.last_error = None;
                });
            }
            ExecEvent::TestProgress(progress) => {
                debug!(target = "arena::exec", progress = %progress, "test progress");
            }
            ExecEvent::TestCompleted {
                results,
                active_checkpoint,
            } => {
                let count = results.len();
                let entries = {
                    let mut log = self.results.lock();
                    log.append(results);
                    log.entries()
                };
                self.snapshot.send_modify(|snap| {
                    snap.results = entries;
                    if active_checkpoint.is_some() {
                        snap.current_checkpoint = active_checkpoint;
                    }
                    snap.is_running_tests = false;
                    snap.testing_checkpoint = None;
                });
                info!(target = "arena::exec", results = count, ?active_checkpoint, "test completed");
                self.settle_test(None, Ok(()));
            }
            ExecEvent::TestError { message } => {
                self.snapshot
                    .send_modify(|snap| snap.last_error = Some(message.clone()));
                self.settle_test(None, Err(ExecError::TestFailed(message)));
            }
            ExecEvent::RunExecuting { step } => {
                debug!(target = "arena::exec", step = %step, "run step executing");
                self.snapshot.send_modify(|snap| {
                    snap.run.running = true;
                    snap.run.installing = step.contains("install") || step.contains("init");
                    snap.run.step = Some(step);
                    snap.run.error = None;
                });
            }
            ExecEvent::RunCompleted { step, status, code } => {
                debug!(target = "arena::exec", step = ?step, status = %status, ?code, "run step completed");
                self.snapshot.send_modify(|snap| {
                    snap.run.installing = false;
                    snap.run.running = status == "success";
                    snap.run.exit_code = code;
                    snap.run.error = (status == "error").then(|| match code {
                        Some(code) => format!("Command failed with code {code}"),
                        None => "Command failed".to_string(),
                    });
                    if step.is_some() {
                        snap.run.step = step;
                    }
                });
            }
            ExecEvent::ServerReady { url } => {
                let url = server_url(&url);
                info!(target = "arena::exec", url = %url, "dev server ready");
                self.snapshot
                    .send_modify(|snap| snap.run.server_url = Some(url));
            }
            ExecEvent::RunError { message } => {
                self.snapshot.send_modify(|snap| {
                    snap.run.running = false;
                    snap.run.error = Some(message.unwrap_or_else(|| "Run failed".to_string()));
                });
            }
            ExecEvent::Heartbeat => {
                if let Some(outbound) = self.outbound() {
                    let _ = outbound.send(Outbound::Text(ExecCommand::HeartbeatResponse.to_text()));
                }
            }
        }
    }
}

/// The runner forwards the raw output chunk that announced the server; pull
/// the first http(s) URL out of it.
fn server_url(announcement: &str) -> String {
    let start = announcement
        .find("https://")
        .or_else(|| announcement.find("http://"));
    match start {
        Some(start) => announcement[start..]
            .split(|c: char| c.is_whitespace() || c.is_control())
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
        None => announcement.trim().to_string(),
    }
}
