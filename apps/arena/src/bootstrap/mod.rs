//! Lab bootstrap.
//!
//! Drives a lab from "maybe not provisioned" to a usable session: polls the
//! provisioning API, starts the project when needed, opens the control
//! channel, loads the file metadata and finally the PTY. Everything a UI
//! needs is published as one [`LabSnapshot`] on a watch channel, and the
//! phase inside it is the only readiness signal.

mod phase;
mod poll;
mod progress;

pub use phase::{BootstrapPhase, ErrorCode, LabIssue};
pub use poll::PollSchedule;
pub use progress::estimate as estimate_percent;

use crate::config::{ConfigError, LabConfig};
use crate::exec::{ChannelState, ExecChannel, ExecConfig, ExecError, ExecSnapshot};
use crate::files::{FileError, Files};
use crate::provision::{
    ProgressPoll, ProvisionBackend, ProvisionError, ReqwestProvisionBackend, StartOutcome,
};
use crate::socket::{SocketClient, SocketConfig, SocketEvent};
use crate::transport::Connector;
use crate::transport::websocket::WebSocketConnector;
use arena_proto::{
    CheckpointRef, CheckpointResult, ControlRequest, FileRecord, ProgressReport, QuestMeta, ServiceLog,
    StartProjectRequest, TestResultsField,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_MAIN_FILES: [&str; 5] = ["App.jsx", "index.js", "main.js", "index.html", "README.md"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub lab_id: String,
    pub language: String,
    pub require_pty_for_ready: bool,
    pub auto_connect_pty: bool,
    pub require_file_meta_for_ready: bool,
    /// Preferred initial files, in priority order.
    pub main_file_candidates: Vec<String>,
    pub meta_timeout: Duration,
    pub poll: PollSchedule,
    pub start_accepted_delay: Duration,
    pub start_retry_delay: Duration,
    /// How long the remote may report `active` without the file-system
    /// service log before connecting anyway.
    pub active_fallback: Duration,
    pub max_poll_failures: u32,
    pub fs_connect_attempts: u32,
    pub fs_backoff_step: Duration,
    pub fs_backoff_max: Duration,
    pub meta_attempts: u32,
    pub meta_empty_delay: Duration,
    pub meta_error_delay: Duration,
}

impl BootstrapOptions {
    pub fn new(lab_id: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            lab_id: lab_id.into(),
            language: language.into(),
            require_pty_for_ready: true,
            auto_connect_pty: true,
            require_file_meta_for_ready: true,
            main_file_candidates: DEFAULT_MAIN_FILES.iter().map(|name| name.to_string()).collect(),
            meta_timeout: Duration::from_secs(8),
            poll: PollSchedule::default(),
            start_accepted_delay: Duration::from_secs(2),
            start_retry_delay: Duration::from_secs(3),
            active_fallback: Duration::from_secs(5),
            max_poll_failures: 10,
            fs_connect_attempts: 8,
            fs_backoff_step: Duration::from_millis(1_500),
            fs_backoff_max: Duration::from_secs(6),
            meta_attempts: 3,
            meta_empty_delay: Duration::from_millis(400),
            meta_error_delay: Duration::from_millis(500),
        }
    }
}

/// Collaborators a session is wired to. Tests swap in the mock backend and
/// the in-memory connector.
#[derive(Clone)]
pub struct SessionDeps {
    pub provision: Arc<dyn ProvisionBackend>,
    pub control_connector: Arc<dyn Connector>,
    pub exec_connector: Arc<dyn Connector>,
    pub control_url: String,
    pub exec_url: String,
    pub socket: SocketConfig,
    pub exec: ExecConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabSnapshot {
    pub phase: BootstrapPhase,
    pub percent: u8,
    pub error: Option<LabIssue>,
    pub remote_status: Option<String>,
    pub progress_logs: Vec<ServiceLog>,
    pub active_file: Option<String>,
    pub meta_loaded: bool,
    pub fs_ready: bool,
    pub pty_ready: bool,
    pub max_labs_reached: bool,
    pub current_checkpoint: Option<u32>,
    pub api_calls: u32,
    pub requires_pty: bool,
}

impl LabSnapshot {
    pub fn is_ready(&self) -> bool {
        match self.phase {
            BootstrapPhase::FullReady => true,
            BootstrapPhase::Ready => !self.requires_pty,
            _ => false,
        }
    }

    /// Phase a file-system-ready session should sit in right now.
    fn settled_phase(&self) -> BootstrapPhase {
        if self.pty_ready {
            BootstrapPhase::FullReady
        } else if self.requires_pty {
            BootstrapPhase::PtyConnecting
        } else {
            BootstrapPhase::Ready
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("lab quota exceeded: {0}")]
    MaxLabsExceeded(String),
    #[error("{0}")]
    Failed(LabIssue),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("lab session was shut down")]
    ShutDown,
}

impl BootstrapError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            BootstrapError::MaxLabsExceeded(_) => Some(ErrorCode::MaxLabsExceeded),
            BootstrapError::Failed(issue) => Some(issue.code),
            _ => None,
        }
    }
}

/// Why a background step stopped. Cloneable so it can leave a shared future.
#[derive(Debug, Clone)]
enum Halt {
    Failed(LabIssue),
    ShutDown,
}

impl From<Halt> for BootstrapError {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::Failed(issue) => BootstrapError::Failed(issue),
            Halt::ShutDown => BootstrapError::ShutDown,
        }
    }
}

/// Owner of the published snapshot. Every phase change goes through
/// [`StatusBoard::transition`], which rejects illegal moves and keeps the
/// percentage monotonic.
struct StatusBoard {
    tx: watch::Sender<LabSnapshot>,
}

impl StatusBoard {
    fn new(requires_pty: bool) -> Self {
        let snapshot = LabSnapshot {
            percent: progress::estimate(0, BootstrapPhase::CheckingProgress, false, requires_pty),
            requires_pty,
            ..LabSnapshot::default()
        };
        let (tx, _) = watch::channel(snapshot);
        Self { tx }
    }

    fn snapshot(&self) -> LabSnapshot {
        self.tx.borrow().clone()
    }

    fn transition(&self, to: BootstrapPhase) -> bool {
        let mut allowed = false;
        self.tx.send_if_modified(|snap| {
            let from = snap.phase;
            let error = snap.error.as_ref().map(|issue| issue.code);
            if !from.allows(to, snap.meta_loaded, error) {
                debug!(target = "arena::bootstrap", from = %from, to = %to, "phase transition refused");
                return false;
            }
            allowed = true;
            if from == to {
                return false;
            }
            snap.phase = to;
            snap.percent = progress::estimate(snap.percent, to, snap.meta_loaded, snap.requires_pty);
            info!(target = "arena::bootstrap", from = %from, to = %to, percent = snap.percent, "phase changed");
            true
        });
        allowed
    }

    fn update(&self, apply: impl FnOnce(&mut LabSnapshot)) {
        self.tx.send_modify(|snap| {
            apply(snap);
            snap.percent =
                progress::estimate(snap.percent, snap.phase, snap.meta_loaded, snap.requires_pty);
        });
    }

    fn set_error(&self, issue: LabIssue) {
        warn!(target = "arena::bootstrap", code = %issue.code, message = %issue.message, "lab error");
        self.tx.send_modify(|snap| snap.error = Some(issue));
    }

    fn clear_error_if(&self, codes: &[ErrorCode]) {
        self.tx.send_if_modified(|snap| match &snap.error {
            Some(issue) if codes.contains(&issue.code) => {
                snap.error = None;
                true
            }
            _ => false,
        });
    }

    /// Records the issue, moves to `error` and hands the issue back.
    fn fail(&self, issue: LabIssue) -> LabIssue {
        self.set_error(issue.clone());
        self.transition(BootstrapPhase::Error);
        issue
    }
}

type FsAttempt = Shared<BoxFuture<'static, Result<(), Halt>>>;

struct Inner {
    options: BootstrapOptions,
    provision: Arc<dyn ProvisionBackend>,
    files: Files,
    exec: ExecChannel,
    control_url: String,
    board: StatusBoard,
    fs_connect: Mutex<Option<FsAttempt>>,
    meta_timer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watchers_started: AtomicBool,
    control_opened: AtomicBool,
    initial_file_chosen: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// One bootstrapped lab. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LabSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.board.tx.borrow();
        f.debug_struct("LabSession")
            .field("lab_id", &self.inner.options.lab_id)
            .field("phase", &snapshot.phase)
            .field("percent", &snapshot.percent)
            .finish()
    }
}

impl LabSession {
    pub fn new(options: BootstrapOptions, deps: SessionDeps) -> Self {
        let socket = SocketClient::new(deps.control_connector, deps.socket);
        let files = Files::new(socket, deps.control_url.clone());
        let exec = ExecChannel::new(deps.exec_connector, deps.exec_url, deps.exec);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                board: StatusBoard::new(options.require_pty_for_ready),
                options,
                provision: deps.provision,
                files,
                exec,
                control_url: deps.control_url,
                fs_connect: Mutex::new(None),
                meta_timer: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                watchers_started: AtomicBool::new(false),
                control_opened: AtomicBool::new(false),
                initial_file_chosen: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Wires the real HTTP backend and WebSocket connector from config.
    pub fn from_config(config: &LabConfig, mut options: BootstrapOptions) -> Result<Self, BootstrapError> {
        let urls = config.channel_urls();
        let control_url = urls.control_url(&options.lab_id, &options.language)?;
        let exec_url = urls.execution_url(&options.lab_id, &options.language)?;
        let provision = ReqwestProvisionBackend::new(&config.api_base)?;
        options.meta_timeout = config.meta_timeout();
        let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector);
        debug!(
            target = "arena::bootstrap",
            api = %provision.base_url(),
            control = %control_url,
            exec = %exec_url,
            "lab session configured"
        );
        Ok(Self::new(
            options,
            SessionDeps {
                provision: Arc::new(provision),
                control_connector: connector.clone(),
                exec_connector: connector,
                control_url,
                exec_url,
                socket: config.socket_config(),
                exec: config.exec_config(),
            },
        ))
    }

    pub fn options(&self) -> &BootstrapOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> watch::Receiver<LabSnapshot> {
        self.inner.board.tx.subscribe()
    }

    pub fn snapshot(&self) -> LabSnapshot {
        self.inner.board.snapshot()
    }

    pub fn files(&self) -> &Files {
        &self.inner.files
    }

    pub fn exec(&self) -> &ExecChannel {
        &self.inner.exec
    }

    pub fn start(&self) -> JoinHandle<Result<(), BootstrapError>> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    /// Runs the bootstrap until the control channel is up and metadata is
    /// loaded or its grace timer is armed. PTY and test history follow in
    /// the background.
    pub async fn run(&self) -> Result<(), BootstrapError> {
        self.ensure_watchers();
        info!(
            target = "arena::bootstrap",
            lab_id = %self.inner.options.lab_id,
            language = %self.inner.options.language,
            "bootstrapping lab"
        );
        self.poll_until_active().await?;
        self.connect_fs().await
    }

    /// Opens the control channel and loads metadata. Concurrent callers join
    /// the attempt already in flight.
    pub async fn connect_fs(&self) -> Result<(), BootstrapError> {
        self.ensure_watchers();
        let attempt = {
            let mut slot = self.inner.fs_connect.lock();
            match &*slot {
                Some(attempt) => attempt.clone(),
                None => {
                    let session = self.clone();
                    let attempt = async move {
                        let outcome = session.establish_fs().await;
                        session.inner.fs_connect.lock().take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await.map_err(BootstrapError::from)
    }

    pub async fn connect_pty(&self) -> Result<(), BootstrapError> {
        let inner = &self.inner;
        match inner.exec.connect().await {
            Ok(()) => {
                let mut fs_ready = false;
                inner.board.update(|snap| {
                    snap.pty_ready = true;
                    fs_ready = snap.fs_ready;
                });
                if fs_ready {
                    inner.board.transition(BootstrapPhase::FullReady);
                }
                inner.board.clear_error_if(&[ErrorCode::PtyConnectFailed]);
                info!(target = "arena::bootstrap", url = %inner.exec.url(), "pty connected");
                Ok(())
            }
            Err(err) => {
                let issue = LabIssue::new(ErrorCode::PtyConnectFailed, format!("failed to connect PTY: {err}"));
                if inner.options.require_pty_for_ready {
                    inner.board.fail(issue.clone());
                } else {
                    warn!(target = "arena::bootstrap", error = %err, "optional pty connect failed");
                }
                Err(BootstrapError::Failed(issue))
            }
        }
    }

    pub async fn run_checkpoint_test(&self, checkpoint_id: &str) -> Result<(), ExecError> {
        let result = self
            .inner
            .exec
            .run_checkpoint_test(checkpoint_id, &self.inner.options.language)
            .await;
        match &result {
            Err(ExecError::Busy) | Ok(()) => {}
            Err(err) => self
                .inner
                .board
                .set_error(LabIssue::new(ErrorCode::TestExecutionFailed, err.to_string())),
        }
        result
    }

    /// Fetches test history from the provisioning API into the result log.
    pub async fn load_test_results(&self) -> Result<(), BootstrapError> {
        let inner = &self.inner;
        inner.board.update(|snap| snap.api_calls += 1);
        let report = inner.provision.test_results(&inner.options.lab_id).await?;
        let checkpoint = report.active_checkpoint.as_ref().and_then(CheckpointRef::number);
        let history = report.test_results.map(TestResultsField::normalize);
        let loaded = history.as_ref().map_or(0, Vec::len);
        self.absorb_results(history, checkpoint);
        debug!(target = "arena::bootstrap", loaded, ?checkpoint, "test results loaded");
        Ok(())
    }

    /// Refetches metadata on demand; reconnects first if the control channel
    /// is down.
    pub async fn retry_meta(&self) -> Result<(), BootstrapError> {
        if self.snapshot().meta_loaded {
            return Ok(());
        }
        if !self.inner.files.socket().is_connected() {
            return self.connect_fs().await;
        }
        self.load_meta().await;
        Ok(())
    }

    pub fn set_active_file(&self, path: impl Into<String>) {
        let path = path.into();
        self.inner.board.update(|snap| snap.active_file = Some(path));
    }

    pub async fn open_file(&self, path: &str) -> Result<String, FileError> {
        let result = self.inner.files.open_file(path).await;
        self.note_file_error(result)
    }

    pub async fn refresh_file(&self, path: &str) -> Result<String, FileError> {
        let result = self.inner.files.refresh_file(path).await;
        self.note_file_error(result)
    }

    pub async fn save_file(&self, path: &str, content: &str) -> Result<(), FileError> {
        let result = self.inner.files.save_file(path, content).await;
        self.note_file_error(result)
    }

    pub async fn create_file(&self, path: &str, is_dir: bool, content: Option<&str>) -> Result<(), FileError> {
        let result = self.inner.files.create_file(path, is_dir, content).await;
        self.note_file_error(result)
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), FileError> {
        let result = self.inner.files.delete_file(path).await;
        self.note_file_error(result)
    }

    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FileError> {
        let result = self.inner.files.rename_file(old_path, new_path).await;
        self.note_file_error(result)
    }

    pub async fn load_directory(&self, path: &str) -> Result<Vec<FileRecord>, FileError> {
        let result = self.inner.files.load_directory(path).await;
        self.note_file_error(result)
    }

    /// Stops polling, aborts background work and closes both channels.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(timer) = inner.meta_timer.lock().take() {
            timer.abort();
        }
        inner.fs_connect.lock().take();
        inner.files.socket().disconnect();
        inner.exec.disconnect();
        info!(target = "arena::bootstrap", lab_id = %inner.options.lab_id, "lab session shut down");
    }

    fn note_file_error<T>(&self, result: Result<T, FileError>) -> Result<T, FileError> {
        if let Err(err) = &result {
            self.inner.board.set_error(LabIssue::new(err.code(), err.to_string()));
        }
        result
    }

    async fn pause(&self, delay: Duration) -> Result<(), Halt> {
        let mut stop = self.inner.shutdown.subscribe();
        if *stop.borrow_and_update() {
            return Err(Halt::ShutDown);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = stop.wait_for(|stopped| *stopped) => Err(Halt::ShutDown),
        }
    }

    fn stopped(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    async fn poll_until_active(&self) -> Result<(), BootstrapError> {
        let inner = &self.inner;
        let options = &inner.options;
        let started = Instant::now();
        let mut failures = 0u32;
        let mut active_since: Option<Instant> = None;
        loop {
            if self.stopped() {
                return Err(BootstrapError::ShutDown);
            }
            inner.board.update(|snap| snap.api_calls += 1);
            match inner.provision.progress(&options.lab_id).await {
                Ok(ProgressPoll::NotProvisioned) => {
                    failures = 0;
                    inner.board.transition(BootstrapPhase::StartingProject);
                    if self.start_project().await? {
                        inner.board.transition(BootstrapPhase::WaitingActive);
                        self.pause(options.start_accepted_delay).await?;
                    } else {
                        self.pause(options.start_retry_delay).await?;
                    }
                    continue;
                }
                Ok(ProgressPoll::Report(report)) => {
                    failures = 0;
                    let active = report.is_active();
                    let fs_active = report.file_system_active();
                    self.absorb_report(report);
                    if active {
                        let since = *active_since.get_or_insert_with(Instant::now);
                        if fs_active || since.elapsed() >= options.active_fallback {
                            info!(
                                target = "arena::bootstrap",
                                fs_active,
                                waited_ms = started.elapsed().as_millis() as u64,
                                "lab active"
                            );
                            inner.board.transition(BootstrapPhase::FsConnecting);
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(target = "arena::bootstrap", error = %err, failures, "progress poll failed");
                    if failures >= options.max_poll_failures {
                        let issue = LabIssue::new(
                            ErrorCode::ProgressFetchFailed,
                            format!("progress polling failed {failures} times: {err}"),
                        );
                        return Err(BootstrapError::Failed(inner.board.fail(issue)));
                    }
                }
            }
            self.pause(options.poll.interval(started.elapsed())).await?;
        }
    }

    /// `Ok(true)` when the start was accepted or the project already runs.
    async fn start_project(&self) -> Result<bool, BootstrapError> {
        let inner = &self.inner;
        let request = StartProjectRequest {
            lab_id: inner.options.lab_id.clone(),
            language: inner.options.language.clone(),
        };
        inner.board.update(|snap| snap.api_calls += 1);
        match inner.provision.start_project(&request).await {
            Ok(StartOutcome::QuotaExceeded) => {
                inner.board.update(|snap| snap.max_labs_reached = true);
                let issue = LabIssue::new(
                    ErrorCode::MaxLabsExceeded,
                    "maximum number of active labs reached",
                );
                let issue = inner.board.fail(issue);
                Err(BootstrapError::MaxLabsExceeded(issue.message))
            }
            Ok(outcome) if outcome.accepted() => {
                info!(target = "arena::bootstrap", ?outcome, "project start accepted");
                Ok(true)
            }
            Ok(outcome) => {
                warn!(target = "arena::bootstrap", ?outcome, "project start rejected, retrying");
                Ok(false)
            }
            Err(err) => {
                warn!(target = "arena::bootstrap", error = %err, "project start failed, retrying");
                Ok(false)
            }
        }
    }

    fn absorb_report(&self, report: ProgressReport) {
        let checkpoint = report.active_checkpoint.as_ref().and_then(CheckpointRef::number);
        let history = report.test_results.map(TestResultsField::normalize);
        self.absorb_results(history, checkpoint);
        let ProgressReport {
            status,
            progress_logs,
            ..
        } = report;
        self.inner.board.update(|snap| {
            snap.remote_status = Some(status);
            snap.progress_logs = progress_logs;
        });
    }

    fn absorb_results(&self, history: Option<Vec<CheckpointResult>>, checkpoint: Option<u32>) {
        if let Some(history) = history {
            self.inner.exec.hydrate_results(history, checkpoint);
        }
        if checkpoint.is_some() {
            self.inner.board.update(|snap| snap.current_checkpoint = checkpoint);
        }
    }

    async fn establish_fs(&self) -> Result<(), Halt> {
        let inner = &self.inner;
        let options = &inner.options;
        let socket = inner.files.socket().clone();
        let mut attempt = 0u32;
        loop {
            if self.stopped() {
                return Err(Halt::ShutDown);
            }
            attempt += 1;
            inner.board.transition(BootstrapPhase::FsConnecting);
            match socket.connect(&inner.control_url).await {
                Ok(()) => break,
                Err(err) if attempt < options.fs_connect_attempts => {
                    let delay = (options.fs_backoff_step * attempt).min(options.fs_backoff_max);
                    warn!(
                        target = "arena::bootstrap",
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "control channel connect failed, retrying"
                    );
                    self.pause(delay).await?;
                }
                Err(err) => {
                    let issue = LabIssue::new(
                        ErrorCode::FsConnectFailed,
                        format!("control channel failed after {attempt} attempts: {err}"),
                    );
                    return Err(Halt::Failed(inner.board.fail(issue)));
                }
            }
        }

        let init = ControlRequest::InitializeClient {
            language: options.language.clone(),
            lab_id: options.lab_id.clone(),
        };
        if let Err(err) = socket.send_one_way(init, None).await {
            debug!(target = "arena::bootstrap", error = %err, "initialize message not sent, continuing");
        }
        inner.board.transition(BootstrapPhase::FsMetaLoading);
        self.load_meta().await;
        Ok(())
    }

    async fn load_meta(&self) {
        let inner = &self.inner;
        let options = &inner.options;
        if self.snapshot().meta_loaded {
            return;
        }
        let cached = inner.files.tree().file_paths();
        if !cached.is_empty() {
            let records = inner.files.tree().flatten();
            self.apply_meta(&records).await;
            return;
        }

        let attempts = options.meta_attempts.max(1);
        for attempt in 1..=attempts {
            let request = ControlRequest::FetchQuestMeta { path: String::new() };
            let outcome = inner
                .files
                .socket()
                .request::<QuestMeta>(request, Some(&inner.control_url))
                .await;
            if self.snapshot().meta_loaded {
                return;
            }
            match outcome {
                Ok(meta) if !meta.files.is_empty() => {
                    self.apply_meta(&meta.files).await;
                    return;
                }
                Ok(_) => {
                    debug!(target = "arena::bootstrap", attempt, "metadata empty");
                    if attempt < attempts && self.pause(options.meta_empty_delay * attempt).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(target = "arena::bootstrap", error = %err, attempt, "metadata fetch failed");
                    if attempt < attempts {
                        if self.pause(options.meta_error_delay * attempt).await.is_err() {
                            return;
                        }
                    } else {
                        inner
                            .board
                            .set_error(LabIssue::new(ErrorCode::MetaFetchFailed, err.to_string()));
                    }
                }
            }
        }

        if !options.require_file_meta_for_ready || self.snapshot().fs_ready {
            self.declare_fs_ready();
        } else {
            self.arm_meta_timer();
        }
    }

    async fn apply_meta(&self, records: &[FileRecord]) {
        let inner = &self.inner;
        inner.files.replace_from_records(records);
        inner.board.update(|snap| snap.meta_loaded = true);
        inner
            .board
            .clear_error_if(&[ErrorCode::MetaTimeout, ErrorCode::MetaFetchFailed]);
        if let Some(timer) = inner.meta_timer.lock().take() {
            timer.abort();
        }
        info!(target = "arena::bootstrap", files = records.len(), "file metadata loaded");

        if let Some(path) = initial_file(records, &inner.options.main_file_candidates) {
            if !inner.initial_file_chosen.swap(true, Ordering::SeqCst) {
                self.set_active_file(path.clone());
                if let Err(err) = inner.files.open_file(&path).await {
                    debug!(target = "arena::bootstrap", path = %path, error = %err, "initial file not loaded");
                }
            }
        }
        self.declare_fs_ready();
    }

    fn arm_meta_timer(&self) {
        let mut slot = self.inner.meta_timer.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let after = self.inner.options.meta_timeout;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let session = LabSession { inner };
            if !session.snapshot().meta_loaded {
                session.inner.board.set_error(LabIssue::new(
                    ErrorCode::MetaTimeout,
                    "file metadata took too long to load",
                ));
                session.declare_fs_ready();
            }
        }));
        debug!(target = "arena::bootstrap", after_ms = after.as_millis() as u64, "metadata timer armed");
    }

    fn declare_fs_ready(&self) {
        let inner = &self.inner;
        let mut newly_ready = false;
        let mut target = BootstrapPhase::Ready;
        inner.board.update(|snap| {
            newly_ready = !snap.fs_ready;
            snap.fs_ready = true;
            target = snap.settled_phase();
        });
        inner.board.transition(target);
        if !newly_ready {
            return;
        }

        let session = self.clone();
        self.track(tokio::spawn(async move {
            if let Err(err) = session.load_test_results().await {
                warn!(target = "arena::bootstrap", error = %err, "test results not loaded");
            }
        }));
        if inner.options.auto_connect_pty || inner.options.require_pty_for_ready {
            let session = self.clone();
            self.track(tokio::spawn(async move {
                let _ = session.connect_pty().await;
            }));
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if self.stopped() {
            task.abort();
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn ensure_watchers(&self) {
        let inner = &self.inner;
        if inner.watchers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        let socket = inner.files.socket();
        let meta_rx = socket.subscribe("quest_meta");
        let events = socket.events();
        let exec_rx = inner.exec.subscribe();
        self.track(inner.files.spawn_ack_listener());
        self.track(tokio::spawn(watch_passive_meta(weak.clone(), meta_rx)));
        self.track(tokio::spawn(watch_control(weak.clone(), events)));
        self.track(tokio::spawn(watch_exec(weak, exec_rx)));
    }
}

/// First non-directory record matching a candidate name, else the first file.
pub fn initial_file(records: &[FileRecord], candidates: &[String]) -> Option<String> {
    let files: Vec<&FileRecord> = records.iter().filter(|record| !record.is_dir).collect();
    candidates
        .iter()
        .find_map(|candidate| {
            let suffix = format!("/{candidate}");
            files
                .iter()
                .find(|record| record.path == *candidate || record.path.ends_with(&suffix))
        })
        .or_else(|| files.first())
        .map(|record| record.path.clone())
}

fn upgrade(weak: &Weak<Inner>) -> Option<LabSession> {
    weak.upgrade().map(|inner| LabSession { inner })
}

async fn watch_passive_meta(weak: Weak<Inner>, mut rx: broadcast::Receiver<arena_bus::PushMessage>) {
    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "arena::bootstrap", skipped, "metadata pushes lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(session) = upgrade(&weak) else {
            break;
        };
        match serde_json::from_value::<QuestMeta>(message.payload) {
            Ok(meta) if !meta.files.is_empty() && !session.snapshot().meta_loaded => {
                debug!(target = "arena::bootstrap", files = meta.files.len(), "passive metadata received");
                session.apply_meta(&meta.files).await;
            }
            Ok(_) => {}
            Err(err) => debug!(target = "arena::bootstrap", error = %err, "ignoring malformed quest_meta push"),
        }
    }
}

async fn watch_control(weak: Weak<Inner>, mut events: broadcast::Receiver<SocketEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "arena::bootstrap", skipped, "control events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(session) = upgrade(&weak) else {
            break;
        };
        let board = &session.inner.board;
        match event {
            SocketEvent::Opened { generation } => {
                let reopened = session.inner.control_opened.swap(true, Ordering::SeqCst);
                if reopened && !board.snapshot().meta_loaded {
                    debug!(target = "arena::bootstrap", generation, "control channel reopened, refetching metadata");
                    board.transition(BootstrapPhase::FsMetaLoading);
                    let reload = session.clone();
                    session.track(tokio::spawn(async move { reload.load_meta().await }));
                }
            }
            SocketEvent::Closed { code, .. } => {
                let snapshot = board.snapshot();
                let early = matches!(
                    snapshot.phase,
                    BootstrapPhase::FsMetaLoading | BootstrapPhase::Ready | BootstrapPhase::PtyConnecting
                );
                if !snapshot.meta_loaded && early {
                    debug!(target = "arena::bootstrap", ?code, "control channel closed before metadata, retrying silently");
                    board.transition(BootstrapPhase::FsConnecting);
                }
            }
            SocketEvent::ReconnectScheduled { attempt, delay } => {
                debug!(target = "arena::bootstrap", attempt, delay_ms = delay.as_millis() as u64, "control reconnect scheduled");
            }
            SocketEvent::ReconnectExhausted { attempts } => {
                board.fail(LabIssue::new(
                    ErrorCode::FsConnectFailed,
                    format!("control channel lost after {attempts} reconnect attempts"),
                ));
            }
        }
    }
}

async fn watch_exec(weak: Weak<Inner>, mut rx: watch::Receiver<ExecSnapshot>) {
    let mut previous = rx.borrow_and_update().state;
    while rx.changed().await.is_ok() {
        let (state, checkpoint) = {
            let snapshot = rx.borrow_and_update();
            (snapshot.state, snapshot.current_checkpoint)
        };
        let Some(session) = upgrade(&weak) else {
            break;
        };
        let board = &session.inner.board;
        if checkpoint.is_some() && board.snapshot().current_checkpoint != checkpoint {
            board.update(|snap| snap.current_checkpoint = checkpoint);
        }
        if previous == ChannelState::Connected && state == ChannelState::Disconnected {
            let mut target = None;
            board.update(|snap| {
                snap.pty_ready = false;
                if snap.phase == BootstrapPhase::FullReady {
                    target = Some(snap.settled_phase());
                }
            });
            info!(target = "arena::bootstrap", "pty disconnected");
            if let Some(target) = target {
                board.transition(target);
            }
        }
        previous = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<String> {
        DEFAULT_MAIN_FILES.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn initial_file_prefers_candidates_in_order() {
        let records = vec![
            FileRecord::dir("src"),
            FileRecord::file("notes.txt"),
            FileRecord::file("src/index.js"),
            FileRecord::file("src/App.jsx"),
        ];
        assert_eq!(initial_file(&records, &candidates()).as_deref(), Some("src/App.jsx"));
    }

    #[test]
    fn initial_file_matches_whole_names_only() {
        let records = vec![FileRecord::file("src/MyApp.jsx"), FileRecord::file("docs/a.md")];
        assert_eq!(initial_file(&records, &candidates()).as_deref(), Some("src/MyApp.jsx"));
        assert_eq!(initial_file(&[FileRecord::dir("src")], &candidates()), None);
    }

    #[test]
    fn board_refuses_illegal_moves_and_keeps_percent() {
        let board = StatusBoard::new(false);
        assert_eq!(board.snapshot().percent, 5);
        assert!(board.transition(BootstrapPhase::FsMetaLoading));
        assert!(!board.transition(BootstrapPhase::WaitingActive));
        assert_eq!(board.snapshot().phase, BootstrapPhase::FsMetaLoading);

        board.update(|snap| snap.meta_loaded = true);
        assert_eq!(board.snapshot().percent, 65);
        assert!(!board.transition(BootstrapPhase::FsConnecting));

        board.fail(LabIssue::new(ErrorCode::FsConnectFailed, "down"));
        let snap = board.snapshot();
        assert_eq!(snap.phase, BootstrapPhase::Error);
        assert_eq!(snap.percent, 65);
        assert!(!board.transition(BootstrapPhase::Ready));
    }

    #[test]
    fn clear_error_only_matches_listed_codes() {
        let board = StatusBoard::new(true);
        board.set_error(LabIssue::new(ErrorCode::MetaTimeout, "slow"));
        board.clear_error_if(&[ErrorCode::PtyConnectFailed]);
        assert!(board.snapshot().error.is_some());
        board.clear_error_if(&[ErrorCode::MetaTimeout]);
        assert!(board.snapshot().error.is_none());
    }

    #[test]
    fn readiness_depends_on_pty_requirement() {
        let mut snap = LabSnapshot {
            phase: BootstrapPhase::Ready,
            requires_pty: true,
            ..LabSnapshot::default()
        };
        assert!(!snap.is_ready());
        snap.requires_pty = false;
        assert!(snap.is_ready());
        snap.phase = BootstrapPhase::Error;
        assert!(!snap.is_ready());
    }
}
