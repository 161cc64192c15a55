//! Scripted provisioning backend. Each queue replays its entries in order and
//! then keeps answering with the last one.

use super::{ProgressPoll, ProvisionBackend, ProvisionError, StartOutcome};
use arena_proto::{ProgressReport, ServiceLog, StartProjectRequest, TestResultsReport, FILE_SYSTEM_SERVICE};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum ProgressStep {
    NotFound,
    Report(ProgressReport),
    Fail,
}

impl ProgressStep {
    /// Remote active with the file-system service log active too.
    pub fn active() -> Self {
        ProgressStep::Report(report("active", &[(FILE_SYSTEM_SERVICE, "active")]))
    }

    pub fn provisioning() -> Self {
        ProgressStep::Report(report("provisioning", &[(FILE_SYSTEM_SERVICE, "pending")]))
    }
}

pub fn report(status: &str, services: &[(&str, &str)]) -> ProgressReport {
    ProgressReport {
        status: status.to_string(),
        progress_logs: services
            .iter()
            .map(|(name, status)| ServiceLog {
                service_name: name.to_string(),
                status: status.to_string(),
            })
            .collect(),
        ..ProgressReport::default()
    }
}

#[derive(Debug, Default)]
struct Script {
    progress: VecDeque<ProgressStep>,
    starts: VecDeque<StartOutcome>,
    results: TestResultsReport,
}

#[derive(Debug, Default)]
pub struct MockProvision {
    script: Mutex<Script>,
    progress_calls: Mutex<Vec<Instant>>,
    start_calls: Mutex<Vec<StartProjectRequest>>,
}

impl MockProvision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(self, steps: impl IntoIterator<Item = ProgressStep>) -> Self {
        self.script.lock().progress.extend(steps);
        self
    }

    pub fn with_starts(self, outcomes: impl IntoIterator<Item = StartOutcome>) -> Self {
        self.script.lock().starts.extend(outcomes);
        self
    }

    pub fn with_results(self, results: TestResultsReport) -> Self {
        self.script.lock().results = results;
        self
    }

    pub fn progress_calls(&self) -> Vec<Instant> {
        self.progress_calls.lock().clone()
    }

    pub fn start_calls(&self) -> Vec<StartProjectRequest> {
        self.start_calls.lock().clone()
    }
}

fn next_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[async_trait]
impl ProvisionBackend for MockProvision {
    async fn progress(&self, _lab_id: &str) -> Result<ProgressPoll, ProvisionError> {
        self.progress_calls.lock().push(Instant::now());
        let step = next_sticky(&mut self.script.lock().progress).unwrap_or(ProgressStep::NotFound);
        match step {
            ProgressStep::NotFound => Ok(ProgressPoll::NotProvisioned),
            ProgressStep::Report(report) => Ok(ProgressPoll::Report(report)),
            ProgressStep::Fail => Err(ProvisionError::HttpStatus(StatusCode::BAD_GATEWAY)),
        }
    }

    async fn start_project(
        &self,
        request: &StartProjectRequest,
    ) -> Result<StartOutcome, ProvisionError> {
        self.start_calls.lock().push(request.clone());
        Ok(next_sticky(&mut self.script.lock().starts).unwrap_or(StartOutcome::Started))
    }

    async fn test_results(&self, _lab_id: &str) -> Result<TestResultsReport, ProvisionError> {
        Ok(self.script.lock().results.clone())
    }
}
