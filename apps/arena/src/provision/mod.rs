//! Client for the lab provisioning API.

pub mod mock;

use arena_proto::{ProgressReport, StartProjectRequest, TestResultsReport};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid provisioning config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub enum ProgressPoll {
    /// The progress endpoint answered 404: nothing is provisioned yet.
    NotProvisioned,
    Report(ProgressReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// 409: a project for this lab is already running.
    AlreadyRunning,
    /// 429: the per-user lab quota is used up.
    QuotaExceeded,
    Rejected(StatusCode),
}

impl StartOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::CONFLICT => StartOutcome::AlreadyRunning,
            StatusCode::TOO_MANY_REQUESTS => StartOutcome::QuotaExceeded,
            status if status.is_success() => StartOutcome::Started,
            status => StartOutcome::Rejected(status),
        }
    }

    pub fn accepted(self) -> bool {
        matches!(self, StartOutcome::Started | StartOutcome::AlreadyRunning)
    }
}

#[async_trait]
pub trait ProvisionBackend: Send + Sync {
    async fn progress(&self, lab_id: &str) -> Result<ProgressPoll, ProvisionError>;

    async fn start_project(
        &self,
        request: &StartProjectRequest,
    ) -> Result<StartOutcome, ProvisionError>;

    async fn test_results(&self, lab_id: &str) -> Result<TestResultsReport, ProvisionError>;
}

pub struct ReqwestProvisionBackend {
    base: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for ReqwestProvisionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestProvisionBackend")
            .field("base", &self.base.as_str())
            .finish()
    }
}

impl ReqwestProvisionBackend {
    /// Accepts a full URL or a bare host; bare private hosts get `http://`,
    /// anything else `https://`.
    pub fn new(api_base: &str) -> Result<Self, ProvisionError> {
        let mut base = api_base.trim().to_string();
        if base.is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "api base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            base = format!("{}{base}", infer_scheme(&base));
        }
        let base = Url::parse(&base)
            .map_err(|err| ProvisionError::InvalidConfig(format!("invalid api base url: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(ProvisionError::InvalidConfig(format!(
                "api base url {base} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProvisionError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProvisionError::InvalidConfig(format!("invalid api base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ProvisionBackend for ReqwestProvisionBackend {
    async fn progress(&self, lab_id: &str) -> Result<ProgressPoll, ProvisionError> {
        let endpoint = self.endpoint(&["api", "project", "progress", lab_id])?;
        let response = self.client.get(endpoint).send().await?;
        let status = response.status();
        debug!(target = "arena::provision", lab_id = %lab_id, %status, "progress polled");
        if status == StatusCode::NOT_FOUND {
            return Ok(ProgressPoll::NotProvisioned);
        }
        if !status.is_success() {
            return Err(ProvisionError::HttpStatus(status));
        }
        let report = response
            .json::<ProgressReport>()
            .await
            .map_err(|err| ProvisionError::InvalidResponse(err.to_string()))?;
        Ok(ProgressPoll::Report(report))
    }

    async fn start_project(
        &self,
        request: &StartProjectRequest,
    ) -> Result<StartOutcome, ProvisionError> {
        let endpoint = self.endpoint(&["api", "project", "start"])?;
        let response = self.client.post(endpoint).json(request).send().await?;
        let outcome = StartOutcome::from_status(response.status());
        debug!(target = "arena::provision", lab_id = %request.lab_id, ?outcome, "start requested");
        Ok(outcome)
    }

    async fn test_results(&self, lab_id: &str) -> Result<TestResultsReport, ProvisionError> {
        let endpoint = self.endpoint(&["api", "v1", "test-results", lab_id])?;
        let response = self.client.get(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::HttpStatus(response.status()));
        }
        response
            .json::<TestResultsReport>()
            .await
            .map_err(|err| ProvisionError::InvalidResponse(err.to_string()))
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host = base
        .split('/')
        .next()
        .unwrap_or(base)
        .split(':')
        .next()
        .unwrap_or(base)
        .to_ascii_lowercase();
    let private = host == "localhost"
        || host == "0.0.0.0"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .is_some_and(|octet| (16..32).contains(&octet));
    if private { "http://" } else { "https://" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_scheme_prefers_https_for_public_hosts() {
        assert_eq!(infer_scheme("labs.example.com"), "https://");
        assert_eq!(infer_scheme("localhost:3000"), "http://");
        assert_eq!(infer_scheme("172.20.1.4/api"), "http://");
        assert_eq!(infer_scheme("172.40.1.4"), "https://");
    }

    #[test]
    fn endpoints_keep_base_path_and_escape_ids() {
        let backend = ReqwestProvisionBackend::new("https://labs.example.com/edge/").unwrap();
        let url = backend
            .endpoint(&["api", "project", "progress", "lab 7"])
            .unwrap();
        assert_eq!(url.as_str(), "https://labs.example.com/edge/api/project/progress/lab%207");
        let bare = ReqwestProvisionBackend::new("127.0.0.1:3000").unwrap();
        assert_eq!(bare.base_url().scheme(), "http");
    }

    #[test]
    fn start_outcome_maps_statuses() {
        assert_eq!(StartOutcome::from_status(StatusCode::OK), StartOutcome::Started);
        assert_eq!(StartOutcome::from_status(StatusCode::CONFLICT), StartOutcome::AlreadyRunning);
        assert_eq!(
            StartOutcome::from_status(StatusCode::TOO_MANY_REQUESTS),
            StartOutcome::QuotaExceeded
        );
        assert!(!StartOutcome::from_status(StatusCode::BAD_GATEWAY).accepted());
        assert!(StartOutcome::AlreadyRunning.accepted());
    }

    #[test]
    fn empty_base_is_rejected() {
        assert!(matches!(
            ReqwestProvisionBackend::new("  "),
            Err(ProvisionError::InvalidConfig(_))
        ));
    }
}
