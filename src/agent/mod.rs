//! Remote compute-agent dispatch.
//!
//! Executors that run work on a remote cluster (YARN, Kubernetes,
//! standalone Spark) talk to the agent through this interface: submit a
//! descriptor, poll status, fetch logs, kill. The state machine itself
//! never calls the agent directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque handle to a submitted remote application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandle {
    pub app_id: String,
}

/// Remote application status as reported by the agent.
///
/// Agents report free-form, case-insensitive strings; anything unknown maps
/// to `Undefined`, which is treated as still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Submitted,
    Running,
    ContainerCreating,
    Succeeded,
    Failed,
    Killed,
    Terminating,
    Undefined,
}

impl AgentStatus {
    /// Parse an agent-reported status string, case-insensitively.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" => Self::Submitted,
            "RUNNING" => Self::Running,
            "CONTAINERCREATING" => Self::ContainerCreating,
            "SUCCEEDED" | "FINISHED" => Self::Succeeded,
            "FAILED" | "ERROR" => Self::Failed,
            "KILLED" => Self::Killed,
            "TERMINATING" => Self::Terminating,
            _ => Self::Undefined,
        }
    }

    /// Still in flight: keep polling. `Undefined` counts as active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Running | Self::ContainerCreating | Self::Undefined
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The application was killed from outside.
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed | Self::Terminating)
    }
}

/// Submission descriptor handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Run instance id, echoed back by the agent for correlation.
    pub instance_id: String,
    /// Work-type-specific payload (SQL text, Spark conf, files).
    pub payload: serde_json::Value,
}

/// Abstract agent dispatch interface.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<AgentHandle>;
    async fn get_status(&self, handle: &AgentHandle) -> Result<AgentStatus>;
    async fn get_log(&self, handle: &AgentHandle) -> Result<String>;
    async fn kill(&self, handle: &AgentHandle) -> Result<()>;
}

/// HTTP agent client.
pub struct HttpAgentClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SubmitResponse {
    app_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

impl HttpAgentClient {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn submit(&self, request: &SubmitRequest) -> Result<AgentHandle> {
        let response = self
            .client
            .post(format!("{}/api/submit", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let body: SubmitResponse = response.json().await?;
        if body.app_id.is_empty() {
            return Err(Error::Agent("Agent returned an empty application id".into()));
        }
        Ok(AgentHandle { app_id: body.app_id })
    }

    async fn get_status(&self, handle: &AgentHandle) -> Result<AgentStatus> {
        let response = self
            .client
            .get(format!("{}/api/status/{}", self.base_url, handle.app_id))
            .send()
            .await?
            .error_for_status()?;
        let body: StatusResponse = response.json().await?;
        Ok(AgentStatus::parse(&body.status))
    }

    async fn get_log(&self, handle: &AgentHandle) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/api/log/{}", self.base_url, handle.app_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        self.client
            .post(format!("{}/api/kill/{}", self.base_url, handle.app_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
