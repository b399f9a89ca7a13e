//! Agent adapters for code-generation backends.
//!
//! An [`AgentAdapter`] turns a [`PromptRequest`] into backend calls inside a
//! sandbox, streams [`AgentOutput`] while it runs and returns a normalized
//! [`GenerationResult`]. [`CliAgent`] drives the common agent CLIs.

mod classify;
mod cli;

pub use classify::{FailureClass, FailureDetector};
pub use cli::{AgentConfig, AgentType, CliAgent, ModelProvider, OutputFormat};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::sandbox::{SandboxHandle, SandboxId, SandboxProvider};
use crate::session::SessionId;

/// Identifier assigned to each prompt request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution mode for a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Answer without mutating sandbox state.
    Ask,
    /// Generate and apply changes.
    #[default]
    Code,
}

/// A prompt to run against the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: Mode,
}

impl PromptRequest {
    pub fn new(prompt: impl Into<String>, mode: Mode) -> Self {
        Self {
            prompt: prompt.into(),
            mode,
        }
    }

    /// A read-only question.
    pub fn ask(prompt: impl Into<String>) -> Self {
        Self::new(prompt, Mode::Ask)
    }

    /// A request to change code.
    pub fn code(prompt: impl Into<String>) -> Self {
        Self::new(prompt, Mode::Code)
    }
}

/// Progress output from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentOutput {
    /// Standard output line or assistant text.
    Stdout(String),
    /// Standard error line.
    Stderr(String),
    /// Tool call detected.
    ToolCall { tool: String, args: String },
    /// File read detected.
    FileRead(PathBuf),
    /// File write detected.
    FileWrite(PathBuf),
    /// Orchestration status message.
    Status(String),
}

/// Outcome classification of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    /// The agent finished but reported an error of its own.
    Partial,
    /// The agent process failed.
    Failure,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Final result of a prompt request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: RequestId,
    pub sandbox_id: SandboxId,
    pub status: GenerationStatus,
    /// Final answer or change summary.
    pub content: String,
    pub exit_code: Option<i32>,
    /// Trailing stdout lines.
    pub stdout: String,
    /// Trailing stderr lines.
    pub stderr: String,
    pub usage: Option<TokenUsage>,
    pub duration: Duration,
}

impl GenerationResult {
    pub fn is_success(&self) -> bool {
        self.status == GenerationStatus::Success
    }
}

/// Everything an adapter needs to run one request.
#[derive(Clone)]
pub struct AgentContext {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub provider: Arc<dyn SandboxProvider>,
    pub sandbox: SandboxHandle,
    /// Extra environment for agent processes.
    pub env: std::collections::HashMap<String, String>,
    /// Cancelled when the owning session is killed.
    pub cancel: CancellationToken,
}

/// Adapter for a code-generation backend.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Checks the bound backend identity without any I/O.
    ///
    /// Fails with `Configuration` when the credential or model is missing.
    fn validate(&self) -> Result<()>;

    /// Runs `request` inside the context's sandbox.
    ///
    /// Progress is sent on `updates` as it happens; the terminal outcome is
    /// the return value.
    async fn run(
        &self,
        ctx: AgentContext,
        request: PromptRequest,
        updates: mpsc::Sender<AgentOutput>,
    ) -> Result<GenerationResult>;

    /// Returns the name of this agent.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_request_constructors_set_mode() {
        assert_eq!(PromptRequest::ask("hi").mode, Mode::Ask);
        assert_eq!(PromptRequest::code("fix it").mode, Mode::Code);
    }

    #[test]
    fn prompt_request_deserializes_with_default_mode() {
        let request: PromptRequest = serde_json::from_str(r#"{"prompt":"Hi there"}"#).unwrap();
        assert_eq!(request.mode, Mode::Code);

        let request: PromptRequest =
            serde_json::from_str(r#"{"prompt":"Hi there","mode":"ask"}"#).unwrap();
        assert_eq!(request.mode, Mode::Ask);
    }

    #[test]
    fn agent_output_serializes_adjacently_tagged() {
        let json = serde_json::to_string(&AgentOutput::Stdout("hello".into())).unwrap();
        assert_eq!(json, r#"{"type":"stdout","data":"hello"}"#);
    }

    #[test]
    fn token_usage_totals() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(usage.total(), 15);
    }
}
