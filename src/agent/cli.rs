//! CLI-backed agent adapter.
//!
//! Runs an agent CLI (Claude Code, Codex, Gemini, Grok, OpenCode) in
//! headless mode inside the sandbox and normalizes its output.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::prompt::build_prompt;
use crate::redact::Redactor;
use crate::sandbox::{ExitInfo, ProcessOutput, SandboxCommand};

use super::classify::FailureDetector;
use super::{
    AgentAdapter, AgentContext, AgentOutput, GenerationResult, GenerationStatus, Mode,
    PromptRequest, TokenUsage,
};

/// Lines of stdout/stderr kept for results and failure classification.
const TAIL_LINES: usize = 50;

/// Tools granted to Claude Code in ask mode.
const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS"];

/// Tools granted to Claude Code in code mode.
const WRITE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep", "LS", "Bash"];

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Codex,
    Gemini,
    Grok,
    OpenCode,
}

/// How an agent CLI writes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON message per line, ending with a `result` message.
    StreamJson,
    /// Free text; the whole stdout is the answer.
    Text,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
            AgentType::Grok => "grok",
            AgentType::OpenCode => "opencode",
        }
    }

    /// Default CLI binary name.
    pub fn cli_name(&self) -> &'static str {
        self.as_str()
    }

    /// Provider used when none is configured.
    pub fn default_provider(&self) -> ModelProvider {
        match self {
            AgentType::Claude | AgentType::OpenCode => ModelProvider::Anthropic,
            AgentType::Codex => ModelProvider::OpenAi,
            AgentType::Gemini => ModelProvider::Gemini,
            AgentType::Grok => ModelProvider::Xai,
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        match self {
            AgentType::Claude => OutputFormat::StreamJson,
            _ => OutputFormat::Text,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "claude-code" => Ok(AgentType::Claude),
            "codex" => Ok(AgentType::Codex),
            "gemini" | "gemini-cli" => Ok(AgentType::Gemini),
            "grok" | "grok-cli" => Ok(AgentType::Grok),
            "opencode" => Ok(AgentType::OpenCode),
            other => Err(Error::Configuration(format!("unknown agent type '{}'", other))),
        }
    }
}

/// LLM providers an agent can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Anthropic,
    OpenAi,
    Gemini,
    Xai,
    OpenRouter,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::OpenAi => "openai",
            ModelProvider::Gemini => "gemini",
            ModelProvider::Xai => "xai",
            ModelProvider::OpenRouter => "openrouter",
        }
    }

    /// Environment variable the credential is injected as.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ModelProvider::Anthropic => "ANTHROPIC_API_KEY",
            ModelProvider::OpenAi => "OPENAI_API_KEY",
            ModelProvider::Gemini => "GEMINI_API_KEY",
            ModelProvider::Xai => "XAI_API_KEY",
            ModelProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(ModelProvider::Anthropic),
            "openai" => Ok(ModelProvider::OpenAi),
            "gemini" | "google" => Ok(ModelProvider::Gemini),
            "xai" => Ok(ModelProvider::Xai),
            "openrouter" => Ok(ModelProvider::OpenRouter),
            other => Err(Error::Configuration(format!("unknown provider '{}'", other))),
        }
    }
}

/// Backend identity bound to an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_type: AgentType,
    pub provider: ModelProvider,
    pub model: String,
    /// Never logged; injected into the agent process environment only.
    pub api_key: SecretString,
    /// Overrides the CLI binary. If None, uses the agent's default.
    pub cli_path: Option<String>,
}

impl AgentConfig {
    pub fn new(
        agent_type: AgentType,
        provider: ModelProvider,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            agent_type,
            provider,
            model: model.into(),
            api_key: SecretString::new(api_key.into()),
            cli_path: None,
        }
    }

    /// Sets a custom CLI path.
    pub fn with_cli_path(mut self, cli_path: impl Into<String>) -> Self {
        self.cli_path = Some(cli_path.into());
        self
    }
}

/// Agent adapter that drives an agent CLI inside the sandbox.
pub struct CliAgent {
    config: AgentConfig,
    detector: FailureDetector,
}

impl CliAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            detector: FailureDetector::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn cli_path(&self) -> &str {
        self.config
            .cli_path
            .as_deref()
            .unwrap_or_else(|| self.config.agent_type.cli_name())
    }

    /// Environment variable names the credential is exported under.
    fn credential_env_names(&self) -> Vec<&'static str> {
        let mut names = vec![self.config.provider.api_key_env()];
        if self.config.agent_type == AgentType::Grok {
            names.push("GROK_API_KEY");
        }
        names
    }

    fn credential_env(&self) -> HashMap<String, String> {
        let key = self.config.api_key.expose_secret();
        self.credential_env_names()
            .into_iter()
            .map(|name| (name.to_string(), key.clone()))
            .collect()
    }

    fn redactor(&self) -> Redactor {
        let key = self.config.api_key.expose_secret();
        self.credential_env_names()
            .into_iter()
            .fold(Redactor::new(), |redactor, name| {
                redactor.with_secret(name, key.as_str())
            })
    }

    /// Builds the command arguments for the configured CLI.
    fn build_args(&self, prompt: &str, mode: Mode) -> Vec<String> {
        let model = self.config.model.clone();
        let mut args: Vec<String> = Vec::new();

        match self.config.agent_type {
            AgentType::Claude => {
                args.extend(
                    ["--print", "--output-format", "stream-json", "--verbose"]
                        .map(String::from),
                );
                args.push("--model".to_string());
                args.push(model);
                let tools = match mode {
                    Mode::Ask => READ_ONLY_TOOLS,
                    Mode::Code => {
                        // The sandbox provides isolation in code mode.
                        args.push("--dangerously-skip-permissions".to_string());
                        WRITE_TOOLS
                    }
                };
                args.push("--allowedTools".to_string());
                args.push(tools.join(","));
                args.push("-p".to_string());
                args.push(prompt.to_string());
            }
            AgentType::Codex => {
                let sandbox = match mode {
                    Mode::Ask => "read-only",
                    Mode::Code => "workspace-write",
                };
                args.extend(["exec", "--model"].map(String::from));
                args.push(model);
                args.extend(["--sandbox", sandbox, "--skip-git-repo-check"].map(String::from));
                args.push(prompt.to_string());
            }
            AgentType::Gemini => {
                args.push("--model".to_string());
                args.push(model);
                if mode == Mode::Code {
                    args.push("--yolo".to_string());
                }
                args.push("--prompt".to_string());
                args.push(prompt.to_string());
            }
            AgentType::Grok => {
                args.push("--model".to_string());
                args.push(model);
                args.push("--prompt".to_string());
                args.push(prompt.to_string());
            }
            AgentType::OpenCode => {
                args.push("run".to_string());
                args.push("--model".to_string());
                args.push(format!("{}/{}", self.config.provider, model));
                args.push(prompt.to_string());
            }
        }

        args
    }
}

#[async_trait]
impl AgentAdapter for CliAgent {
    fn validate(&self) -> Result<()> {
        if self.config.model.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "{} agent requires a model",
                self.config.agent_type
            )));
        }
        if self.config.api_key.expose_secret().trim().is_empty() {
            return Err(Error::Configuration(format!(
                "{} credential is empty (expected in {})",
                self.config.provider,
                self.config.provider.api_key_env()
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: AgentContext,
        request: PromptRequest,
        updates: mpsc::Sender<AgentOutput>,
    ) -> Result<GenerationResult> {
        self.validate()?;

        let started = Instant::now();
        let prompt = build_prompt(&request);
        let command = SandboxCommand::new(self.cli_path())
            .args(self.build_args(&prompt, request.mode))
            .envs(ctx.env.clone())
            .envs(self.credential_env());
        let redactor = self.redactor();

        tracing::info!(
            agent = %self.config.agent_type,
            model = %self.config.model,
            session_id = %ctx.session_id,
            request_id = %ctx.request_id,
            sandbox_id = %ctx.sandbox.id(),
            mode = ?request.mode,
            "spawning agent CLI"
        );

        let (tx, mut rx) = mpsc::channel::<ProcessOutput>(100);
        let mut collector = OutputCollector::new(self.config.agent_type.output_format());

        let exec = ctx
            .provider
            .exec(&ctx.sandbox, command, tx, ctx.cancel.clone());
        let consume = async {
            while let Some(output) = rx.recv().await {
                let update = match output {
                    ProcessOutput::Stdout(line) => collector.push_stdout(&redactor.redact(&line)),
                    ProcessOutput::Stderr(line) => collector.push_stderr(&redactor.redact(&line)),
                };
                if let Some(update) = update {
                    if updates.send(update).await.is_err() {
                        tracing::debug!("update receiver dropped");
                    }
                }
            }
        };

        let (exit, ()) = tokio::join!(exec, consume);
        let exit = exit?;

        let result = collector.finish(&self.detector, exit, &ctx, started.elapsed());
        match &result {
            Ok(r) => tracing::info!(
                request_id = %ctx.request_id,
                status = ?r.status,
                exit_code = ?r.exit_code,
                "agent finished"
            ),
            Err(e) => tracing::warn!(request_id = %ctx.request_id, error = %e, "agent failed"),
        }
        result
    }

    fn name(&self) -> &str {
        self.config.agent_type.as_str()
    }
}

/// Terminal message of a stream-json run.
#[derive(Debug, Clone, PartialEq)]
struct FinalMessage {
    content: String,
    is_error: bool,
    usage: Option<TokenUsage>,
}

/// Classification of one stream-json line.
#[derive(Debug, PartialEq)]
enum ParsedLine {
    Output(AgentOutput),
    Final(FinalMessage),
    /// A `result` message missing its payload.
    Malformed(String),
}

/// Parses a stream-json line into progress output or the final result.
fn parse_stream_json_line(line: &str) -> ParsedLine {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
        return ParsedLine::Output(AgentOutput::Stdout(line.to_string()));
    };

    match json.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let content = json
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            if let Some(content) = content {
                for item in content {
                    match item.get("type").and_then(|t| t.as_str()) {
                        Some("tool_use") => return ParsedLine::Output(parse_tool_use(item)),
                        Some("text") => {
                            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                return ParsedLine::Output(AgentOutput::Stdout(text.to_string()));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Some("user") => {
            if let Some(result) = json.get("tool_use_result") {
                let result_type = result.get("type").and_then(|t| t.as_str()).unwrap_or("");
                if let Some(file_path) = result.get("filePath").and_then(|p| p.as_str()) {
                    match result_type {
                        "create" | "update" => {
                            return ParsedLine::Output(AgentOutput::FileWrite(file_path.into()))
                        }
                        "read" => {
                            return ParsedLine::Output(AgentOutput::FileRead(file_path.into()))
                        }
                        _ => {}
                    }
                }
            }
        }
        Some("result") => {
            let is_error = json
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or(false);
            let usage = json.get("usage").map(|u| TokenUsage {
                input_tokens: u.get("input_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(|n| n.as_u64()).unwrap_or(0),
            });
            return match json.get("result").and_then(|r| r.as_str()) {
                Some(content) => ParsedLine::Final(FinalMessage {
                    content: content.to_string(),
                    is_error,
                    usage,
                }),
                None if is_error => ParsedLine::Final(FinalMessage {
                    content: json
                        .get("subtype")
                        .and_then(|s| s.as_str())
                        .unwrap_or("error")
                        .to_string(),
                    is_error,
                    usage,
                }),
                None => ParsedLine::Malformed(line.to_string()),
            };
        }
        _ => {}
    }

    // Other JSON messages are passed through as raw output.
    ParsedLine::Output(AgentOutput::Stdout(line.to_string()))
}

fn parse_tool_use(item: &serde_json::Value) -> AgentOutput {
    let tool = item
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or("")
        .to_string();

    let Some(input) = item.get("input") else {
        return AgentOutput::ToolCall {
            tool,
            args: String::new(),
        };
    };

    let file_path = input.get("file_path").and_then(|p| p.as_str());
    match (tool.as_str(), file_path) {
        ("Read", Some(path)) => AgentOutput::FileRead(path.into()),
        ("Write" | "Edit" | "NotebookEdit", Some(path)) => AgentOutput::FileWrite(path.into()),
        _ => AgentOutput::ToolCall {
            tool,
            args: input.to_string(),
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

/// Accumulates agent output and derives the final result.
struct OutputCollector {
    format: OutputFormat,
    text: Vec<String>,
    stdout_tail: VecDeque<String>,
    stderr_tail: VecDeque<String>,
    final_message: Option<FinalMessage>,
    malformed: Option<String>,
}

impl OutputCollector {
    fn new(format: OutputFormat) -> Self {
        Self {
            format,
            text: Vec::new(),
            stdout_tail: VecDeque::new(),
            stderr_tail: VecDeque::new(),
            final_message: None,
            malformed: None,
        }
    }

    /// Records a stdout line, returning the update to publish, if any.
    fn push_stdout(&mut self, line: &str) -> Option<AgentOutput> {
        push_tail(&mut self.stdout_tail, line);
        match self.format {
            OutputFormat::Text => {
                self.text.push(line.to_string());
                Some(AgentOutput::Stdout(line.to_string()))
            }
            OutputFormat::StreamJson => match parse_stream_json_line(line) {
                ParsedLine::Output(output) => Some(output),
                ParsedLine::Final(message) => {
                    self.final_message = Some(message);
                    None
                }
                ParsedLine::Malformed(raw) => {
                    self.malformed = Some(raw);
                    None
                }
            },
        }
    }

    fn push_stderr(&mut self, line: &str) -> Option<AgentOutput> {
        push_tail(&mut self.stderr_tail, line);
        Some(AgentOutput::Stderr(line.to_string()))
    }

    fn joined(tail: &VecDeque<String>) -> String {
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Last non-empty stderr line, or a description of the exit.
    fn failure_summary(&self, exit: &ExitInfo) -> String {
        self.stderr_tail
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| truncate(l.trim(), 200))
            .unwrap_or_else(|| match exit.code {
                Some(code) => format!("agent exited with code {}", code),
                None => "agent terminated by signal".to_string(),
            })
    }

    fn finish(
        self,
        detector: &FailureDetector,
        exit: ExitInfo,
        ctx: &AgentContext,
        duration: Duration,
    ) -> Result<GenerationResult> {
        let stdout = Self::joined(&self.stdout_tail);
        let stderr = Self::joined(&self.stderr_tail);

        let result = |status, content: String, usage| GenerationResult {
            request_id: ctx.request_id.clone(),
            sandbox_id: ctx.sandbox.id().clone(),
            status,
            content,
            exit_code: exit.code,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            usage,
            duration,
        };

        if !exit.success {
            let summary = self.failure_summary(&exit);
            let final_text = self
                .final_message
                .as_ref()
                .map(|m| m.content.as_str())
                .unwrap_or("");
            // Stdout is project output; only stderr and the result are classified.
            let haystack = format!("{}\n{}", stderr, final_text);
            if let Some(class) = detector.analyze(&haystack) {
                return Err(class.into_error(summary));
            }
            return Ok(result(GenerationStatus::Failure, summary, None));
        }

        match self.format {
            OutputFormat::StreamJson => match (self.final_message, self.malformed) {
                (Some(message), _) => {
                    if message.is_error {
                        if let Some(class) = detector.analyze(&message.content) {
                            return Err(class.into_error(truncate(&message.content, 200)));
                        }
                        return Ok(result(GenerationStatus::Partial, message.content, message.usage));
                    }
                    Ok(result(GenerationStatus::Success, message.content, message.usage))
                }
                (None, Some(raw)) => Err(Error::InvalidResponse(format!(
                    "result message has no payload: {}",
                    truncate(&raw, 200)
                ))),
                (None, None) => Err(Error::InvalidResponse(
                    "agent exited without a result message".to_string(),
                )),
            },
            OutputFormat::Text => {
                let content = self.text.join("\n").trim().to_string();
                if content.is_empty() {
                    return Err(Error::InvalidResponse(
                        "agent produced no output".to_string(),
                    ));
                }
                Ok(result(GenerationStatus::Success, content, None))
            }
        }
    }
}
