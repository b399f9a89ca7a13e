//! Sandbox provider trait and types.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::SessionId;

/// Provider-assigned identifier of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub String);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a provisioned sandbox.
///
/// A handle belongs to exactly one session. Providers key their internal
/// state by the handle's id; once released the handle no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    id: SandboxId,
    owner: SessionId,
    template_id: String,
}

impl SandboxHandle {
    /// Creates a handle. Called by provider implementations.
    pub fn new(id: SandboxId, owner: SessionId, template_id: impl Into<String>) -> Self {
        Self {
            id,
            owner,
            template_id: template_id.into(),
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    /// Session that provisioned this sandbox.
    pub fn owner(&self) -> &SessionId {
        &self.owner
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }
}

/// A process to run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables. Values may be secrets and are never logged.
    pub env: HashMap<String, String>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }
}

/// A line of output from a sandboxed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
}

/// How a sandboxed process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub success: bool,
}

/// Provider of isolated execution environments.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provisions a sandbox from `template_id` for `owner`.
    ///
    /// Idempotent per owner: while a sandbox for `owner` is live, the
    /// existing handle is returned instead of creating another.
    async fn provision(&self, owner: &SessionId, template_id: &str) -> Result<SandboxHandle>;

    /// Exposes `port` and returns the address it is reachable at.
    ///
    /// Fails with `SandboxNotReady` if the handle has been released.
    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String>;

    /// Runs `command`, streaming its output line by line.
    ///
    /// Cancelling `cancel` terminates the process and fails with `Cancelled`.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: SandboxCommand,
        output_tx: mpsc::Sender<ProcessOutput>,
        cancel: CancellationToken,
    ) -> Result<ExitInfo>;

    /// Tears the sandbox down. Releasing an unknown or already released
    /// handle is a no-op.
    async fn release(&self, handle: &SandboxHandle) -> Result<()>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_command_builder_collects_args_and_env() {
        let command = SandboxCommand::new("grok")
            .arg("--prompt")
            .args(["hello", "world"])
            .env("GROK_API_KEY", "k");

        assert_eq!(command.program, "grok");
        assert_eq!(command.args, vec!["--prompt", "hello", "world"]);
        assert_eq!(command.env.get("GROK_API_KEY"), Some(&"k".to_string()));
    }

    #[test]
    fn shell_command_wraps_script() {
        let command = SandboxCommand::shell("echo hi");
        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn handle_exposes_owner_and_template() {
        let owner = SessionId::new();
        let handle = SandboxHandle::new(SandboxId("sbx-1".into()), owner.clone(), "vibekit-grok");

        assert_eq!(handle.id().to_string(), "sbx-1");
        assert_eq!(handle.owner(), &owner);
        assert_eq!(handle.template_id(), "vibekit-grok");
    }
}
