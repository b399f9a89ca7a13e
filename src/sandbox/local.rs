//! Local sandbox implementation.
//!
//! Each sandbox is a scratch directory under a base directory. Commands run
//! as local processes with the sandbox directory as their working directory,
//! and exposed ports resolve to the configured host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::session::SessionId;

use super::provider::{
    ExitInfo, ProcessOutput, SandboxCommand, SandboxHandle, SandboxId, SandboxProvider,
};

/// Configuration for [`LocalSandboxProvider`].
#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Directory sandboxes are created in. If None, uses a temp directory.
    pub base_dir: Option<PathBuf>,
    /// Host exposed ports are reported on.
    pub host: String,
    /// Maximum number of live sandboxes across all sessions.
    pub max_sandboxes: usize,
    /// Upper bound on how long provisioning may take.
    pub provision_timeout: Duration,
}

impl Default for LocalSandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            host: "127.0.0.1".to_string(),
            max_sandboxes: 8,
            provision_timeout: Duration::from_secs(60),
        }
    }
}

struct LocalSandbox {
    handle: SandboxHandle,
    path: PathBuf,
    ports: HashMap<u16, String>,
}

/// Provider that creates sandboxes as local scratch directories.
pub struct LocalSandboxProvider {
    config: LocalSandboxConfig,
    sandboxes: Mutex<HashMap<SandboxId, LocalSandbox>>,
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self::new(LocalSandboxConfig::default())
    }
}

impl LocalSandboxProvider {
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self {
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a provider rooted at `base_dir` with default limits.
    pub fn in_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self::new(LocalSandboxConfig {
            base_dir: Some(base_dir.into()),
            ..Default::default()
        })
    }

    fn base_dir(&self) -> PathBuf {
        self.config
            .base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vibe-orchestrator-sandboxes"))
    }

    /// Returns the working directory of a live sandbox.
    pub async fn sandbox_path(&self, handle: &SandboxHandle) -> Option<PathBuf> {
        self.sandboxes
            .lock()
            .await
            .get(handle.id())
            .map(|s| s.path.clone())
    }

    /// Returns the number of live sandboxes.
    pub async fn live_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }
}

/// Makes a template id safe for use in a directory name.
fn sanitize_template(template_id: &str) -> String {
    let cleaned: String = template_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "sandbox".to_string()
    } else {
        cleaned
    }
}

/// Sandbox directory that is not registered yet.
///
/// Dropping it before [`PendingDir::commit`] removes the directory, including
/// one whose creation finishes after the drop.
struct PendingDir {
    path: PathBuf,
    abandoned: Arc<std::sync::Mutex<bool>>,
    committed: bool,
}

impl PendingDir {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            abandoned: Arc::new(std::sync::Mutex::new(false)),
            committed: false,
        }
    }

    async fn create(&self) -> Result<()> {
        let path = self.path.clone();
        let abandoned = self.abandoned.clone();
        tokio::task::spawn_blocking(move || {
            let abandoned = abandoned.lock().unwrap_or_else(|e| e.into_inner());
            if *abandoned {
                return Ok(());
            }
            std::fs::create_dir_all(&path)
        })
        .await
        .map_err(|e| Error::Sandbox(format!("sandbox setup task failed: {}", e)))??;
        Ok(())
    }

    fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.path.clone()
    }
}

impl Drop for PendingDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Held across removal so a creation still queued sees the flag.
        let mut abandoned = self.abandoned.lock().unwrap_or_else(|e| e.into_inner());
        *abandoned = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = ?self.path, "removed abandoned sandbox directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = ?self.path,
                error = %e,
                "failed to remove abandoned sandbox directory"
            ),
        }
    }
}

/// Runs a provisioning step, failing with `ProvisionTimeout` past `limit`.
async fn within_provision_timeout<T, F>(limit: Duration, step: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, step)
        .await
        .map_err(|_| Error::ProvisionTimeout(limit.as_secs()))?
}

async fn remove_sandbox_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn provision(&self, owner: &SessionId, template_id: &str) -> Result<SandboxHandle> {
        let mut sandboxes = self.sandboxes.lock().await;

        if let Some(existing) = sandboxes.values().find(|s| s.handle.owner() == owner) {
            tracing::debug!(
                session_id = %owner,
                sandbox_id = %existing.handle.id(),
                "reusing live sandbox"
            );
            return Ok(existing.handle.clone());
        }

        if sandboxes.len() >= self.config.max_sandboxes {
            return Err(Error::QuotaExceeded(format!(
                "{} live sandboxes (max {})",
                sandboxes.len(),
                self.config.max_sandboxes
            )));
        }

        let id = SandboxId(uuid::Uuid::new_v4().to_string());
        let path = self
            .base_dir()
            .join(format!("{}-{}", sanitize_template(template_id), id));

        let pending = PendingDir::new(path);
        within_provision_timeout(self.config.provision_timeout, pending.create()).await?;
        let path = pending.commit();

        let handle = SandboxHandle::new(id.clone(), owner.clone(), template_id);

        tracing::info!(
            session_id = %owner,
            sandbox_id = %id,
            template = %template_id,
            path = ?path,
            "provisioned local sandbox"
        );

        sandboxes.insert(
            id,
            LocalSandbox {
                handle: handle.clone(),
                path,
                ports: HashMap::new(),
            },
        );

        Ok(handle)
    }

    async fn expose_port(&self, handle: &SandboxHandle, port: u16) -> Result<String> {
        if port == 0 {
            return Err(Error::Configuration("port must be non-zero".to_string()));
        }

        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle.id())
            .ok_or(Error::SandboxNotReady)?;

        let host = &self.config.host;
        let address = sandbox
            .ports
            .entry(port)
            .or_insert_with(|| format!("http://{}:{}", host, port))
            .clone();

        tracing::debug!(sandbox_id = %handle.id(), port, address = %address, "exposed port");
        Ok(address)
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: SandboxCommand,
        output_tx: mpsc::Sender<ProcessOutput>,
        cancel: CancellationToken,
    ) -> Result<ExitInfo> {
        let path = self
            .sandbox_path(handle)
            .await
            .ok_or(Error::SandboxNotReady)?;

        tracing::info!(
            sandbox_id = %handle.id(),
            program = %command.program,
            "running command in sandbox"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn {}: {}", command.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("stderr was not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill cancelled process");
                    }
                    return Err(Error::Cancelled);
                }
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            if output_tx.send(ProcessOutput::Stdout(line)).await.is_err() {
                                tracing::debug!("output receiver dropped");
                            }
                        }
                        Ok(None) => stdout_done = true,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stdout");
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            if output_tx.send(ProcessOutput::Stderr(line)).await.is_err() {
                                tracing::debug!("output receiver dropped");
                            }
                        }
                        Ok(None) => stderr_done = true,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stderr");
                            stderr_done = true;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill cancelled process");
                }
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<()> {
        let removed = self.sandboxes.lock().await.remove(handle.id());

        match removed {
            Some(sandbox) => {
                tracing::info!(sandbox_id = %handle.id(), "releasing local sandbox");
                remove_sandbox_dir(&sandbox.path).await
            }
            None => {
                tracing::debug!(sandbox_id = %handle.id(), "sandbox already released");
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

impl Drop for LocalSandboxProvider {
    fn drop(&mut self) {
        for (id, sandbox) in self.sandboxes.get_mut().drain() {
            if let Err(e) = std::fs::remove_dir_all(&sandbox.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(error = %e, sandbox_id = %id, "failed to cleanup sandbox on drop");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> LocalSandboxProvider {
        LocalSandboxProvider::in_dir(dir.path())
    }

    #[test]
    fn sanitize_template_replaces_unsafe_chars() {
        assert_eq!(sanitize_template("vibekit-grok"), "vibekit-grok");
        assert_eq!(sanitize_template("org/template:v1"), "org-template-v1");
        assert_eq!(sanitize_template(""), "sandbox");
    }

    #[tokio::test]
    async fn slow_provisioning_step_times_out() {
        let err = within_provision_timeout(
            Duration::from_millis(10),
            std::future::pending::<Result<()>>(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ProvisionTimeout(_)), "got {:?}", err);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn abandoned_directory_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vibekit-grok-abandoned");

        let pending = PendingDir::new(path.clone());
        pending.create().await.unwrap();
        assert!(path.exists());
        drop(pending);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_provision_leaves_no_directory() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        let owner = SessionId::new();
        let mut task = tokio_test::task::spawn(provider.provision(&owner, "vibekit-grok"));
        if let std::task::Poll::Ready(result) = task.poll() {
            let handle = result.unwrap();
            provider.release(&handle).await.unwrap();
        }
        drop(task);

        // Let a creation already handed to the blocking pool finish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(provider.live_count().await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn provision_creates_directory() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        let handle = provider
            .provision(&SessionId::new(), "vibekit-grok")
            .await
            .unwrap();

        let path = provider.sandbox_path(&handle).await.unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path()));
        assert_eq!(handle.template_id(), "vibekit-grok");
    }

    #[tokio::test]
    async fn provision_is_idempotent_per_owner() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let owner = SessionId::new();

        let first = provider.provision(&owner, "t").await.unwrap();
        let second = provider.provision(&owner, "t").await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(provider.live_count().await, 1);
    }

    #[tokio::test]
    async fn different_owners_get_different_sandboxes() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);

        let a = provider.provision(&SessionId::new(), "t").await.unwrap();
        let b = provider.provision(&SessionId::new(), "t").await.unwrap();

        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn quota_limits_live_sandboxes() {
        let dir = TempDir::new().unwrap();
        let provider = LocalSandboxProvider::new(LocalSandboxConfig {
            base_dir: Some(dir.path().to_path_buf()),
            max_sandboxes: 1,
            ..Default::default()
        });

        provider.provision(&SessionId::new(), "t").await.unwrap();
        let err = provider.provision(&SessionId::new(), "t").await.unwrap_err();

        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn expose_port_reports_configured_host() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();

        let address = provider.expose_port(&handle, 3000).await.unwrap();

        assert_eq!(address, "http://127.0.0.1:3000");
    }

    #[tokio::test]
    async fn release_is_idempotent_and_removes_directory() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();
        let path = provider.sandbox_path(&handle).await.unwrap();

        provider.release(&handle).await.unwrap();
        provider.release(&handle).await.unwrap();

        assert!(!path.exists());
        assert!(matches!(
            provider.expose_port(&handle, 3000).await,
            Err(Error::SandboxNotReady)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_streams_output_from_sandbox_directory() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let exit = provider
            .exec(
                &handle,
                SandboxCommand::shell("echo out; echo err 1>&2; pwd").env("GREETING", "hi"),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }

        assert!(exit.success);
        assert!(lines.contains(&ProcessOutput::Stdout("out".to_string())));
        assert!(lines.contains(&ProcessOutput::Stderr("err".to_string())));
        let sandbox_dir = provider.sandbox_path(&handle).await.unwrap();
        assert!(lines.iter().any(|l| matches!(
            l,
            ProcessOutput::Stdout(p) if Path::new(p).ends_with(sandbox_dir.file_name().unwrap())
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_reports_failure_exit_code() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();
        let (tx, _rx) = mpsc::channel(16);

        let exit = provider
            .exec(&handle, SandboxCommand::shell("exit 3"), tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_is_cancellable() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            provider.exec(&handle, SandboxCommand::shell("sleep 30"), tx, cancel),
        )
        .await
        .expect("exec should stop when cancelled");

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn exec_on_released_sandbox_fails() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = provider.provision(&SessionId::new(), "t").await.unwrap();
        provider.release(&handle).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let result = provider
            .exec(&handle, SandboxCommand::new("true"), tx, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::SandboxNotReady)));
    }
}
