//! Session orchestration.
//!
//! [`VibeKit`] collects an agent and a sandbox provider; [`VibeKit::build`]
//! turns it into a [`Session`] that provisions the sandbox, runs prompts,
//! republishes progress on its [`EventBus`] and tears everything down on
//! [`Session::kill`].
//!
//! A session runs one generation at a time. A second concurrent
//! [`Session::generate_code`] fails immediately with `SessionBusy`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentAdapter, AgentConfig, AgentContext, AgentOutput, CliAgent, GenerationResult,
    PromptRequest, RequestId,
};
use crate::config::{Validate, ValidationResult};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, LifecycleEvent, SubscriptionId};
use crate::retry::RetryPolicy;
use crate::sandbox::{ProcessOutput, SandboxCommand, SandboxHandle, SandboxId, SandboxProvider};

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE: &str = "default";

/// Unique identifier of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Agent or sandbox provider missing.
    Unconfigured,
    /// Both parts bound, no sandbox yet.
    Configured,
    /// Sandbox provisioned, nothing run yet.
    SandboxReady,
    /// A generation is in flight.
    Executing,
    /// Last generation finished; ready for the next.
    Idle,
    /// Killed. Terminal.
    Released,
}

/// Output of [`Session::execute_command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Builder for a [`Session`].
#[derive(Clone)]
pub struct VibeKit {
    agent: Option<Arc<dyn AgentAdapter>>,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    template_id: String,
    retry: RetryPolicy,
    env: HashMap<String, String>,
}

impl Default for VibeKit {
    fn default() -> Self {
        Self::new()
    }
}

impl VibeKit {
    pub fn new() -> Self {
        Self {
            agent: None,
            sandbox: None,
            template_id: DEFAULT_TEMPLATE.to_string(),
            retry: RetryPolicy::default(),
            env: HashMap::new(),
        }
    }

    /// Binds a CLI agent built from `config`.
    pub fn with_agent(self, config: AgentConfig) -> Self {
        self.with_agent_adapter(Arc::new(CliAgent::new(config)))
    }

    /// Binds a custom agent adapter.
    pub fn with_agent_adapter(mut self, agent: Arc<dyn AgentAdapter>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Binds a sandbox provider owned by this session.
    pub fn with_sandbox<P: SandboxProvider + 'static>(self, provider: P) -> Self {
        self.with_shared_sandbox(Arc::new(provider))
    }

    /// Binds a sandbox provider shared with other sessions.
    pub fn with_shared_sandbox(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox = Some(provider);
        self
    }

    /// Sets the template the sandbox is provisioned from.
    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = template_id.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Adds an environment variable for every agent process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `Configured` once both an agent and a sandbox provider are bound.
    pub fn state(&self) -> SessionState {
        if self.agent.is_some() && self.sandbox.is_some() {
            SessionState::Configured
        } else {
            SessionState::Unconfigured
        }
    }

    /// Validates the configuration and creates the session.
    ///
    /// No I/O happens here; credentials are checked by the agent before
    /// the first sandbox is provisioned.
    pub fn build(self) -> Result<Session> {
        for warning in self.validate().into_result()? {
            tracing::warn!(warning = %warning, "session configuration warning");
        }

        let (Some(agent), Some(provider)) = (self.agent, self.sandbox) else {
            return Err(Error::Configuration(
                "agent and sandbox provider are required".to_string(),
            ));
        };

        let id = SessionId::new();
        tracing::info!(
            session_id = %id,
            agent = agent.name(),
            sandbox = provider.name(),
            template = %self.template_id,
            "session configured"
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                id,
                agent,
                provider,
                template_id: self.template_id,
                retry: self.retry,
                env: self.env,
                bus: EventBus::new(),
                state: Mutex::new(SessionState::Configured),
                sandbox: tokio::sync::Mutex::new(None),
                run_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

impl Validate for VibeKit {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.agent.is_none() {
            result.add_error("no agent configured");
        }
        if self.sandbox.is_none() {
            result.add_error("no sandbox provider configured");
        }
        if self.template_id.trim().is_empty() {
            result.add_error("template id cannot be empty");
        }
        if self.retry.max_retries > 10 {
            result.add_warning("more than 10 retries may hide a persistent outage");
        }

        result
    }
}

struct SessionInner {
    id: SessionId,
    agent: Arc<dyn AgentAdapter>,
    provider: Arc<dyn SandboxProvider>,
    template_id: String,
    retry: RetryPolicy,
    env: HashMap<String, String>,
    bus: EventBus,
    state: Mutex<SessionState>,
    sandbox: tokio::sync::Mutex<Option<SandboxHandle>>,
    run_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// A live pairing of an agent and a sandbox.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("template_id", &self.inner.template_id)
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn template_id(&self) -> &str {
        &self.inner.template_id
    }

    /// Registers a handler for `kind` events.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    /// Removes a handler registered with [`Session::on`].
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Returns a broadcast receiver of all events from now on.
    pub fn stream(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.inner.bus.stream()
    }

    /// Returns the id of the bound sandbox, if one is live.
    pub async fn sandbox_id(&self) -> Option<SandboxId> {
        self.inner
            .sandbox
            .lock()
            .await
            .as_ref()
            .map(|h| h.id().clone())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state() == SessionState::Released {
            Err(Error::SessionReleased)
        } else {
            Ok(())
        }
    }

    /// Moves to `next` unless the session was released meanwhile.
    fn set_state(&self, next: SessionState) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != SessionState::Released {
            tracing::debug!(session_id = %self.inner.id, from = ?*state, to = ?next, "session state");
            *state = next;
        }
    }

    fn publish_status(&self, request_id: Option<&RequestId>, message: String) {
        self.inner.bus.publish(LifecycleEvent::update(
            self.inner.id.clone(),
            request_id.cloned(),
            AgentOutput::Status(message),
        ));
    }

    /// Publishes `error` as an error event unless it is a caller-usage
    /// error or a cancellation, then hands it back.
    fn fail(&self, request_id: Option<&RequestId>, error: Error) -> Error {
        if !error.is_usage_error() && !matches!(error, Error::Cancelled) {
            tracing::warn!(
                session_id = %self.inner.id,
                request_id = ?request_id.map(|r| r.to_string()),
                error = %error,
                "session operation failed"
            );
            self.inner.bus.publish(LifecycleEvent::error(
                self.inner.id.clone(),
                request_id.cloned(),
                &error,
            ));
        }
        error
    }

    /// Provisions the sandbox, or returns the live one.
    pub async fn provision(&self) -> Result<SandboxHandle> {
        self.ensure_live()?;
        self.acquire_sandbox(None)
            .await
            .map_err(|e| self.fail(None, e))
    }

    async fn acquire_sandbox(&self, request_id: Option<&RequestId>) -> Result<SandboxHandle> {
        let mut slot = self.inner.sandbox.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let provider = &self.inner.provider;
        let owner = &self.inner.id;
        let template = self.inner.template_id.as_str();
        let provisioning = self.inner.retry.run(
            || provider.provision(owner, template),
            |attempt, error, delay| {
                tracing::warn!(attempt, error = %error, delay = ?delay, "retrying sandbox provisioning");
                self.publish_status(
                    request_id,
                    format!("provisioning failed ({}), retry {} in {:?}", error, attempt, delay),
                );
            },
        );

        let handle = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
            handle = provisioning => handle?,
        };

        tracing::info!(
            session_id = %self.inner.id,
            sandbox_id = %handle.id(),
            "sandbox ready"
        );
        *slot = Some(handle.clone());
        drop(slot);

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Configured {
            *state = SessionState::SandboxReady;
        }
        Ok(handle)
    }

    /// Runs `request` in the sandbox, provisioning it first if needed.
    ///
    /// Every agent update is published as it arrives. Returns the final
    /// result, or the error that was also published as an error event.
    pub async fn generate_code(&self, request: PromptRequest) -> Result<GenerationResult> {
        let _running = self
            .inner
            .run_lock
            .try_lock()
            .map_err(|_| Error::SessionBusy)?;
        self.ensure_live()?;

        let request_id = RequestId::new();

        request
            .validate()
            .into_result()
            .and_then(|_| self.inner.agent.validate())
            .map_err(|e| self.fail(Some(&request_id), e))?;

        let handle = self
            .acquire_sandbox(Some(&request_id))
            .await
            .map_err(|e| self.fail(Some(&request_id), e))?;

        self.set_state(SessionState::Executing);
        tracing::info!(
            session_id = %self.inner.id,
            request_id = %request_id,
            mode = ?request.mode,
            "generating code"
        );
        self.publish_status(
            Some(&request_id),
            format!(
                "running {} in sandbox {}",
                self.inner.agent.name(),
                handle.id()
            ),
        );

        let outcome = self
            .inner
            .retry
            .run(
                || self.execute_once(&handle, &request, &request_id),
                |attempt, error, delay| {
                    tracing::warn!(attempt, error = %error, delay = ?delay, "retrying agent run");
                    self.publish_status(
                        Some(&request_id),
                        format!("agent failed ({}), retry {} in {:?}", error, attempt, delay),
                    );
                },
            )
            .await;

        if self.inner.cancel.is_cancelled() {
            // Killed while running: late results are discarded.
            return Err(Error::Cancelled);
        }
        self.set_state(SessionState::Idle);

        outcome.map_err(|e| self.fail(Some(&request_id), e))
    }

    async fn execute_once(
        &self,
        handle: &SandboxHandle,
        request: &PromptRequest,
        request_id: &RequestId,
    ) -> Result<GenerationResult> {
        let ctx = AgentContext {
            session_id: self.inner.id.clone(),
            request_id: request_id.clone(),
            provider: self.inner.provider.clone(),
            sandbox: handle.clone(),
            env: self.inner.env.clone(),
            cancel: self.inner.cancel.child_token(),
        };

        let (tx, mut rx) = mpsc::channel::<AgentOutput>(100);
        let agent = self.inner.agent.clone();
        let request = request.clone();
        let mut task = tokio::spawn(async move { agent.run(ctx, request, tx).await });
        let cancel = &self.inner.cancel;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.abort();
                    return Err(Error::Cancelled);
                }
                output = rx.recv() => match output {
                    Some(output) => {
                        self.inner.bus.publish(LifecycleEvent::update(
                            self.inner.id.clone(),
                            Some(request_id.clone()),
                            output,
                        ));
                    }
                    None => break,
                },
            }
        }

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                return Err(Error::Cancelled);
            }
            joined = &mut task => joined,
        };

        joined.map_err(|e| Error::Sandbox(format!("agent task failed: {}", e)))?
    }

    /// Returns the address `port` is exposed at.
    ///
    /// Fails with `SandboxNotReady` unless a sandbox is live.
    pub async fn get_host(&self, port: u16) -> Result<String> {
        match self.state() {
            SessionState::SandboxReady | SessionState::Executing | SessionState::Idle => {}
            _ => return Err(Error::SandboxNotReady),
        }

        let handle = self
            .inner
            .sandbox
            .lock()
            .await
            .clone()
            .ok_or(Error::SandboxNotReady)?;

        self.inner
            .provider
            .expose_port(&handle, port)
            .await
            .map_err(|e| self.fail(None, e))
    }

    /// Runs a shell command in the sandbox, publishing its output as
    /// updates.
    pub async fn execute_command(&self, command: &str) -> Result<CommandOutput> {
        let _running = self
            .inner
            .run_lock
            .try_lock()
            .map_err(|_| Error::SessionBusy)?;
        self.ensure_live()?;

        let handle = match self.state() {
            SessionState::SandboxReady | SessionState::Idle => self
                .inner
                .sandbox
                .lock()
                .await
                .clone()
                .ok_or(Error::SandboxNotReady)?,
            _ => return Err(Error::SandboxNotReady),
        };

        tracing::info!(session_id = %self.inner.id, sandbox_id = %handle.id(), "executing command");

        let (tx, mut rx) = mpsc::channel::<ProcessOutput>(100);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let exec = self.inner.provider.exec(
            &handle,
            SandboxCommand::shell(command).envs(self.inner.env.clone()),
            tx,
            self.inner.cancel.child_token(),
        );
        let forward = async {
            while let Some(output) = rx.recv().await {
                let update = match output {
                    ProcessOutput::Stdout(line) => {
                        stdout.push(line.clone());
                        AgentOutput::Stdout(line)
                    }
                    ProcessOutput::Stderr(line) => {
                        stderr.push(line.clone());
                        AgentOutput::Stderr(line)
                    }
                };
                self.inner.bus.publish(LifecycleEvent::update(
                    self.inner.id.clone(),
                    None,
                    update,
                ));
            }
        };

        let (exit, ()) = tokio::join!(exec, forward);
        let exit = exit.map_err(|e| self.fail(None, e))?;

        Ok(CommandOutput {
            exit_code: exit.code,
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
        })
    }

    /// Cancels in-flight work, stops event delivery and releases the
    /// sandbox. Calling it again is a no-op.
    pub async fn kill(&self) -> Result<()> {
        if self.state() == SessionState::Released {
            return Ok(());
        }

        // Closing waits out in-flight deliveries, so no handler observes
        // `Released`.
        self.inner.bus.close();

        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == SessionState::Released {
                return Ok(());
            }
            *state = SessionState::Released;
        }

        self.inner.cancel.cancel();

        let handle = self.inner.sandbox.lock().await.take();
        if let Some(handle) = handle {
            tracing::info!(
                session_id = %self.inner.id,
                sandbox_id = %handle.id(),
                "releasing sandbox"
            );
            self.inner.provider.release(&handle).await?;
        }

        tracing::info!(session_id = %self.inner.id, "session released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentType, ModelProvider};
    use crate::sandbox::LocalSandboxProvider;
    use tempfile::TempDir;

    fn grok_config(key: &str) -> AgentConfig {
        AgentConfig::new(AgentType::Grok, ModelProvider::Xai, "grok-beta", key)
    }

    #[test]
    fn builder_reports_configuration_state() {
        let dir = TempDir::new().unwrap();
        let kit = VibeKit::new();
        assert_eq!(kit.state(), SessionState::Unconfigured);

        let kit = kit.with_agent(grok_config("key"));
        assert_eq!(kit.state(), SessionState::Unconfigured);

        let kit = kit.with_sandbox(LocalSandboxProvider::in_dir(dir.path()));
        assert_eq!(kit.state(), SessionState::Configured);
    }

    #[test]
    fn sandbox_can_be_bound_before_agent() {
        let dir = TempDir::new().unwrap();
        let kit = VibeKit::new()
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .with_agent(grok_config("key"));

        assert_eq!(kit.state(), SessionState::Configured);
    }

    #[test]
    fn build_requires_agent_and_sandbox() {
        let err = VibeKit::new().with_agent(grok_config("key")).build().unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("sandbox"));
    }

    #[test]
    fn build_rejects_empty_template() {
        let dir = TempDir::new().unwrap();
        let result = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .with_template("  ")
            .build();

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn built_session_starts_configured() {
        let dir = TempDir::new().unwrap();
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .with_template("vibekit-grok")
            .build()
            .unwrap();

        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(session.template_id(), "vibekit-grok");
    }

    #[tokio::test]
    async fn empty_credential_fails_before_provisioning() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalSandboxProvider::in_dir(dir.path()));
        let session = VibeKit::new()
            .with_agent(grok_config(""))
            .with_shared_sandbox(provider.clone())
            .build()
            .unwrap();

        let err = session
            .generate_code(PromptRequest::ask("Hi there"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(provider.live_count().await, 0);
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let dir = TempDir::new().unwrap();
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .build()
            .unwrap();

        let err = session
            .generate_code(PromptRequest::ask("   "))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn provision_moves_to_sandbox_ready() {
        let dir = TempDir::new().unwrap();
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .build()
            .unwrap();

        let first = session.provision().await.unwrap();
        let second = session.provision().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(session.state(), SessionState::SandboxReady);
        assert_eq!(session.sandbox_id().await.as_ref(), Some(first.id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_command_streams_output() {
        let dir = TempDir::new().unwrap();
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .with_env("GREETING", "hello")
            .build()
            .unwrap();
        let mut events = session.stream();

        session.provision().await.unwrap();
        let output = session.execute_command("echo $GREETING").await.unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "hello");
        match events.recv().await.unwrap() {
            LifecycleEvent::Update(update) => {
                assert_eq!(update.output, AgentOutput::Stdout("hello".to_string()))
            }
            other => panic!("Expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn execute_command_requires_sandbox() {
        let dir = TempDir::new().unwrap();
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_sandbox(LocalSandboxProvider::in_dir(dir.path()))
            .build()
            .unwrap();

        assert!(matches!(
            session.execute_command("true").await,
            Err(Error::SandboxNotReady)
        ));
    }

    #[tokio::test]
    async fn kill_releases_sandbox_and_blocks_further_use() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalSandboxProvider::in_dir(dir.path()));
        let session = VibeKit::new()
            .with_agent(grok_config("key"))
            .with_shared_sandbox(provider.clone())
            .build()
            .unwrap();

        session.provision().await.unwrap();
        session.kill().await.unwrap();

        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(provider.live_count().await, 0);
        assert!(session.sandbox_id().await.is_none());
        assert!(matches!(
            session.generate_code(PromptRequest::ask("hi")).await,
            Err(Error::SessionReleased)
        ));
        assert!(matches!(
            session.provision().await,
            Err(Error::SessionReleased)
        ));
    }

    #[test]
    fn session_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::SandboxReady).unwrap(),
            "\"sandbox_ready\""
        );
    }
}
