//! Vibe Orchestrator - sandboxed code-generation sessions
//!
//! This library pairs a code-generation agent with an isolated sandbox,
//! runs prompts against it, streams progress through an event bus, and
//! releases the sandbox when the session is killed.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod prompt;
pub mod redact;
pub mod retry;
pub mod sandbox;
pub mod session;

pub use agent::{
    AgentAdapter, AgentConfig, AgentContext, AgentOutput, AgentType, CliAgent, GenerationResult,
    GenerationStatus, Mode, ModelProvider, PromptRequest, RequestId, TokenUsage,
};
pub use config::{Validate, ValidationResult, VibeConfig};
pub use error::{Error, ErrorKind, Result};
pub use events::{ErrorEvent, EventBus, EventKind, LifecycleEvent, SubscriptionId, UpdateEvent};
pub use redact::Redactor;
pub use retry::RetryPolicy;
pub use sandbox::{
    LocalSandboxConfig, LocalSandboxProvider, SandboxCommand, SandboxHandle, SandboxId,
    SandboxProvider,
};
pub use session::{CommandOutput, Session, SessionId, SessionState, VibeKit};
