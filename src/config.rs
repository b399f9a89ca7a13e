//! Configuration loading and validation.
//!
//! A [`VibeConfig`] describes one agent/sandbox pairing. It is read from a
//! TOML file, overridden from `VIBEKIT_*` environment variables, validated,
//! and turned into a [`VibeKit`] builder.
//!
//! ```toml
//! [agent]
//! type = "grok"
//! provider = "xai"
//! model = "grok-beta"
//!
//! [sandbox]
//! template_id = "vibekit-grok"
//! max_sandboxes = 4
//!
//! [retry]
//! max_retries = 2
//! initial_backoff_ms = 250
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, AgentType, ModelProvider, PromptRequest};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sandbox::{LocalSandboxConfig, LocalSandboxProvider};
use crate::session::{VibeKit, DEFAULT_TEMPLATE};

/// Environment variable naming the agent type.
pub const ENV_AGENT: &str = "VIBEKIT_AGENT";
/// Environment variable naming the model provider.
pub const ENV_PROVIDER: &str = "VIBEKIT_PROVIDER";
/// Environment variable naming the model.
pub const ENV_MODEL: &str = "VIBEKIT_MODEL";
/// Environment variable naming the sandbox template.
pub const ENV_TEMPLATE: &str = "VIBEKIT_TEMPLATE";

/// Prompts longer than this produce a warning.
const LONG_PROMPT_CHARS: usize = 100_000;

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Configuration(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for PromptRequest {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.prompt.trim().is_empty() {
            result.add_error("prompt cannot be empty");
        }

        if self.prompt.chars().count() > LONG_PROMPT_CHARS {
            result.add_warning("prompt over 100000 characters may exceed the model context");
        }

        result
    }
}

/// `[agent]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// If None, uses the agent type's default provider.
    pub provider: Option<ModelProvider>,
    pub model: String,
    /// Variable holding the credential. If None, uses the provider's
    /// conventional variable.
    pub api_key_env: Option<String>,
    pub cli_path: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agent_type: AgentType::Grok,
            provider: None,
            model: "grok-beta".to_string(),
            api_key_env: None,
            cli_path: None,
        }
    }
}

/// `[sandbox]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub template_id: String,
    /// Directory sandboxes are created in. If None, uses a temp directory.
    pub base_dir: Option<PathBuf>,
    pub host: String,
    pub max_sandboxes: usize,
    pub provision_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let local = LocalSandboxConfig::default();
        Self {
            template_id: DEFAULT_TEMPLATE.to_string(),
            base_dir: local.base_dir,
            host: local.host,
            max_sandboxes: local.max_sandboxes,
            provision_timeout_secs: local.provision_timeout.as_secs(),
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VibeConfig {
    pub agent: AgentSection,
    pub sandbox: SandboxSection,
    pub retry: RetryPolicy,
}

impl VibeConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Default configuration with `VIBEKIT_*` overrides from the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `VIBEKIT_*` overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(agent) = set(ENV_AGENT) {
            self.agent.agent_type = agent.parse()?;
        }
        if let Some(provider) = set(ENV_PROVIDER) {
            self.agent.provider = Some(provider.parse()?);
        }
        if let Some(model) = set(ENV_MODEL) {
            self.agent.model = model;
        }
        if let Some(template) = set(ENV_TEMPLATE) {
            self.sandbox.template_id = template;
        }

        Ok(self)
    }

    /// Provider in effect for the agent.
    pub fn provider(&self) -> ModelProvider {
        self.agent
            .provider
            .unwrap_or_else(|| self.agent.agent_type.default_provider())
    }

    /// Name of the variable the credential is read from.
    pub fn api_key_env(&self) -> &str {
        self.agent
            .api_key_env
            .as_deref()
            .unwrap_or_else(|| self.provider().api_key_env())
    }

    /// Builds the agent identity, reading the credential through `lookup`.
    ///
    /// A missing credential yields an empty key; the agent rejects it on
    /// first use.
    pub fn agent_config_with<F>(&self, lookup: F) -> AgentConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(self.api_key_env()).unwrap_or_default();
        let config = AgentConfig::new(
            self.agent.agent_type,
            self.provider(),
            self.agent.model.clone(),
            api_key,
        );
        match &self.agent.cli_path {
            Some(path) => config.with_cli_path(path.clone()),
            None => config,
        }
    }

    /// Builds the agent identity from the process environment.
    pub fn agent_config(&self) -> AgentConfig {
        self.agent_config_with(|name| std::env::var(name).ok())
    }

    pub fn sandbox_config(&self) -> LocalSandboxConfig {
        LocalSandboxConfig {
            base_dir: self.sandbox.base_dir.clone(),
            host: self.sandbox.host.clone(),
            max_sandboxes: self.sandbox.max_sandboxes,
            provision_timeout: Duration::from_secs(self.sandbox.provision_timeout_secs),
        }
    }

    /// Validates and turns the configuration into a session builder.
    pub fn builder(&self) -> Result<VibeKit> {
        for warning in self.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }

        Ok(VibeKit::new()
            .with_agent(self.agent_config())
            .with_sandbox(LocalSandboxProvider::new(self.sandbox_config()))
            .with_template(self.sandbox.template_id.clone())
            .with_retry_policy(self.retry))
    }
}

impl Validate for AgentSection {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.model.trim().is_empty() {
            result.add_error("agent model cannot be empty");
        }

        let expected = self.agent_type.default_provider();
        if let Some(provider) = self.provider {
            if provider != expected && self.agent_type != AgentType::OpenCode {
                result.add_warning(format!(
                    "agent '{}' usually runs against provider '{}', not '{}'",
                    self.agent_type, expected, provider
                ));
            }
        }

        result
    }
}

impl Validate for SandboxSection {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.template_id.trim().is_empty() {
            result.add_error("sandbox template_id cannot be empty");
        }

        if self.max_sandboxes == 0 {
            result.add_error("sandbox max_sandboxes must be at least 1");
        }

        if self.provision_timeout_secs == 0 {
            result.add_error("sandbox provision_timeout_secs must be at least 1");
        }

        result
    }
}

impl Validate for RetryPolicy {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_retries > 10 {
            result.add_warning("retry max_retries > 10 may hide a persistent outage");
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            result.add_warning("retry initial_backoff_ms exceeds max_backoff_ms");
        }

        result
    }
}

impl Validate for VibeConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.agent.validate();
        result.merge(self.sandbox.validate());
        result.merge(self.retry.validate());
        result
    }
}
