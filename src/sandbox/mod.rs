//! Sandbox module for isolated agent execution environments.
//!
//! This module provides the [`SandboxProvider`] trait for provisioning
//! sandboxes and the [`LocalSandboxProvider`] implementation backed by
//! scratch directories and local processes.

mod local;
mod provider;

pub use local::{LocalSandboxConfig, LocalSandboxProvider};
pub use provider::{
    ExitInfo, ProcessOutput, SandboxCommand, SandboxHandle, SandboxId, SandboxProvider,
};
