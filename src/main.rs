//! Vibe Orchestrator CLI
//!
//! Runs a single prompt against a sandboxed agent and prints the result.

use std::process::ExitCode;

use vibe_orchestrator::{
    AgentOutput, EventKind, LifecycleEvent, PromptRequest, Session, VibeConfig,
};

fn usage(program: &str) {
    eprintln!("Usage: {} [--code] <prompt>", program);
    eprintln!("\nRuns the prompt with a sandboxed agent (ask mode unless --code).");
    eprintln!("\nEnvironment variables:");
    eprintln!("  VIBEKIT_CONFIG    Path to a TOML configuration file");
    eprintln!("  VIBEKIT_AGENT     claude|codex|gemini|grok|opencode (default: grok)");
    eprintln!("  VIBEKIT_PROVIDER  Model provider override");
    eprintln!("  VIBEKIT_MODEL     Model name (default: grok-beta)");
    eprintln!("  VIBEKIT_TEMPLATE  Sandbox template id");
}

fn load_config() -> vibe_orchestrator::Result<VibeConfig> {
    match std::env::var("VIBEKIT_CONFIG") {
        Ok(path) => VibeConfig::load(path)?.with_overrides(|name| std::env::var(name).ok()),
        Err(_) => VibeConfig::from_env(),
    }
}

fn print_updates(session: &Session) {
    session.on(EventKind::Update, |event| {
        if let LifecycleEvent::Update(update) = event {
            match &update.output {
                AgentOutput::Stdout(line) => println!("{}", line),
                AgentOutput::Stderr(line) => eprintln!("{}", line),
                AgentOutput::Status(status) => tracing::info!(status = %status, "update"),
                AgentOutput::ToolCall { tool, .. } => tracing::info!(tool = %tool, "tool call"),
                AgentOutput::FileRead(path) => tracing::debug!(path = %path.display(), "file read"),
                AgentOutput::FileWrite(path) => tracing::info!(path = %path.display(), "file write"),
            }
        }
    });
    session.on(EventKind::Error, |event| {
        let request_id = event.request_id().map(ToString::to_string).unwrap_or_default();
        if let LifecycleEvent::Error(error) = event {
            tracing::error!(
                request_id = %request_id,
                kind = ?error.kind,
                message = %error.message,
                "session error"
            );
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("vibe-orchestrator");

    let code_mode = args.iter().skip(1).any(|a| a == "--code");
    let prompt = args
        .iter()
        .skip(1)
        .filter(|a| *a != "--code")
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");

    if prompt.trim().is_empty() {
        usage(program);
        return ExitCode::FAILURE;
    }

    let session = match load_config().and_then(|config| config.builder()?.build()) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Configuration failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    print_updates(&session);

    let request = if code_mode {
        PromptRequest::code(prompt)
    } else {
        PromptRequest::ask(prompt)
    };

    tracing::info!(session_id = %session.id(), mode = ?request.mode, "starting session");
    let outcome = session.generate_code(request).await;

    match session.get_host(3000).await {
        Ok(host) => println!("Host: {}", host),
        Err(e) => tracing::debug!(error = %e, "no host for port 3000"),
    }

    if let Err(e) = session.kill().await {
        tracing::warn!(error = %e, "failed to release session");
    }

    match outcome {
        Ok(result) => {
            println!("\n{}", "=".repeat(60));
            println!("Request Complete: {}", result.request_id);
            println!("{}", "=".repeat(60));
            println!();
            println!("Status: {:?}", result.status);
            println!("Sandbox: {}", result.sandbox_id);
            println!("Duration: {:?}", result.duration);
            if let Some(usage) = result.usage {
                println!("Tokens: {}", usage.total());
            }
            println!();
            println!("{}", result.content);

            if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Request failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
