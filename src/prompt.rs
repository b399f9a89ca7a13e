//! Prompt construction for agent runs.
//!
//! Ask-mode prompts carry an instruction forbidding changes to the
//! sandbox; code-mode prompts are passed through.

use crate::agent::{Mode, PromptRequest};

/// Instruction prepended to ask-mode prompts.
pub const ASK_MODE_INSTRUCTION: &str = "Research the repository and answer the user's question. Do NOT make any changes to any files, do NOT run commands that modify state, and do NOT commit anything.";

/// Checks if a prompt already forbids modifications (case-insensitive).
pub fn prompt_forbids_changes(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    lower.contains("do not make any changes") || lower.contains("don't make any changes")
}

/// Builds the prompt text sent to the agent for `request`.
pub fn build_prompt(request: &PromptRequest) -> String {
    match request.mode {
        Mode::Code => request.prompt.clone(),
        Mode::Ask if prompt_forbids_changes(&request.prompt) => {
            tracing::debug!("prompt already forbids changes, not augmenting");
            request.prompt.clone()
        }
        Mode::Ask => format!("{}\n\n{}", ASK_MODE_INSTRUCTION, request.prompt),
    }
}
