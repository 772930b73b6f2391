// crates/core/src/opencode/cli.rs
//! CLI command construction for the `opencode` binary.
//!
//! OpenCode ignores permission flags and machine-readable output modes;
//! permissions are configured through its own config file.

use crate::backend::{CommandOptions, CommandSpec};

pub const CLI_COMMAND: &str = "opencode";

pub const CLI_INSTALL_INSTRUCTIONS: &str = "Install with: npm install -g opencode-ai";

pub fn build_send_command(session_id: &str, message: &str, _opts: &CommandOptions) -> CommandSpec {
    CommandSpec {
        args: vec![
            CLI_COMMAND.into(),
            "run".into(),
            "-s".into(),
            session_id.into(),
        ],
        stdin: Some(message.to_string()),
    }
}

pub fn build_new_session_command(
    message: &str,
    model: Option<&str>,
    _opts: &CommandOptions,
) -> CommandSpec {
    let mut args: Vec<String> = vec![CLI_COMMAND.into(), "run".into()];
    if let Some(model) = model {
        args.push("-m".into());
        args.push(model.into());
    }
    CommandSpec {
        args,
        stdin: Some(message.to_string()),
    }
}

/// Provider-qualified model identifiers accepted by `-m`.
pub fn available_models() -> Vec<String> {
    [
        "anthropic/claude-opus-4-5",
        "anthropic/claude-sonnet-4-5",
        "anthropic/claude-haiku-4-5",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
