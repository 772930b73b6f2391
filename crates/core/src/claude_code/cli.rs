// crates/core/src/claude_code/cli.rs
//! CLI command construction for the `claude` binary.

use crate::backend::{CommandOptions, CommandSpec, OutputFormat};

pub const CLI_COMMAND: &str = "claude";

pub const CLI_INSTALL_INSTRUCTIONS: &str =
    "Install with: npm install -g @anthropic-ai/claude-code";

/// Flags shared by all three builders. The message itself always travels on
/// stdin so shell quoting never applies to user content.
fn push_common_flags(args: &mut Vec<String>, opts: &CommandOptions) {
    if opts.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    }
    match opts.output_format {
        Some(OutputFormat::StreamJson) => {
            args.push("--output-format".into());
            args.push("stream-json".into());
            // stream-json requires verbose mode to emit per-message records.
            args.push("--verbose".into());
        }
        Some(OutputFormat::Json) => {
            args.push("--output-format".into());
            args.push("json".into());
        }
        None => {}
    }
    for dir in &opts.add_dirs {
        args.push("--add-dir".into());
        args.push(dir.clone());
    }
}

pub fn build_send_command(session_id: &str, message: &str, opts: &CommandOptions) -> CommandSpec {
    let mut args: Vec<String> = vec![
        CLI_COMMAND.into(),
        "-p".into(),
        "--resume".into(),
        session_id.into(),
    ];
    push_common_flags(&mut args, opts);
    CommandSpec {
        args,
        stdin: Some(message.to_string()),
    }
}

pub fn build_fork_command(session_id: &str, message: &str, opts: &CommandOptions) -> CommandSpec {
    let mut args: Vec<String> = vec![
        CLI_COMMAND.into(),
        "-p".into(),
        "--resume".into(),
        session_id.into(),
        "--fork-session".into(),
    ];
    push_common_flags(&mut args, opts);
    CommandSpec {
        args,
        stdin: Some(message.to_string()),
    }
}

pub fn build_new_session_command(
    message: &str,
    model: Option<&str>,
    opts: &CommandOptions,
) -> CommandSpec {
    let mut args: Vec<String> = vec![CLI_COMMAND.into(), "-p".into()];
    if let Some(model) = model {
        args.push("--model".into());
        args.push(model.into());
    }
    push_common_flags(&mut args, opts);
    CommandSpec {
        args,
        stdin: Some(message.to_string()),
    }
}

/// Model aliases accepted by `--model`, latest aliases first.
pub fn available_models() -> Vec<String> {
    [
        "opus",
        "sonnet",
        "haiku",
        "claude-opus-4-5",
        "claude-sonnet-4-5",
        "claude-haiku-4-5",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
