// crates/server/src/config.rs
//! Server configuration: one plain record built from CLI flags.

use std::path::PathBuf;

use clap::Parser;

/// Recognized options, threaded through [`crate::AppState`] at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry cap; the oldest session is evicted beyond this.
    pub max_sessions: usize,
    pub send_enabled: bool,
    pub fork_enabled: bool,
    pub skip_permissions: bool,
    /// Backend used for new sessions when the request names none.
    pub default_send_backend: Option<String>,
    pub include_subagents: bool,
    /// Keyword-based thinking level detection for sent messages.
    pub enable_thinking: bool,
    /// Fixed MAX_THINKING_TOKENS budget; overrides keyword detection.
    pub thinking_budget: Option<u32>,
    /// Re-summarize after this many idle seconds.
    pub summarize_after_idle_s: Option<u64>,
    pub idle_summary_model: String,
    /// Summarize after a CLI run at least this long.
    pub summary_after_long_running_s: Option<u64>,
    /// Append-only JSONL log of generated summaries.
    pub summary_log_path: Option<PathBuf>,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            send_enabled: true,
            fork_enabled: false,
            skip_permissions: false,
            default_send_backend: None,
            include_subagents: false,
            enable_thinking: false,
            thinking_budget: None,
            summarize_after_idle_s: None,
            idle_summary_model: "haiku".into(),
            summary_after_long_running_s: None,
            summary_log_path: None,
            port: 8998,
        }
    }
}

/// Command-line flags of the `tailboard` binary.
#[derive(Debug, Parser)]
#[command(name = "tailboard", about = "Live session tracker for coding assistants")]
pub struct Cli {
    /// Maximum number of tracked sessions.
    #[arg(long, default_value_t = 100)]
    pub max_sessions: usize,

    /// Disable sending messages to sessions.
    #[arg(long)]
    pub disable_send: bool,

    /// Enable the fork button.
    #[arg(long)]
    pub fork: bool,

    /// Skip CLI permission prompts (passes the CLI's skip flag).
    #[arg(long)]
    pub dangerously_skip_permissions: bool,

    /// Default backend for new sessions (e.g. "claude-code").
    #[arg(long)]
    pub default_send_backend: Option<String>,

    /// Track subagent sessions too.
    #[arg(long)]
    pub include_subagents: bool,

    /// Enable thinking-level keyword detection.
    #[arg(long)]
    pub enable_thinking: bool,

    /// Fixed thinking token budget (overrides keyword detection).
    #[arg(long)]
    pub thinking_budget: Option<u32>,

    /// Seconds of idle before re-summarizing a session.
    #[arg(long)]
    pub summarize_after_idle: Option<u64>,

    /// Model used for idle summarization.
    #[arg(long, default_value = "haiku")]
    pub idle_summary_model: String,

    /// Summarize after any CLI run of at least this many seconds.
    #[arg(long)]
    pub summary_after_long_running: Option<u64>,

    /// JSONL file receiving one record per generated summary.
    #[arg(long)]
    pub summary_log: Option<PathBuf>,

    /// Port to bind on loopback.
    #[arg(long, default_value_t = 8998)]
    pub port: u16,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            max_sessions: cli.max_sessions,
            send_enabled: !cli.disable_send,
            fork_enabled: cli.fork,
            skip_permissions: cli.dangerously_skip_permissions,
            default_send_backend: cli.default_send_backend,
            include_subagents: cli.include_subagents,
            enable_thinking: cli.enable_thinking,
            thinking_budget: cli.thinking_budget,
            summarize_after_idle_s: cli.summarize_after_idle,
            idle_summary_model: cli.idle_summary_model,
            summary_after_long_running_s: cli.summary_after_long_running,
            summary_log_path: cli.summary_log,
            port: cli.port,
        }
    }
}
