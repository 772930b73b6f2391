// crates/server/src/thinking.rs
//! Keyword-based thinking budget detection.
//!
//! When thinking is enabled and no fixed budget is configured, the message
//! text selects the MAX_THINKING_TOKENS value passed to the spawned CLI.

/// A named thinking level with its token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingLevel {
    pub name: &'static str,
    pub budget_tokens: u32,
}

const ULTRATHINK: ThinkingLevel = ThinkingLevel {
    name: "ultrathink",
    budget_tokens: 31_999,
};
const MEGATHINK: ThinkingLevel = ThinkingLevel {
    name: "megathink",
    budget_tokens: 10_000,
};
const THINK: ThinkingLevel = ThinkingLevel {
    name: "think",
    budget_tokens: 4_000,
};
const NONE: ThinkingLevel = ThinkingLevel {
    name: "none",
    budget_tokens: 0,
};

/// Pick the thinking level for a message. Strongest keyword wins.
pub fn detect_thinking_level(message: &str) -> ThinkingLevel {
    let lower = message.to_lowercase();
    if lower.contains("ultrathink") {
        ULTRATHINK
    } else if lower.contains("megathink")
        || lower.contains("think harder")
        || lower.contains("think hard")
    {
        MEGATHINK
    } else if lower.contains("think") {
        THINK
    } else {
        NONE
    }
}
