// crates/core/src/message.rs
//! Backend-agnostic message representation.
//!
//! Both adapters normalize their raw on-disk records into
//! [`NormalizedMessage`] values built from a small union of content blocks.
//! This is what the SSE stream and REST endpoints carry to clients.

use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single content block within a message.
///
/// Serialized with an external `type` tag so the wire format matches the
/// block schema used inside the transcripts themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        tool_name: String,
        tool_id: String,
        tool_input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or list of content parts, kept opaque.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        /// Base64 payload.
        data: String,
    },
}

/// Per-message token usage attached for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl MessageUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cache_read_tokens == 0
    }
}

/// Backend-agnostic message representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: Role,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<MessageUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_block_tagged_serialization() {
        let block = ContentBlock::ToolUse {
            tool_name: "Bash".into(),
            tool_id: "toolu_1".into(),
            tool_input: serde_json::json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["tool_name"], "Bash");
    }

    #[test]
    fn tool_result_omits_absent_content() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: None,
            is_error: false,
        };
        let value = serde_json::to_value(&block).unwrap();
        assert!(value.get("content").is_none());
        assert_eq!(value["is_error"], false);
    }

    #[test]
    fn message_serde_round_trip_is_stable() {
        let msg = NormalizedMessage {
            role: Role::Assistant,
            timestamp: "2024-12-30T10:00:01Z".into(),
            blocks: vec![
                ContentBlock::Thinking {
                    text: "hmm".into(),
                },
                ContentBlock::Text {
                    text: "Hello".into(),
                },
            ],
            model: Some("claude-sonnet-4-5".into()),
            stop_reason: Some("end_turn".into()),
            usage: Some(MessageUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            }),
        };

        let json = serde_json::to_string(&msg).unwrap();
        let back: NormalizedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let msg = NormalizedMessage {
            role: Role::User,
            timestamp: "2024-12-30T10:00:00Z".into(),
            blocks: vec![ContentBlock::Text { text: "Hi".into() }],
            model: None,
            stop_reason: None,
            usage: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("model").is_none());
        assert!(value.get("stop_reason").is_none());
        assert!(value.get("usage").is_none());
    }
}
