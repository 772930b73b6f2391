// crates/core/src/claude_code/normalize.rs
//! Normalization of raw JSONL records into [`NormalizedMessage`].

use serde_json::Value;

use crate::message::{ContentBlock, MessageUsage, NormalizedMessage, Role};
use crate::pricing::{estimate_output_tokens, message_cost};

/// Text the CLI writes for an assistant turn that produced no output.
const EMPTY_OUTPUT_PLACEHOLDER: &str = "(no content)";

/// Normalize one raw JSONL record. Returns None for records that render to
/// nothing (wrong type, empty content, bare placeholder turns).
pub fn normalize(raw: &Value) -> Option<NormalizedMessage> {
    let role = match raw.get("type").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };

    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let message = raw.get("message")?;
    let blocks = content_blocks(message.get("content")?);
    if blocks.is_empty() {
        return None;
    }

    let model = message
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let stop_reason = message
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    // A lone placeholder block is streaming noise unless the record carries
    // a stop_reason, in which case it is a real empty turn.
    if role == Role::Assistant && stop_reason.is_none() && is_placeholder_only(&blocks) {
        return None;
    }

    let usage = message
        .get("usage")
        .map(|u| extract_usage(u, model.as_deref(), &blocks))
        .filter(|u| !u.is_empty());

    Some(NormalizedMessage {
        role,
        timestamp,
        blocks,
        model,
        stop_reason,
        usage,
    })
}

fn is_placeholder_only(blocks: &[ContentBlock]) -> bool {
    matches!(
        blocks,
        [ContentBlock::Text { text }] if text == EMPTY_OUTPUT_PLACEHOLDER
    )
}

/// Map raw content (string or block array) to the normalized block union.
fn content_blocks(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: s.clone() }]
            }
        }
        Value::Array(items) => items.iter().filter_map(raw_block).collect(),
        _ => Vec::new(),
    }
}

fn raw_block(item: &Value) -> Option<ContentBlock> {
    match item.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentBlock::Text {
            text: item.get("text").and_then(Value::as_str)?.to_string(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            text: item
                .get("thinking")
                .or_else(|| item.get("text"))
                .and_then(Value::as_str)?
                .to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            tool_name: item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            tool_id: item
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_input: item.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: item
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: item.get("content").cloned(),
            is_error: item
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "image" => {
            let source = item.get("source")?;
            Some(ContentBlock::Image {
                media_type: source
                    .get("media_type")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string(),
                data: source
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        // Step markers, snapshots and other transcript-internal block types
        // render to nothing.
        _ => None,
    }
}

/// Per-message usage for display. Recorded output counts are per-chunk and
/// unreliable for streamed messages, so output tokens are re-estimated from
/// the rendered text length.
fn extract_usage(usage: &Value, model: Option<&str>, blocks: &[ContentBlock]) -> MessageUsage {
    let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);

    let input_tokens = get("input_tokens");
    let cache_creation_tokens = get("cache_creation_input_tokens");
    let cache_read_tokens = get("cache_read_input_tokens");

    let content_chars: usize = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } | ContentBlock::Thinking { text } => text.len(),
            _ => 0,
        })
        .sum();
    let output_tokens = if content_chars > 0 {
        estimate_output_tokens(content_chars)
    } else {
        get("output_tokens")
    };

    let cost = message_cost(
        model,
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
    );

    MessageUsage {
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn user_string_content_becomes_text_block() {
        let raw = json!({
            "type": "user",
            "timestamp": "2024-12-30T10:00:00Z",
            "message": {"content": "Hi"}
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.blocks, vec![ContentBlock::Text { text: "Hi".into() }]);
    }

    #[test]
    fn assistant_blocks_map_to_union() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:01Z",
            "message": {
                "model": "claude-sonnet-4-5",
                "stop_reason": "tool_use",
                "content": [
                    {"type": "thinking", "thinking": "let me check"},
                    {"type": "text", "text": "Running it"},
                    {"type": "tool_use", "name": "Bash", "id": "t1", "input": {"command": "ls"}}
                ]
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 3);
        assert!(matches!(msg.blocks[0], ContentBlock::Thinking { .. }));
        assert!(matches!(msg.blocks[2], ContentBlock::ToolUse { .. }));
        assert_eq!(msg.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn tool_result_user_record_is_kept() {
        let raw = json!({
            "type": "user",
            "timestamp": "2024-12-30T10:00:02Z",
            "message": {
                "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok", "is_error": false}
                ]
            }
        });
        let msg = normalize(&raw).unwrap();
        assert!(matches!(msg.blocks[0], ContentBlock::ToolResult { .. }));
    }

    #[test]
    fn bare_placeholder_is_dropped() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:03Z",
            "message": {"content": [{"type": "text", "text": "(no content)"}]}
        });
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn placeholder_with_stop_reason_is_a_real_empty_turn() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:03Z",
            "message": {
                "stop_reason": "end_turn",
                "content": [{"type": "text", "text": "(no content)"}]
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn unknown_block_types_are_dropped() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:04Z",
            "message": {
                "content": [
                    {"type": "server_tool_use", "id": "x"},
                    {"type": "text", "text": "visible"}
                ]
            }
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 1);
    }

    #[test]
    fn non_message_records_normalize_to_none() {
        assert!(normalize(&json!({"type": "system", "data": "x"})).is_none());
        assert!(normalize(&json!({"type": "summary"})).is_none());
    }

    #[test]
    fn usage_estimates_output_from_content() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:05Z",
            "message": {
                "model": "claude-sonnet-4-5",
                "usage": {"input_tokens": 100, "output_tokens": 3, "cache_read_input_tokens": 50},
                "content": [{"type": "text", "text": "x".repeat(400)}]
            }
        });
        let msg = normalize(&raw).unwrap();
        let usage = msg.usage.unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cache_read_tokens, 50);
        // 400 chars / 4 per token, not the recorded per-chunk count.
        assert_eq!(usage.output_tokens, 100);
        assert!(usage.cost > 0.0);
    }

    #[test]
    fn normalization_is_stable() {
        let raw = json!({
            "type": "assistant",
            "timestamp": "2024-12-30T10:00:06Z",
            "message": {
                "model": "claude-sonnet-4-5",
                "stop_reason": "end_turn",
                "content": [{"type": "text", "text": "Hello"}]
            }
        });
        let once = normalize(&raw).unwrap();
        let twice = normalize(&raw).unwrap();
        assert_eq!(once, twice);

        // Serde round trip preserves the normalized form.
        let json = serde_json::to_string(&once).unwrap();
        let back: NormalizedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(once, back);
    }
}
