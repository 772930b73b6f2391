// crates/core/src/opencode/normalize.rs
//! Normalization of message+parts entries into [`NormalizedMessage`].

use serde_json::Value;

use super::tailer::format_unix_ms;
use crate::message::{ContentBlock, MessageUsage, NormalizedMessage, Role};
use crate::pricing::message_cost;

/// Normalize one `{info, parts}` entry. Returns None when nothing renders.
pub fn normalize(raw: &Value) -> Option<NormalizedMessage> {
    let info = raw.get("info")?;
    let parts = raw.get("parts").and_then(Value::as_array)?;

    let role = match info.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };

    let timestamp = info
        .pointer("/time/created")
        .and_then(Value::as_f64)
        .and_then(format_unix_ms)
        .unwrap_or_default();

    let blocks: Vec<ContentBlock> = parts.iter().flat_map(part_blocks).collect();
    if blocks.is_empty() {
        return None;
    }

    let model = model_id(info);
    let usage = extract_usage(info, parts, model.as_deref());

    Some(NormalizedMessage {
        role,
        timestamp,
        blocks,
        model,
        // The directory format has no stop_reason; readiness already
        // guarantees the turn is complete.
        stop_reason: None,
        usage,
    })
}

fn model_id(info: &Value) -> Option<String> {
    let model = info.get("modelID").and_then(Value::as_str)?;
    match info.get("providerID").and_then(Value::as_str) {
        Some(provider) => Some(format!("{provider}/{model}")),
        None => Some(model.to_string()),
    }
}

/// Map one part to zero, one, or two content blocks.
fn part_blocks(part: &Value) -> Vec<ContentBlock> {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => part
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| vec![ContentBlock::Text { text: t.to_string() }])
            .unwrap_or_default(),
        Some("reasoning") => part
            .get("reasoning")
            .or_else(|| part.get("text"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| vec![ContentBlock::Thinking { text: t.to_string() }])
            .unwrap_or_default(),
        Some("tool") => tool_blocks(part),
        Some("file") => file_block(part).into_iter().collect(),
        // step markers, snapshots, patches and other internal part types
        // render to nothing.
        _ => Vec::new(),
    }
}

/// A completed tool becomes tool_use + tool_result; an errored tool a
/// tool_result with is_error; a pending/running tool the tool_use alone.
fn tool_blocks(part: &Value) -> Vec<ContentBlock> {
    let tool_name = part
        .get("tool")
        .and_then(Value::as_str)
        .or_else(|| part.get("name").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string();
    let tool_id = part
        .get("callID")
        .and_then(Value::as_str)
        .or_else(|| part.get("id").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();
    let state = part.get("state").cloned().unwrap_or(Value::Null);
    let status = state.get("status").and_then(Value::as_str).unwrap_or("pending");
    let tool_input = state.get("input").cloned().unwrap_or(Value::Null);

    let tool_use = ContentBlock::ToolUse {
        tool_name,
        tool_id: tool_id.clone(),
        tool_input,
    };

    match status {
        "completed" => {
            let content = state.get("output").cloned();
            vec![
                tool_use,
                ContentBlock::ToolResult {
                    tool_use_id: tool_id,
                    content,
                    is_error: false,
                },
            ]
        }
        "error" => {
            let error_text = state
                .get("error")
                .cloned()
                .unwrap_or(Value::String(String::new()));
            vec![
                tool_use,
                ContentBlock::ToolResult {
                    tool_use_id: tool_id,
                    content: Some(error_text),
                    is_error: true,
                },
            ]
        }
        _ => vec![tool_use],
    }
}

fn file_block(part: &Value) -> Option<ContentBlock> {
    let mime = part.get("mime").and_then(Value::as_str)?;
    if !mime.starts_with("image/") {
        return None;
    }
    let data = part.get("data").and_then(Value::as_str)?;
    Some(ContentBlock::Image {
        media_type: mime.to_string(),
        data: data.to_string(),
    })
}

/// Usage from the message's top-level tokens, falling back to the last
/// step-finish part.
fn extract_usage(info: &Value, parts: &[Value], model: Option<&str>) -> Option<MessageUsage> {
    let tokens = info
        .get("tokens")
        .filter(|t| t.is_object() && !t.as_object().unwrap().is_empty())
        .or_else(|| {
            parts
                .iter()
                .rev()
                .find(|p| p.get("type").and_then(Value::as_str) == Some("step-finish"))
                .and_then(|p| p.get("tokens"))
        })?;

    let get = |key: &str| tokens.get(key).and_then(Value::as_u64).unwrap_or(0);
    let cache = tokens.get("cache").cloned().unwrap_or(Value::Null);
    let cache_get = |key: &str| cache.get(key).and_then(Value::as_u64).unwrap_or(0);

    let input_tokens = get("input");
    let output_tokens = get("output");
    let cache_read_tokens = cache_get("read");
    let cache_creation_tokens = cache_get("write");

    let cost = info
        .get("cost")
        .and_then(Value::as_f64)
        .filter(|c| *c > 0.0)
        .unwrap_or_else(|| {
            message_cost(
                model,
                input_tokens,
                output_tokens,
                cache_creation_tokens,
                cache_read_tokens,
            )
        });

    let usage = MessageUsage {
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cost,
    };
    (!usage.is_empty()).then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(role: &str, parts: Value) -> Value {
        json!({
            "info": {
                "id": "msg_1",
                "role": role,
                "modelID": "claude-sonnet-4-5",
                "providerID": "anthropic",
                "time": {"created": 1_704_067_200_000u64}
            },
            "parts": parts
        })
    }

    #[test]
    fn reasoning_maps_to_thinking() {
        let raw = entry(
            "assistant",
            json!([
                {"type": "reasoning", "reasoning": "pondering"},
                {"type": "text", "text": "answer"},
                {"type": "step-finish", "tokens": {"input": 1, "output": 1}}
            ]),
        );
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 2);
        assert_eq!(
            msg.blocks[0],
            ContentBlock::Thinking {
                text: "pondering".into()
            }
        );
        assert_eq!(msg.model.as_deref(), Some("anthropic/claude-sonnet-4-5"));
    }

    #[test]
    fn completed_tool_emits_use_and_result() {
        let raw = entry(
            "assistant",
            json!([{
                "type": "tool",
                "tool": "bash",
                "callID": "toolu_1",
                "state": {
                    "status": "completed",
                    "input": {"command": "echo hi"},
                    "output": "hi\n"
                }
            }]),
        );
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 2);
        assert!(matches!(&msg.blocks[0], ContentBlock::ToolUse { tool_name, .. } if tool_name == "bash"));
        assert!(matches!(
            &msg.blocks[1],
            ContentBlock::ToolResult { is_error: false, .. }
        ));
    }

    #[test]
    fn errored_tool_sets_is_error() {
        let raw = entry(
            "assistant",
            json!([{
                "type": "tool",
                "tool": "bash",
                "callID": "toolu_2",
                "state": {"status": "error", "input": {}, "error": "boom"}
            }]),
        );
        let msg = normalize(&raw).unwrap();
        match &msg.blocks[1] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert_eq!(content.as_ref().unwrap(), &json!("boom"));
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn pending_tool_emits_use_only() {
        let raw = entry(
            "assistant",
            json!([{
                "type": "tool",
                "tool": "read",
                "callID": "toolu_3",
                "state": {"status": "running", "input": {"path": "/x"}}
            }]),
        );
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 1);
        assert!(matches!(msg.blocks[0], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn internal_parts_are_dropped() {
        let raw = entry(
            "assistant",
            json!([
                {"type": "step-start"},
                {"type": "snapshot", "data": "x"},
                {"type": "patch", "hunks": []},
                {"type": "text", "text": "visible"},
                {"type": "step-finish", "tokens": {"input": 1, "output": 1}}
            ]),
        );
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.blocks.len(), 1);
    }

    #[test]
    fn usage_falls_back_to_step_finish() {
        let raw = json!({
            "info": {
                "id": "msg_1",
                "role": "assistant",
                "modelID": "claude-sonnet-4-5",
                "time": {"created": 1_704_067_200_000u64}
            },
            "parts": [
                {"type": "text", "text": "hi"},
                {
                    "type": "step-finish",
                    "tokens": {"input": 100, "output": 50, "cache": {"read": 10, "write": 5}}
                }
            ]
        });
        let msg = normalize(&raw).unwrap();
        let usage = msg.usage.unwrap();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.cache_read_tokens, 10);
        assert_eq!(usage.cache_creation_tokens, 5);
        assert!(usage.cost > 0.0);
    }

    #[test]
    fn empty_parts_normalize_to_none() {
        let raw = entry("assistant", json!([{"type": "step-start"}]));
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn normalization_is_stable() {
        let raw = entry(
            "user",
            json!([{"type": "text", "text": "Hello, how are you?"}]),
        );
        let once = normalize(&raw).unwrap();
        let twice = normalize(&raw).unwrap();
        assert_eq!(once, twice);

        let json = serde_json::to_string(&once).unwrap();
        let back: NormalizedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(once, back);
    }
}
