//! Frame model for the runtime's streaming protocol
//!
//! Each `data:` record from the runtime is a JSON object in one of a few known
//! shapes. Decoding turns it into one or more [`RawFrame`]s. Shapes we do not
//! know are kept as [`RawFrame::Unrecognized`] instead of being guessed at.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::events::TokenUsage;

/// Why the model stopped producing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::Other(raw) => raw,
        }
    }

    /// Whether this reason finishes the turn (as opposed to pausing for a tool)
    pub fn ends_turn(&self) -> bool {
        matches!(self, Self::EndTurn | Self::MaxTokens | Self::StopSequence)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseStart {
    pub tool_use_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub status: String,
    pub payload: Value,
}

/// One delivery unit from the runtime bridge
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Error { message: String },
    TokenUsage(TokenUsage),
    MessageStart { role: String },
    SegmentStart {
        index: Option<u64>,
        tool_use: Option<ToolUseStart>,
    },
    TextDelta { index: Option<u64>, text: String },
    ToolInputDelta { index: Option<u64>, input: String },
    SegmentStop { index: Option<u64> },
    MessageStop { stop_reason: StopReason },
    /// Finalized message carrying tool results
    ToolResults {
        role: String,
        results: Vec<ToolResult>,
    },
    Unrecognized(Value),
}

// Wire shapes. Field names follow the runtime's camelCase JSON.

#[derive(Deserialize)]
struct Record {
    error: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<String>,
    usage: Option<TokenUsage>,
    event: Option<StreamEvent>,
    message: Option<WireMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEvent {
    message_start: Option<MessageStartWire>,
    content_block_delta: Option<BlockDeltaWire>,
    content_block_start: Option<BlockStartWire>,
    content_block_stop: Option<BlockStopWire>,
    message_stop: Option<MessageStopWire>,
}

#[derive(Deserialize)]
struct MessageStartWire {
    #[serde(default)]
    role: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDeltaWire {
    #[serde(default)]
    delta: DeltaWire,
    content_block_index: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeltaWire {
    text: Option<String>,
    tool_use: Option<ToolInputWire>,
}

#[derive(Deserialize)]
struct ToolInputWire {
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStartWire {
    #[serde(default)]
    start: BlockStartBody,
    content_block_index: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BlockStartBody {
    tool_use: Option<ToolUseStartWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStartWire {
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStopWire {
    content_block_index: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStopWire {
    #[serde(default)]
    stop_reason: String,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Vec<Value>,
}

/// Decode one runtime record into frames, in delivery order.
pub fn decode_record(value: Value) -> Vec<RawFrame> {
    let record: Record = match Record::deserialize(&value) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!("Record did not match a known shape: {}", e);
            return vec![RawFrame::Unrecognized(value)];
        }
    };

    if let Some(error) = record.error {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return vec![RawFrame::Error { message }];
    }

    if record.kind.as_deref() == Some("token_usage") {
        return match record.usage {
            Some(usage) => vec![RawFrame::TokenUsage(usage)],
            None => vec![RawFrame::Unrecognized(value)],
        };
    }

    let mut frames = Vec::new();

    if let Some(event) = record.event {
        if let Some(start) = event.message_start {
            frames.push(RawFrame::MessageStart { role: start.role });
        }
        if let Some(delta) = event.content_block_delta {
            let index = delta.content_block_index;
            if let Some(text) = delta.delta.text {
                frames.push(RawFrame::TextDelta { index, text });
            } else if let Some(tool) = delta.delta.tool_use {
                frames.push(RawFrame::ToolInputDelta {
                    index,
                    input: tool.input,
                });
            }
        }
        if let Some(start) = event.content_block_start {
            frames.push(RawFrame::SegmentStart {
                index: start.content_block_index,
                tool_use: start.start.tool_use.map(|t| ToolUseStart {
                    tool_use_id: t.tool_use_id,
                    name: t.name,
                }),
            });
        }
        if let Some(stop) = event.content_block_stop {
            frames.push(RawFrame::SegmentStop {
                index: stop.content_block_index,
            });
        }
        if let Some(stop) = event.message_stop {
            frames.push(RawFrame::MessageStop {
                stop_reason: StopReason::parse(&stop.stop_reason),
            });
        }
    }

    if let Some(message) = record.message {
        let results = tool_results(&message.content);
        if !results.is_empty() {
            frames.push(RawFrame::ToolResults {
                role: message.role,
                results,
            });
        }
    }

    if frames.is_empty() {
        frames.push(RawFrame::Unrecognized(value));
    }
    frames
}

fn tool_results(content: &[Value]) -> Vec<ToolResult> {
    content
        .iter()
        .filter_map(|item| item.get("toolResult"))
        .filter_map(|result| {
            let tool_use_id = result.get("toolUseId").and_then(|v| v.as_str())?;
            let status = result
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("success");
            let payload = result
                .get("content")
                .and_then(|v| v.as_array())
                .and_then(|items| items.iter().rev().find_map(result_payload))
                .unwrap_or(Value::Null);

            Some(ToolResult {
                tool_use_id: tool_use_id.to_string(),
                status: status.to_string(),
                payload,
            })
        })
        .collect()
}

/// Later items win, so callers scan from the end.
fn result_payload(item: &Value) -> Option<Value> {
    if let Some(data) = item.get("json") {
        return Some(match data {
            Value::String(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            other => other.clone(),
        });
    }
    item.get("text")
        .and_then(|v| v.as_str())
        .map(|text| json!({ "text": text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_delta() {
        let frames = decode_record(json!({
            "event": {"contentBlockDelta": {"delta": {"text": "Hello "}, "contentBlockIndex": 0}}
        }));
        assert_eq!(
            frames,
            vec![RawFrame::TextDelta {
                index: Some(0),
                text: "Hello ".into()
            }]
        );
    }

    #[test]
    fn decodes_tool_segment_lifecycle() {
        let start = decode_record(json!({
            "event": {"contentBlockStart": {
                "start": {"toolUse": {"toolUseId": "tu_1", "name": "get_cost"}},
                "contentBlockIndex": 1
            }}
        }));
        assert_eq!(
            start,
            vec![RawFrame::SegmentStart {
                index: Some(1),
                tool_use: Some(ToolUseStart {
                    tool_use_id: "tu_1".into(),
                    name: "get_cost".into()
                })
            }]
        );

        let delta = decode_record(json!({
            "event": {"contentBlockDelta": {"delta": {"toolUse": {"input": "{\"a\":"}}, "contentBlockIndex": 1}}
        }));
        assert_eq!(
            delta,
            vec![RawFrame::ToolInputDelta {
                index: Some(1),
                input: "{\"a\":".into()
            }]
        );
    }

    #[test]
    fn decodes_error_and_usage() {
        assert_eq!(
            decode_record(json!({"error": "boom"})),
            vec![RawFrame::Error {
                message: "boom".into()
            }]
        );

        let frames = decode_record(json!({
            "type": "token_usage",
            "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_tokens": 2, "cache_write_tokens": 1}
        }));
        match &frames[..] {
            [RawFrame::TokenUsage(usage)] => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.cache_write_tokens, 1);
                assert!(usage.input_cache_hit_rate.is_none());
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn tool_result_payload_prefers_last_item() {
        let frames = decode_record(json!({
            "message": {"role": "user", "content": [{"toolResult": {
                "toolUseId": "tu_1",
                "status": "success",
                "content": [{"text": "first"}, {"json": "{\"total\": 42}"}]
            }}]}
        }));
        match &frames[..] {
            [RawFrame::ToolResults { role, results }] => {
                assert_eq!(role, "user");
                assert_eq!(results[0].tool_use_id, "tu_1");
                assert_eq!(results[0].payload, json!({"total": 42}));
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn text_only_tool_result_is_wrapped() {
        let frames = decode_record(json!({
            "message": {"role": "assistant", "content": [{"toolResult": {
                "toolUseId": "tu_2",
                "content": [{"text": "done"}]
            }}]}
        }));
        match &frames[..] {
            [RawFrame::ToolResults { results, .. }] => {
                assert_eq!(results[0].payload, json!({"text": "done"}));
                assert_eq!(results[0].status, "success");
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn unknown_shapes_are_unrecognized() {
        let value = json!({"heartbeat": true});
        assert_eq!(
            decode_record(value.clone()),
            vec![RawFrame::Unrecognized(value)]
        );
        assert!(matches!(
            decode_record(json!("just a string"))[..],
            [RawFrame::Unrecognized(_)]
        ));
    }

    #[test]
    fn stop_reasons() {
        assert!(StopReason::parse("end_turn").ends_turn());
        assert!(StopReason::parse("max_tokens").ends_turn());
        assert!(!StopReason::parse("tool_use").ends_turn());
        let other = StopReason::parse("guardrail_intervened");
        assert!(!other.ends_turn());
        assert_eq!(other.as_str(), "guardrail_intervened");
    }
}
