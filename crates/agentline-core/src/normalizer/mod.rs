//! Runtime frame normalizer
//!
//! Turns the runtime's frames into [`QueryEvent`]s. One instance per query;
//! it carries the text buffer, pending tool-use segments and the set of tool
//! call ids already announced, so duplicates from upstream are suppressed and
//! every tool result refers to a call the client has already seen.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::events::{CompletionMeta, QueryEvent};
use crate::runtime::{RawFrame, StopReason, ToolResult, ToolUseStart};

mod markup;

use markup::{Markup, MarkupScanner};

/// Milliseconds since the Unix epoch
pub type Clock = fn() -> i64;

fn system_clock() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tool-use segment whose input is still streaming
#[derive(Debug)]
struct PendingToolCall {
    tool_use_id: String,
    name: String,
    input: String,
}

/// Most recent call parsed from inline markup; late parameters merge into it
#[derive(Debug)]
struct InlineCall {
    id: String,
    name: String,
    args: Map<String, Value>,
}

pub struct Normalizer {
    markup: MarkupScanner,
    /// Tool name to the id it was last announced with
    tool_ids: HashMap<String, String>,
    last_tool_id: Option<String>,
    emitted: HashSet<String>,
    pending: HashMap<u64, PendingToolCall>,
    last_inline: Option<InlineCall>,
    clock: Clock,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::with_clock(system_clock)
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            markup: MarkupScanner::new(),
            tool_ids: HashMap::new(),
            last_tool_id: None,
            emitted: HashSet::new(),
            pending: HashMap::new(),
            last_inline: None,
            clock,
        }
    }

    /// Release text and markup still held back once the frame stream has
    /// ended without a message stop.
    pub fn finish(&mut self) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        let rest = self.markup.finish();
        self.apply_markup(rest, &mut events);
        self.last_inline = None;
        events
    }

    /// Process one frame, returning the events it produces in order.
    pub fn parse(&mut self, frame: RawFrame) -> Vec<QueryEvent> {
        let mut events = Vec::new();

        if !matches!(frame, RawFrame::TextDelta { .. }) {
            let settled = self.markup.settle();
            self.apply_markup(settled, &mut events);
        }

        match frame {
            RawFrame::Error { message } => {
                tracing::error!("Runtime reported an error: {}", message);
                events.push(QueryEvent::error(format!("Runtime error: {}", message)));
            }
            RawFrame::TokenUsage(usage) => {
                tracing::info!(
                    "Token usage: input={} output={} cache_read={} cache_write={}",
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.cache_read_tokens,
                    usage.cache_write_tokens
                );
                events.push(QueryEvent::TokenUsage { usage });
            }
            RawFrame::MessageStart { role } => {
                tracing::debug!("Message started (role: {})", role);
            }
            RawFrame::SegmentStart { index, tool_use } => {
                if let Some(tool_use) = tool_use {
                    self.open_segment(index.unwrap_or_default(), tool_use);
                }
            }
            RawFrame::ToolInputDelta { index, input } => {
                match self.pending.get_mut(&index.unwrap_or_default()) {
                    Some(pending) => pending.input.push_str(&input),
                    None => tracing::debug!("Tool input for unknown segment {:?}", index),
                }
            }
            RawFrame::TextDelta { text, .. } => {
                let found = self.markup.push(&text);
                self.apply_markup(found, &mut events);
            }
            RawFrame::SegmentStop { index } => {
                if let Some(pending) = self.pending.remove(&index.unwrap_or_default()) {
                    self.close_segment(pending, &mut events);
                }
            }
            RawFrame::MessageStop { stop_reason } => {
                let rest = self.markup.finish();
                self.apply_markup(rest, &mut events);
                self.last_inline = None;
                self.message_stop(stop_reason, &mut events);
            }
            RawFrame::ToolResults { role, results } => {
                tracing::debug!("{} tool results in {} message", results.len(), role);
                for result in results {
                    self.tool_result(result, &mut events);
                }
            }
            RawFrame::Unrecognized(value) => {
                tracing::debug!("Ignoring unrecognized frame: {}", value);
            }
        }

        events
    }

    fn open_segment(&mut self, index: u64, tool_use: ToolUseStart) {
        tracing::debug!(
            "Tool segment {} opened: {} ({})",
            index,
            tool_use.name,
            tool_use.tool_use_id
        );
        self.pending.insert(
            index,
            PendingToolCall {
                tool_use_id: tool_use.tool_use_id,
                name: tool_use.name,
                input: String::new(),
            },
        );
    }

    fn close_segment(&mut self, pending: PendingToolCall, events: &mut Vec<QueryEvent>) {
        let args = parse_segment_input(&pending.input);
        let id = if pending.tool_use_id.is_empty() {
            self.derive_tool_id(&pending.name, &args)
        } else {
            pending.tool_use_id
        };
        self.announce(id, pending.name, args, events);
    }

    /// Emit a tool-call start unless this id was already announced.
    /// Returns whether an event was emitted.
    fn announce(
        &mut self,
        id: String,
        name: String,
        args: Map<String, Value>,
        events: &mut Vec<QueryEvent>,
    ) -> bool {
        if !self.emitted.insert(id.clone()) {
            tracing::debug!("Suppressing duplicate tool call {}", id);
            return false;
        }

        tracing::info!("Tool call started: {} ({})", name, id);
        self.tool_ids.insert(name.clone(), id.clone());
        self.last_tool_id = Some(id.clone());
        events.push(QueryEvent::ToolCallStart {
            tool_id: id,
            tool_name: name,
            args,
            update: None,
        });
        true
    }

    fn apply_markup(&mut self, found: Vec<Markup>, events: &mut Vec<QueryEvent>) {
        for item in found {
            match item {
                Markup::Text(text) => events.push(QueryEvent::chunk(text)),
                Markup::Invoke { name, args } => {
                    let id = self.derive_tool_id(&name, &args);
                    self.last_inline = if self.announce(id.clone(), name.clone(), args.clone(), events)
                    {
                        Some(InlineCall { id, name, args })
                    } else {
                        None
                    };
                }
                Markup::LateParameters(late) => match self.last_inline.as_mut() {
                    Some(call) => {
                        tracing::warn!(
                            "Merging {} parameters found after </invoke> into {}",
                            late.len(),
                            call.id
                        );
                        call.args.extend(late);
                        events.push(QueryEvent::ToolCallStart {
                            tool_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            args: call.args.clone(),
                            update: Some(true),
                        });
                    }
                    None => tracing::warn!("Dropping parameters with no preceding tool call"),
                },
                Markup::Result(body) => self.inline_result(&body, events),
            }
        }
    }

    fn inline_result(&mut self, body: &str, events: &mut Vec<QueryEvent>) {
        let payload: Value = match serde_json::from_str(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping undecodable <result> block: {}", e);
                return;
            }
        };

        match self.last_tool_id.clone() {
            Some(id) => self.tool_result(
                ToolResult {
                    tool_use_id: id,
                    status: "success".to_string(),
                    payload,
                },
                events,
            ),
            None => tracing::warn!("Dropping <result> block with no preceding tool call"),
        }
    }

    fn tool_result(&mut self, result: ToolResult, events: &mut Vec<QueryEvent>) {
        if !self.emitted.contains(&result.tool_use_id) {
            tracing::warn!(
                "Dropping result for tool call {} that was never announced",
                result.tool_use_id
            );
            return;
        }

        let id = result.tool_use_id;
        self.tool_ids.retain(|_, tool_id| *tool_id != id);
        self.pending.retain(|_, pending| pending.tool_use_id != id);
        if self.last_tool_id.as_deref() == Some(id.as_str()) {
            self.last_tool_id = None;
        }

        tracing::info!("Tool call {} finished ({})", id, result.status);
        events.push(QueryEvent::ToolCallResult {
            tool_use_id: id,
            result: result.payload,
            status: result.status,
        });
    }

    fn message_stop(&mut self, reason: StopReason, events: &mut Vec<QueryEvent>) {
        match &reason {
            StopReason::EndTurn | StopReason::MaxTokens | StopReason::StopSequence => {
                tracing::info!("Message finished: {}", reason.as_str());
                events.push(QueryEvent::Complete {
                    success: true,
                    stop_reason: Some(reason.as_str().to_string()),
                    error: None,
                    meta: CompletionMeta::default(),
                    token_usage: None,
                });
            }
            StopReason::ToolUse => tracing::debug!("Message paused for tool use"),
            StopReason::Other(raw) => tracing::warn!("Unknown stop reason: {}", raw),
        }
    }

    /// `tool_{name}_{hash8}_{millis}` where the hash covers the key-sorted arguments
    fn derive_tool_id(&self, name: &str, args: &Map<String, Value>) -> String {
        let canonical = serde_json::to_string(args).unwrap_or_default();
        let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
        format!("tool_{}_{}_{}", name, &digest[..8], (self.clock)())
    }

    /// Id most recently announced for a tool name
    pub fn tool_id_for(&self, name: &str) -> Option<&str> {
        self.tool_ids.get(name).map(String::as_str)
    }
}

/// Streamed tool input is a JSON object; anything else is kept as text
fn parse_segment_input(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
        Err(e) => {
            tracing::warn!("Tool input is not valid JSON, keeping raw text: {}", e);
            let mut map = Map::new();
            map.insert("input".to_string(), Value::String(raw.to_string()));
            map
        }
    }
}
