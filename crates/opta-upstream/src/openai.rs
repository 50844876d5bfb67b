//! OpenAI-compatible chat completion wire format: request bodies, the SSE
//! framing and the delta accumulator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use opta_core::agent::AgentConfig;
use opta_core::ids::ToolCallId;
use opta_core::messages::{ChatMessage, ToolCall};
use opta_core::tools::ToolDefinition;

use crate::error::UpstreamError;

#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(config: &AgentConfig, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        Self {
            model: config.model.clone(),
            messages: messages.iter().map(message_to_wire).collect(),
            tools: tools.iter().map(tool_to_wire).collect(),
            stream: true,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

pub fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut msg = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            },
                        })
                    })
                    .collect();
            }
            msg
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        },
    })
}

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes are buffered raw so a code point split across network chunks is
/// only decoded once its frame is complete.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        // CR only ever appears as part of a line ending here.
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(data) = decode_frame(frame) {
                out.push(data);
            }
        }
        out
    }

    /// Whatever is left once the stream ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<String> {
        decode_frame(std::mem::take(&mut self.buffer))
    }
}

fn decode_frame(frame: Vec<u8>) -> Option<String> {
    match String::from_utf8(frame) {
        Ok(text) => frame_data(&text),
        Err(e) => {
            warn!(error = %e, "dropping SSE frame that is not valid UTF-8");
            None
        }
    }
}

fn frame_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Incremental output surfaced while the stream is running.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamDelta {
    Content(String),
    Reasoning(String),
}

/// Final result of one streamed completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
pub struct ChatAccumulator {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
}

impl ChatAccumulator {
    pub fn apply(&mut self, data: &str) -> Result<Vec<StreamDelta>, UpstreamError> {
        let chunk: Chunk = serde_json::from_str(data)
            .map_err(|e| UpstreamError::Decode(format!("chunk: {e}")))?;
        let mut deltas = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.reasoning_content.filter(|t| !t.is_empty()) {
                self.reasoning.push_str(&text);
                deltas.push(StreamDelta::Reasoning(text));
            }
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.content.push_str(&text);
                deltas.push(StreamDelta::Content(text));
            }
            for call in choice.delta.tool_calls {
                let slot = self.tool_calls.entry(call.index).or_default();
                if let Some(id) = call.id {
                    slot.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        slot.name.push_str(&name);
                    }
                    if let Some(args) = function.arguments {
                        slot.arguments.push_str(&args);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        Ok(deltas)
    }

    pub fn finish(self) -> ChatCompletion {
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCall {
                id: if c.id.is_empty() {
                    ToolCallId::new()
                } else {
                    ToolCallId::from_raw(c.id)
                },
                name: c.name,
                arguments: if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments)
                        .unwrap_or_else(|_| Value::String(c.arguments.clone()))
                },
            })
            .collect();
        ChatCompletion {
            content: (!self.content.is_empty()).then_some(self.content),
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
            finish_reason: self.finish_reason,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelInfo>,
}
