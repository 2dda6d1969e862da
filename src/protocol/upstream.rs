//! Upstream dialect: one JSON record per `data:` line.
//!
//! Records carry any of `text`, `finish_reason` and `tool_calls`. Tool-call
//! entries come in two shapes (indexed incremental fragments while streaming,
//! and fully assembled summaries on the finishing record), so every entry is
//! classified on its own and a bad one never costs the rest of the record.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

/// Typed finish signal. Serialises back to the exact upstream text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(other) => other,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinishReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FinishReason::parse(&raw))
    }
}

/// Intermediate fragment: `{ index, id?, function: { name?, arguments? } }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    /// Present only on the fragment that opens a call.
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Terminal summary: `{ id, name, arguments }`, fully assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallFragment {
    Delta(ToolCallDelta),
    Summary(ToolCallSummary),
    /// Entry that fits neither shape; kept so consumers can count the drop.
    Malformed { reason: &'static str },
}

/// One decoded upstream record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub text: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: Vec<ToolCallFragment>,
}

impl UpstreamEvent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn is_tool_calls_finish(&self) -> bool {
        self.finish_reason == Some(FinishReason::ToolCalls)
    }
}

/// Decode one `data:` payload.
///
/// Returns `None` (after logging) when the payload is not a JSON object; the
/// caller keeps reading the sequence. Fields of an unexpected type are treated
/// as absent.
#[must_use]
pub fn decode_upstream_event(payload: &str) -> Option<UpstreamEvent> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                error = %err,
                payload_len = payload.len(),
                "dropping unparsable upstream record"
            );
            return None;
        }
    };
    let Value::Object(mut record) = value else {
        warn!(
            payload_len = payload.len(),
            "dropping upstream record that is not a JSON object"
        );
        return None;
    };

    let text = match record.remove("text") {
        Some(Value::String(text)) => Some(text),
        _ => None,
    };
    let finish_reason = record
        .get("finish_reason")
        .and_then(Value::as_str)
        .filter(|raw| !raw.is_empty())
        .map(FinishReason::parse);
    let tool_calls = match record.remove("tool_calls") {
        Some(Value::Array(entries)) => entries.into_iter().map(classify_fragment).collect(),
        _ => Vec::new(),
    };

    Some(UpstreamEvent {
        text,
        finish_reason,
        tool_calls,
    })
}

fn classify_fragment(entry: Value) -> ToolCallFragment {
    let Value::Object(mut entry) = entry else {
        return ToolCallFragment::Malformed {
            reason: "entry is not an object",
        };
    };

    let index = entry.get("index").map(|index| {
        index
            .as_u64()
            .and_then(|index| u32::try_from(index).ok())
    });
    let function = entry.remove("function");

    match (index, function) {
        (Some(Some(index)), Some(Value::Object(mut function))) => {
            ToolCallFragment::Delta(ToolCallDelta {
                index,
                id: take_string(&mut entry, "id"),
                name: take_string(&mut function, "name"),
                arguments: take_string(&mut function, "arguments"),
            })
        }
        (Some(None), _) => ToolCallFragment::Malformed {
            reason: "index is not a non-negative integer",
        },
        (Some(Some(_)), _) => ToolCallFragment::Malformed {
            reason: "indexed fragment has no function object",
        },
        (None, Some(_)) => ToolCallFragment::Malformed {
            reason: "function fragment has no index",
        },
        (None, None) => classify_summary(entry),
    }
}

fn classify_summary(mut entry: Map<String, Value>) -> ToolCallFragment {
    let id = take_string(&mut entry, "id");
    let name = take_string(&mut entry, "name");
    let arguments = match entry.remove("arguments") {
        Some(Value::String(arguments)) => Some(arguments),
        Some(structured @ (Value::Object(_) | Value::Array(_))) => Some(structured.to_string()),
        _ => None,
    };
    match (id, name, arguments) {
        (Some(id), Some(name), Some(arguments)) => ToolCallFragment::Summary(ToolCallSummary {
            id,
            name,
            arguments,
        }),
        _ => ToolCallFragment::Malformed {
            reason: "entry has neither index/function nor id/name/arguments",
        },
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}
