use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::protocol::downstream::FUNCTION_TYPE;
use crate::protocol::{ChunkFunction, ChunkToolCall, ToolCallFragment, UpstreamEvent};

/// Decides which tool-call information belongs in each outgoing delta.
///
/// Fragment boundaries are preserved: `arguments` pieces are forwarded as
/// they arrive and never merged across events. The tracker only remembers
/// which call indices have been opened, for diagnostics.
#[derive(Debug, Default)]
pub struct ToolCallDeltaTracker {
    opened: SmallVec<[u32; 4]>,
    dropped: usize,
}

impl ToolCallDeltaTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragments skipped so far (malformed, or summaries outside a
    /// `tool_calls` finish).
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Number of distinct call indices opened with an `id`.
    #[must_use]
    pub fn opened_calls(&self) -> usize {
        self.opened.len()
    }

    /// Outgoing tool-call entries for `event`, in upstream order.
    pub fn track(&mut self, event: &UpstreamEvent) -> Vec<ChunkToolCall> {
        if event.is_tool_calls_finish() {
            if !event.tool_calls.is_empty() {
                debug!(
                    entries = event.tool_calls.len(),
                    "withholding terminal tool-call summary from stream"
                );
            }
            return Vec::new();
        }

        let mut entries = Vec::new();
        for fragment in &event.tool_calls {
            match fragment {
                ToolCallFragment::Delta(delta) => {
                    let id = delta.id.as_deref().filter(|id| !id.is_empty());
                    if id.is_some() {
                        if !self.opened.contains(&delta.index) {
                            self.opened.push(delta.index);
                        }
                    } else if !self.opened.contains(&delta.index) {
                        debug!(
                            index = delta.index,
                            "tool-call fragment continues an index that was never opened"
                        );
                    }

                    let has_parts = delta.name.is_some() || delta.arguments.is_some();
                    let function = (has_parts || id.is_some()).then(|| ChunkFunction {
                        name: delta.name.clone(),
                        arguments: delta.arguments.clone(),
                    });
                    entries.push(ChunkToolCall {
                        index: delta.index,
                        type_: FUNCTION_TYPE.to_string(),
                        id: id.map(str::to_string),
                        function,
                    });
                }
                ToolCallFragment::Summary(summary) => {
                    self.dropped += 1;
                    warn!(
                        call_id = %summary.id,
                        "skipping tool-call summary outside a tool_calls finish"
                    );
                }
                ToolCallFragment::Malformed { reason } => {
                    self.dropped += 1;
                    warn!(reason = *reason, "skipping malformed tool-call fragment");
                }
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FinishReason, ToolCallDelta, ToolCallSummary};

    fn delta(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> ToolCallFragment {
        ToolCallFragment::Delta(ToolCallDelta {
            index,
            id: id.map(Into::into),
            name: name.map(Into::into),
            arguments: args.map(Into::into),
        })
    }

    fn event(tool_calls: Vec<ToolCallFragment>) -> UpstreamEvent {
        UpstreamEvent {
            tool_calls,
            ..UpstreamEvent::default()
        }
    }

    #[test]
    fn test_opening_fragment_carries_id_and_name() {
        let mut tracker = ToolCallDeltaTracker::new();
        let out = tracker.track(&event(vec![delta(0, Some("call_1"), Some("get_weather"), None)]));
        assert_eq!(
            out,
            vec![ChunkToolCall {
                index: 0,
                type_: "function".into(),
                id: Some("call_1".into()),
                function: Some(ChunkFunction {
                    name: Some("get_weather".into()),
                    arguments: None,
                }),
            }]
        );
        assert_eq!(tracker.opened_calls(), 1);
    }

    #[test]
    fn test_id_only_fragment_gets_empty_function_shell() {
        let mut tracker = ToolCallDeltaTracker::new();
        let out = tracker.track(&event(vec![delta(2, Some("call_9"), None, None)]));
        assert_eq!(out[0].function, Some(ChunkFunction::default()));
        let json = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"index":2,"type":"function","id":"call_9","function":{}})
        );
    }

    #[test]
    fn test_empty_id_is_not_forwarded() {
        let mut tracker = ToolCallDeltaTracker::new();
        let out = tracker.track(&event(vec![delta(0, Some(""), None, Some("{\"a\""))]));
        assert!(out[0].id.is_none());
        assert_eq!(
            out[0].function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"a\"")
        );
        assert_eq!(tracker.opened_calls(), 0);
    }

    #[test]
    fn test_terminal_summary_is_withheld() {
        let mut tracker = ToolCallDeltaTracker::new();
        let finishing = UpstreamEvent {
            finish_reason: Some(FinishReason::ToolCalls),
            tool_calls: vec![
                ToolCallFragment::Summary(ToolCallSummary {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    arguments: "{}".into(),
                }),
                delta(0, None, None, Some("x")),
            ],
            ..UpstreamEvent::default()
        };
        assert!(tracker.track(&finishing).is_empty());
        assert_eq!(tracker.dropped(), 0);
    }

    #[test]
    fn test_malformed_and_stray_summary_are_skipped_in_order() {
        let mut tracker = ToolCallDeltaTracker::new();
        let out = tracker.track(&event(vec![
            ToolCallFragment::Malformed { reason: "no index" },
            delta(1, Some("call_b"), Some("b"), None),
            ToolCallFragment::Summary(ToolCallSummary {
                id: "c".into(),
                name: "n".into(),
                arguments: "{}".into(),
            }),
            delta(0, Some("call_a"), Some("a"), None),
        ]));
        let indices: Vec<u32> = out.iter().map(|entry| entry.index).collect();
        assert_eq!(indices, vec![1, 0]);
        assert_eq!(tracker.dropped(), 2);
    }
}
