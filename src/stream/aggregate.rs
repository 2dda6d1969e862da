use tracing::{debug, warn};

use crate::protocol::downstream::{ASSISTANT_ROLE, FUNCTION_TYPE};
use crate::protocol::{
    FinalFunction, FinalMessage, FinalToolCall, FinishReason, ToolCallFragment, ToolCallSummary,
    UpstreamEvent,
};

/// Result of folding a whole upstream sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedMessage {
    pub message: FinalMessage,
    pub finish_reason: FinishReason,
}

/// Buffered-mode fold over decoded upstream events.
#[derive(Debug, Default)]
pub struct Aggregator {
    text: String,
    finish_reason: Option<FinishReason>,
    summaries: Vec<ToolCallSummary>,
    events: usize,
    dropped_fragments: usize,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: UpstreamEvent) {
        self.events += 1;
        if let Some(text) = event.text {
            self.text.push_str(&text);
        }
        if let Some(reason) = event.finish_reason {
            self.finish_reason = Some(reason);
        }
        for fragment in event.tool_calls {
            match fragment {
                ToolCallFragment::Summary(summary) => self.summaries.push(summary),
                ToolCallFragment::Delta(_) => {}
                ToolCallFragment::Malformed { .. } => self.dropped_fragments += 1,
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> AggregatedMessage {
        let finish_reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        if self.dropped_fragments > 0 {
            debug!(
                dropped = self.dropped_fragments,
                "malformed tool-call entries ignored while aggregating"
            );
        }

        let message = if finish_reason == FinishReason::ToolCalls {
            if self.summaries.is_empty() {
                warn!(
                    events = self.events,
                    "finish reason is tool_calls but no tool-call summary arrived"
                );
            }
            tool_call_message(self.summaries)
        } else if !self.summaries.is_empty() {
            warn!(
                finish_reason = %finish_reason,
                calls = self.summaries.len(),
                "tool-call summaries arrived without a tool_calls finish; returning them anyway"
            );
            tool_call_message(self.summaries)
        } else {
            FinalMessage {
                role: ASSISTANT_ROLE.to_string(),
                content: Some(self.text),
                tool_calls: None,
            }
        };

        AggregatedMessage {
            message,
            finish_reason,
        }
    }
}

fn tool_call_message(summaries: Vec<ToolCallSummary>) -> FinalMessage {
    let tool_calls = summaries
        .into_iter()
        .map(|summary| FinalToolCall {
            id: summary.id,
            type_: FUNCTION_TYPE.to_string(),
            function: FinalFunction {
                name: summary.name,
                arguments: summary.arguments,
            },
        })
        .collect();
    FinalMessage {
        role: ASSISTANT_ROLE.to_string(),
        content: None,
        tool_calls: Some(tool_calls),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolCallDelta;

    fn summary(id: &str) -> ToolCallFragment {
        ToolCallFragment::Summary(ToolCallSummary {
            id: id.into(),
            name: "get_weather".into(),
            arguments: "{\"loc\":\"NY\"}".into(),
        })
    }

    #[test]
    fn test_concatenates_text_and_defaults_to_stop() {
        let mut aggregator = Aggregator::new();
        aggregator.push(UpstreamEvent::text("Hel"));
        aggregator.push(UpstreamEvent::default());
        aggregator.push(UpstreamEvent::text("lo"));
        let result = aggregator.finish();
        assert_eq!(result.message.content.as_deref(), Some("Hello"));
        assert!(result.message.tool_calls.is_none());
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_last_non_null_finish_reason_wins() {
        let mut aggregator = Aggregator::new();
        aggregator.push(UpstreamEvent::text("a").with_finish_reason(FinishReason::Length));
        aggregator.push(UpstreamEvent::text("b"));
        let result = aggregator.finish();
        assert_eq!(result.finish_reason, FinishReason::Length);
        assert_eq!(result.message.content.as_deref(), Some("ab"));
    }

    #[test]
    fn test_tool_calls_finish_uses_summaries_only() {
        let mut aggregator = Aggregator::new();
        aggregator.push(UpstreamEvent {
            tool_calls: vec![ToolCallFragment::Delta(ToolCallDelta {
                index: 0,
                id: Some("call_1".into()),
                name: Some("get_weather".into()),
                arguments: None,
            })],
            ..UpstreamEvent::default()
        });
        aggregator.push(UpstreamEvent {
            finish_reason: Some(FinishReason::ToolCalls),
            tool_calls: vec![summary("call_1")],
            ..UpstreamEvent::default()
        });
        let result = aggregator.finish();
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert!(result.message.content.is_none());
        let calls = result.message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].type_, "function");
        assert_eq!(calls[0].function.arguments, "{\"loc\":\"NY\"}");
    }

    #[test]
    fn test_tool_calls_finish_without_summaries_yields_empty_list() {
        let mut aggregator = Aggregator::new();
        aggregator.push(UpstreamEvent::text("thinking").with_finish_reason(FinishReason::ToolCalls));
        let result = aggregator.finish();
        assert!(result.message.content.is_none());
        assert_eq!(result.message.tool_calls, Some(Vec::new()));
        let json = serde_json::to_value(&result.message).unwrap();
        assert_eq!(json["tool_calls"], serde_json::json!([]));
        assert!(json["content"].is_null());
    }

    #[test]
    fn test_summaries_with_other_finish_reason_are_kept() {
        let mut aggregator = Aggregator::new();
        aggregator.push(UpstreamEvent::text("partial"));
        aggregator.push(UpstreamEvent {
            finish_reason: Some(FinishReason::Stop),
            tool_calls: vec![summary("call_7")],
            ..UpstreamEvent::default()
        });
        let result = aggregator.finish();
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert!(result.message.content.is_none());
        assert_eq!(result.message.tool_calls.unwrap()[0].id, "call_7");
    }
}
