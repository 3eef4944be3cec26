//! Translates [`AgentEvent`]s from the Agent Client into SSE records and
//! into the accumulated non-streaming chat response.

use std::collections::VecDeque;

use ag_domain::agent_event::{AgentEvent, ToolCall};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// One SSE `data:` payload for a single `AgentEvent`.
pub fn to_sse_json(event: &AgentEvent) -> Value {
    match event {
        AgentEvent::TextDelta { text } => json!({ "type": "text_delta", "text": text }),
        AgentEvent::ToolUse { name, input } => {
            json!({ "type": "tool_use", "tool_name": name, "tool_input": input })
        }
        AgentEvent::ToolResult { name, output } => {
            json!({ "type": "tool_result", "tool_name": name, "tool_output": output })
        }
        AgentEvent::AssistantMessage { text, tool_calls } => {
            json!({ "type": "assistant_message", "text": text, "tool_calls": tool_calls })
        }
        AgentEvent::Error { kind, detail } => {
            json!({ "type": "error", "kind": kind, "detail": detail })
        }
        AgentEvent::Done => json!({ "type": "done" }),
    }
}

/// Accumulates a turn's events into the single JSON body returned by the
/// non-streaming `/api/v1/chat` endpoint.
#[derive(Default)]
pub struct ChatAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
    /// Indices into `tool_calls` awaiting their `tool_result`, FIFO per
    /// tool name — a tool may be invoked more than once in one turn, and
    /// results arrive in the same order their `tool_use` events did.
    pending_by_name: std::collections::HashMap<String, VecDeque<usize>>,
    error: Option<(String, String)>,
}

impl ChatAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the accumulator. Returns `true` once `Done`
    /// has been observed and no further events should be folded in.
    pub fn push(&mut self, event: &AgentEvent) -> bool {
        match event {
            AgentEvent::TextDelta { text } => {
                self.text.push_str(text);
                false
            }
            AgentEvent::ToolUse { name, input } => {
                let index = self.tool_calls.len();
                self.tool_calls.push(ToolCall {
                    name: name.clone(),
                    input: input.clone(),
                    output: None,
                });
                self.pending_by_name
                    .entry(name.clone())
                    .or_default()
                    .push_back(index);
                false
            }
            AgentEvent::ToolResult { name, output } => {
                let index = self
                    .pending_by_name
                    .get_mut(name)
                    .and_then(VecDeque::pop_front);
                match index {
                    Some(i) => self.tool_calls[i].output = Some(output.clone()),
                    // A result with no matching prior `tool_use` — keep it
                    // visible rather than silently dropping the output.
                    None => self.tool_calls.push(ToolCall {
                        name: name.clone(),
                        input: Value::Null,
                        output: Some(output.clone()),
                    }),
                }
                false
            }
            AgentEvent::AssistantMessage { text, tool_calls } => {
                if self.text.is_empty() {
                    self.text = text.clone();
                }
                self.tool_calls.extend(tool_calls.iter().cloned());
                false
            }
            AgentEvent::Error { kind, detail } => {
                self.error = Some((kind.clone(), detail.clone()));
                false
            }
            AgentEvent::Done => true,
        }
    }

    pub fn into_response(self, session_id: &str, timestamp: DateTime<Utc>) -> Value {
        let mut body = json!({
            "session_id": session_id,
            "text": self.text,
            "tool_calls": self.tool_calls,
            "timestamp": timestamp.to_rfc3339(),
        });
        if let Some((kind, detail)) = self.error {
            body["error"] = json!({ "kind": kind, "detail": detail });
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_maps_to_sse_record() {
        let event = AgentEvent::TextDelta { text: "hi".into() };
        assert_eq!(to_sse_json(&event), json!({ "type": "text_delta", "text": "hi" }));
    }

    #[test]
    fn tool_use_maps_tool_name_and_input() {
        let event = AgentEvent::ToolUse {
            name: "bash".into(),
            input: json!({ "cmd": "ls" }),
        };
        assert_eq!(
            to_sse_json(&event),
            json!({ "type": "tool_use", "tool_name": "bash", "tool_input": { "cmd": "ls" } })
        );
    }

    #[test]
    fn done_maps_to_bare_type_record() {
        assert_eq!(to_sse_json(&AgentEvent::Done), json!({ "type": "done" }));
    }

    #[test]
    fn accumulator_concatenates_text_deltas_and_stops_on_done() {
        let mut acc = ChatAccumulator::new();
        assert!(!acc.push(&AgentEvent::TextDelta { text: "Hel".into() }));
        assert!(!acc.push(&AgentEvent::TextDelta { text: "lo".into() }));
        assert!(acc.push(&AgentEvent::Done));
        let body = acc.into_response("s1", Utc::now());
        assert_eq!(body["text"], "Hello");
        assert_eq!(body["session_id"], "s1");
    }

    #[test]
    fn accumulator_joins_tool_use_and_its_result() {
        let mut acc = ChatAccumulator::new();
        acc.push(&AgentEvent::ToolUse {
            name: "bash".into(),
            input: json!({ "cmd": "ls" }),
        });
        acc.push(&AgentEvent::ToolResult {
            name: "bash".into(),
            output: json!({ "stdout": "ok" }),
        });
        acc.push(&AgentEvent::Done);
        let body = acc.into_response("s1", Utc::now());
        assert_eq!(body["tool_calls"][0]["name"], "bash");
        assert_eq!(body["tool_calls"][0]["input"]["cmd"], "ls");
        assert_eq!(body["tool_calls"][0]["output"]["stdout"], "ok");
    }

    #[test]
    fn accumulator_matches_repeated_tool_calls_in_order() {
        let mut acc = ChatAccumulator::new();
        acc.push(&AgentEvent::ToolUse { name: "bash".into(), input: json!({"cmd": "a"}) });
        acc.push(&AgentEvent::ToolUse { name: "bash".into(), input: json!({"cmd": "b"}) });
        acc.push(&AgentEvent::ToolResult { name: "bash".into(), output: json!("out-a") });
        acc.push(&AgentEvent::ToolResult { name: "bash".into(), output: json!("out-b") });
        acc.push(&AgentEvent::Done);
        let body = acc.into_response("s1", Utc::now());
        assert_eq!(body["tool_calls"][0]["input"]["cmd"], "a");
        assert_eq!(body["tool_calls"][0]["output"], "out-a");
        assert_eq!(body["tool_calls"][1]["input"]["cmd"], "b");
        assert_eq!(body["tool_calls"][1]["output"], "out-b");
    }

    #[test]
    fn accumulator_surfaces_error() {
        let mut acc = ChatAccumulator::new();
        acc.push(&AgentEvent::Error {
            kind: "turn_timeout".into(),
            detail: "no response in time".into(),
        });
        acc.push(&AgentEvent::Done);
        let body = acc.into_response("s1", Utc::now());
        assert_eq!(body["error"]["kind"], "turn_timeout");
    }
}
