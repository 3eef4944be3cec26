//! Events emitted by an Agent Client subprocess, bridged onto SSE
//! records by the Stream Translator.

use serde::{Deserialize, Serialize};

/// One entry of the tool-call list carried by `AssistantMessage` and by
/// the synchronous `ChatResponse` accumulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Incremental assistant text.
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// The agent invoked a tool with the given arguments.
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },

    /// The tool named by a prior `ToolUse` returned a value.
    #[serde(rename = "tool_result")]
    ToolResult {
        name: String,
        output: serde_json::Value,
    },

    /// The final consolidated assistant turn, delivered at end.
    #[serde(rename = "assistant_message")]
    AssistantMessage {
        text: String,
        tool_calls: Vec<ToolCall>,
    },

    /// A recoverable agent-side failure. The turn still completes
    /// cleanly — `Done` always follows.
    #[serde(rename = "error")]
    Error { kind: String, detail: String },

    /// The turn is complete. Always the last event of a turn, success or
    /// failure.
    #[serde(rename = "done")]
    Done,
}

impl AgentEvent {
    /// `true` for the terminal event of a turn.
    pub fn is_done(&self) -> bool {
        matches!(self, AgentEvent::Done)
    }

    /// Build the abandoned-turn pair synthesized when a turn exceeds its
    /// configured timeout. The underlying subprocess is left running;
    /// only the turn is abandoned.
    pub fn timed_out(detail: impl Into<String>) -> [AgentEvent; 2] {
        [
            AgentEvent::Error {
                kind: "turn_timeout".into(),
                detail: detail.into(),
            },
            AgentEvent::Done,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_is_terminal() {
        assert!(AgentEvent::Done.is_done());
        assert!(!AgentEvent::TextDelta { text: "hi".into() }.is_done());
    }

    #[test]
    fn serializes_with_type_tag() {
        let ev = AgentEvent::TextDelta {
            text: "hello".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn tool_call_output_omitted_when_absent() {
        let call = ToolCall {
            name: "grep".into(),
            input: serde_json::json!({"pattern": "foo"}),
            output: None,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert!(json.get("output").is_none());
    }

    #[test]
    fn timed_out_ends_with_done() {
        let events = AgentEvent::timed_out("exceeded 120s");
        assert!(matches!(events[0], AgentEvent::Error { .. }));
        assert!(events[1].is_done());
    }
}
