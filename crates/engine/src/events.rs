//! Structured events emitted over a session's external surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use promptstage_template::Warning;

use crate::tracker::PromptTrace;

/// One of the five ordered phases of a chat turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
    Stage5,
}

/// Consolidated payload delivered with [`SessionEvent::Done`].
///
/// `content` repeats the full assistant text so non-streaming callers need
/// not accumulate `chunk` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cancelled: bool,
    /// Warnings accumulated through Stage 3 (post-response warnings land in
    /// per-module state metadata and the debug trace instead).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    /// Prompt-evolution trace, present when state tracking is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<PromptTrace>,
}

/// Events a chat turn emits, in order: `session_start`, interleaved
/// `stage_update`/`chunk`s, then exactly one of `done` (followed by
/// `post_response_complete`), `cancelled`, or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart { session_id: Uuid, conversation_id: Uuid },
    StageUpdate { stage: Stage },
    Chunk {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },
    Done { metadata: TurnMetadata },
    PostResponseComplete,
    Cancelled,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tags() {
        let event = SessionEvent::StageUpdate { stage: Stage::Stage2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_update");
        assert_eq!(json["stage"], "stage2");

        let event = SessionEvent::Chunk { content: "hi".into(), thinking: None };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk");
        assert!(json.get("thinking").is_none());
    }

    #[test]
    fn stage_order_is_total() {
        assert!(Stage::Stage1 < Stage::Stage2);
        assert!(Stage::Stage4 < Stage::Stage5);
    }
}
