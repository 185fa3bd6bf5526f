//! Kernel result and stream-event JSON shapes.
//!
//! The scheduler depends on these keys; the shared-memory fast path
//! serialises [`DecodeOutcome`] into the result slot byte-for-byte the
//! same as the JSON-over-IPC path.

use serde::{Deserialize, Serialize};

/// Result of a session-creation call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Created,
    Exists,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub status: CreateStatus,
}

/// Result of a prefill call. Prefill only appends the user message;
/// tokenisation happens inside the subsequent decode, so
/// `prompt_tokens` is always 0 here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrefillOutcome {
    pub prompt_tokens: u32,
    pub prefill_ms: u64,
}

/// Result of a non-streamed decode (and of `complete`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodeOutcome {
    pub session_id: String,
    pub text: String,
    pub thinking: String,
    pub finish_reason: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub decode_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill_ms: Option<u64>,
}

/// One event on a decode stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta {
        delta: String,
    },
    Done {
        finish_reason: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        prefill_ms: u64,
        decode_ms: u64,
        text: String,
        thinking: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

/// Narrative summary produced by the summarisation kernel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryOutcome {
    pub narrative_summary: String,
    pub metadata: serde_json::Value,
}

/// Short title produced by the summarisation kernel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TitleOutcome {
    pub suggested_title: String,
    pub metadata: serde_json::Value,
}

/// Per-worker diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerStats {
    pub sessions: usize,
    pub prompt_tokens_total: u64,
    pub completion_tokens_total: u64,
    pub context_size: u32,
}

/// Per-session diagnostics as reported by the in-worker kernel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub messages: usize,
    pub prompt_tokens_total: u64,
    pub completion_tokens_total: u64,
    pub idle_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_events_are_tagged_by_event_key() {
        let done = StreamEvent::Done {
            finish_reason: "stop".into(),
            prompt_tokens: 12,
            completion_tokens: 4,
            prefill_ms: 3,
            decode_ms: 9,
            text: "hi".into(),
            thinking: String::new(),
        };
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["event"], "done");
        assert_eq!(v["completion_tokens"], 4);

        let delta: StreamEvent =
            serde_json::from_value(serde_json::json!({"event": "delta", "delta": "He"})).unwrap();
        assert!(matches!(delta, StreamEvent::Delta { delta } if delta == "He"));
    }

    #[test]
    fn decode_outcome_omits_absent_prefill() {
        let outcome = DecodeOutcome {
            session_id: "s".into(),
            text: "t".into(),
            thinking: String::new(),
            finish_reason: "stop".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            decode_ms: 1,
            prefill_ms: None,
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert!(v.get("prefill_ms").is_none());
    }
}
