//! Status events emitted while turns run.
//!
//! | Event | When |
//! |-------|------|
//! | `TurnStarted` | adapters are armed and the broadcaster accepts frames |
//! | `EngineCompleted` | one adapter reached `Completed` (or timed out) |
//! | `TurnCompleted` | the results container was sealed |
//! | `SessionEvicted` | the idle sweep stopped and removed a session |
//!
//! Serialised as JSON objects tagged by `"event"`, camelCase fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::turn::{EngineStatus, TurnId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TurnStatusEvent {
    #[serde(rename_all = "camelCase")]
    TurnStarted {
        turn_id: TurnId,
        sample_rate: u32,
        engines: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    EngineCompleted {
        turn_id: TurnId,
        engine: String,
        status: EngineStatus,
        detail: Option<String>,
        /// Milliseconds since the turn was created.
        elapsed_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TurnCompleted {
        turn_id: TurnId,
        aborted: bool,
        samples: u64,
        audio_file: Option<PathBuf>,
        rejected_late_writes: u64,
    },
    #[serde(rename_all = "camelCase")]
    SessionEvicted {
        identity: String,
        idle_secs: u64,
    },
}

impl TurnStatusEvent {
    /// Turn the event refers to, if any.
    pub fn turn_id(&self) -> Option<&TurnId> {
        match self {
            TurnStatusEvent::TurnStarted { turn_id, .. }
            | TurnStatusEvent::EngineCompleted { turn_id, .. }
            | TurnStatusEvent::TurnCompleted { turn_id, .. } => Some(turn_id),
            TurnStatusEvent::SessionEvicted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_completed_serializes_with_camel_case_and_lowercase_status() {
        let event = TurnStatusEvent::EngineCompleted {
            turn_id: TurnId::from("turn-000001-deadbeef"),
            engine: "phonemes".into(),
            status: EngineStatus::Partial,
            detail: Some("timed out".into()),
            elapsed_ms: 1_250,
        };

        let json = serde_json::to_value(&event).expect("serialize engine event");
        assert_eq!(json["event"], "engineCompleted");
        assert_eq!(json["turnId"], "turn-000001-deadbeef");
        assert_eq!(json["status"], "partial");
        assert_eq!(json["elapsedMs"], 1_250);

        let round_trip: TurnStatusEvent =
            serde_json::from_value(json).expect("deserialize engine event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn session_evicted_has_no_turn() {
        let event = TurnStatusEvent::SessionEvicted {
            identity: "t1/s1".into(),
            idle_secs: 601,
        };
        assert!(event.turn_id().is_none());
        let json = serde_json::to_value(&event).expect("serialize eviction");
        assert_eq!(json["event"], "sessionEvicted");
        assert_eq!(json["idleSecs"], 601);
    }

    #[test]
    fn unknown_event_tag_is_rejected() {
        let err = serde_json::from_str::<TurnStatusEvent>(r#"{"event":"TurnStarted"}"#);
        assert!(err.is_err(), "expected tag casing to matter");
    }
}
