//! # Realtime Events
//!
//! Frames on both legs of the relay are JSON objects discriminated by a
//! string `type`. The relay only checks that a frame decodes to such an
//! object; the original text is what gets forwarded, byte for byte.
//!
//! Event types form a closed set ([`EventKind`]) so dispatch is a plain
//! `match`. Types the table does not know become [`EventKind::Unrecognized`]
//! and are forwarded like any other.

use crate::error::RelayError;
use serde_json::{Map, Value};
use std::fmt;

/// Which side of the relay normally sends an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Client → server
    SessionUpdate,
    InputAudioBufferAppend,
    InputAudioBufferCommit,
    InputAudioBufferClear,
    ConversationItemCreate,
    ConversationItemTruncate,
    ConversationItemDelete,
    ResponseCreate,
    ResponseCancel,
    // Server → client
    Error,
    SessionCreated,
    SessionUpdated,
    ConversationCreated,
    ConversationItemCreated,
    InputAudioTranscriptionCompleted,
    InputAudioTranscriptionFailed,
    ConversationItemTruncated,
    ConversationItemDeleted,
    InputAudioBufferCommitted,
    InputAudioBufferCleared,
    InputAudioBufferSpeechStarted,
    InputAudioBufferSpeechStopped,
    ResponseCreated,
    ResponseDone,
    ResponseOutputItemAdded,
    ResponseOutputItemDone,
    ResponseContentPartAdded,
    ResponseContentPartDone,
    ResponseTextDelta,
    ResponseTextDone,
    ResponseAudioTranscriptDelta,
    ResponseAudioTranscriptDone,
    ResponseAudioDelta,
    ResponseAudioDone,
    ResponseFunctionCallArgumentsDelta,
    ResponseFunctionCallArgumentsDone,
    RateLimitsUpdated,
    /// Any `type` not in the table
    Unrecognized,
}

const EVENT_TYPES: &[(&str, EventKind)] = &[
    ("session.update", EventKind::SessionUpdate),
    ("input_audio_buffer.append", EventKind::InputAudioBufferAppend),
    ("input_audio_buffer.commit", EventKind::InputAudioBufferCommit),
    ("input_audio_buffer.clear", EventKind::InputAudioBufferClear),
    ("conversation.item.create", EventKind::ConversationItemCreate),
    ("conversation.item.truncate", EventKind::ConversationItemTruncate),
    ("conversation.item.delete", EventKind::ConversationItemDelete),
    ("response.create", EventKind::ResponseCreate),
    ("response.cancel", EventKind::ResponseCancel),
    ("error", EventKind::Error),
    ("session.created", EventKind::SessionCreated),
    ("session.updated", EventKind::SessionUpdated),
    ("conversation.created", EventKind::ConversationCreated),
    ("conversation.item.created", EventKind::ConversationItemCreated),
    (
        "conversation.item.input_audio_transcription.completed",
        EventKind::InputAudioTranscriptionCompleted,
    ),
    (
        "conversation.item.input_audio_transcription.failed",
        EventKind::InputAudioTranscriptionFailed,
    ),
    ("conversation.item.truncated", EventKind::ConversationItemTruncated),
    ("conversation.item.deleted", EventKind::ConversationItemDeleted),
    ("input_audio_buffer.committed", EventKind::InputAudioBufferCommitted),
    ("input_audio_buffer.cleared", EventKind::InputAudioBufferCleared),
    ("input_audio_buffer.speech_started", EventKind::InputAudioBufferSpeechStarted),
    ("input_audio_buffer.speech_stopped", EventKind::InputAudioBufferSpeechStopped),
    ("response.created", EventKind::ResponseCreated),
    ("response.done", EventKind::ResponseDone),
    ("response.output_item.added", EventKind::ResponseOutputItemAdded),
    ("response.output_item.done", EventKind::ResponseOutputItemDone),
    ("response.content_part.added", EventKind::ResponseContentPartAdded),
    ("response.content_part.done", EventKind::ResponseContentPartDone),
    ("response.text.delta", EventKind::ResponseTextDelta),
    ("response.text.done", EventKind::ResponseTextDone),
    ("response.audio_transcript.delta", EventKind::ResponseAudioTranscriptDelta),
    ("response.audio_transcript.done", EventKind::ResponseAudioTranscriptDone),
    ("response.audio.delta", EventKind::ResponseAudioDelta),
    ("response.audio.done", EventKind::ResponseAudioDone),
    (
        "response.function_call_arguments.delta",
        EventKind::ResponseFunctionCallArgumentsDelta,
    ),
    (
        "response.function_call_arguments.done",
        EventKind::ResponseFunctionCallArgumentsDone,
    ),
    ("rate_limits.updated", EventKind::RateLimitsUpdated),
];

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        EVENT_TYPES
            .iter()
            .find(|(name, _)| *name == event_type)
            .map(|(_, kind)| *kind)
            .unwrap_or(EventKind::Unrecognized)
    }

    /// Wire name, `None` for `Unrecognized`.
    pub fn as_type(&self) -> Option<&'static str> {
        EVENT_TYPES
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
    }

    pub fn direction(&self) -> Direction {
        use EventKind::*;
        match self {
            SessionUpdate
            | InputAudioBufferAppend
            | InputAudioBufferCommit
            | InputAudioBufferClear
            | ConversationItemCreate
            | ConversationItemTruncate
            | ConversationItemDelete
            | ResponseCreate
            | ResponseCancel => Direction::ClientToServer,
            Unrecognized => Direction::Unknown,
            _ => Direction::ServerToClient,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_type().unwrap_or("unrecognized"))
    }
}

/// What the animation pipeline takes from an upstream event, on top of the
/// event being forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationTap {
    /// Nothing beyond forwarding
    None,
    /// `delta` carries base64 PCM16 playback audio
    AudioDelta,
    /// No more playback audio for this response
    AudioDone,
    /// `delta` carries transcript text of the audio being spoken
    TranscriptDelta,
    /// End of the spoken transcript
    TranscriptDone,
    /// The user started talking over the assistant
    Interrupted,
}

/// Dispatch table from event kind to animation tap.
pub fn animation_tap(kind: EventKind) -> AnimationTap {
    match kind {
        EventKind::ResponseAudioDelta => AnimationTap::AudioDelta,
        EventKind::ResponseAudioDone => AnimationTap::AudioDone,
        EventKind::ResponseAudioTranscriptDelta => AnimationTap::TranscriptDelta,
        EventKind::ResponseAudioTranscriptDone => AnimationTap::TranscriptDone,
        EventKind::InputAudioBufferSpeechStarted => AnimationTap::Interrupted,
        _ => AnimationTap::None,
    }
}

/// A decoded frame plus the text it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    kind: EventKind,
    event_type: String,
    payload: Map<String, Value>,
    raw: String,
}

impl RealtimeEvent {
    /// Decode a frame. Anything that is not a JSON object with a string
    /// `type` is a `MalformedFrame`.
    pub fn parse(text: impl Into<String>) -> Result<Self, RelayError> {
        let raw = text.into();

        let payload = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(RelayError::MalformedFrame(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(RelayError::MalformedFrame(e.to_string())),
        };

        let event_type = match payload.get("type") {
            Some(Value::String(event_type)) => event_type.clone(),
            Some(_) => return Err(RelayError::MalformedFrame("\"type\" is not a string".to_string())),
            None => return Err(RelayError::MalformedFrame("missing \"type\"".to_string())),
        };

        Ok(Self {
            kind: EventKind::from_type(&event_type),
            event_type,
            payload,
            raw,
        })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The `type` exactly as received.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Text the event was decoded from; what gets forwarded.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// A top-level string field, e.g. `delta`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload().get(key).and_then(Value::as_str)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_raw_text() {
        let text = r#"{"type":"response.audio.delta",  "delta":"AAAA","item_id":"it_1"}"#;
        let event = RealtimeEvent::parse(text).unwrap();

        assert_eq!(event.kind(), EventKind::ResponseAudioDelta);
        assert_eq!(event.raw(), text);
        assert_eq!(event.str_field("delta"), Some("AAAA"));
    }

    #[test]
    fn test_unknown_type_is_still_an_event() {
        let event = RealtimeEvent::parse(r#"{"type":"vendor.custom","x":1}"#).unwrap();
        assert_eq!(event.kind(), EventKind::Unrecognized);
        assert_eq!(event.event_type(), "vendor.custom");
        assert_eq!(event.kind().direction(), Direction::Unknown);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        for text in ["not json", "[1,2]", r#"{"no_type":true}"#, r#"{"type":7}"#, ""] {
            let err = RealtimeEvent::parse(text).unwrap_err();
            assert!(matches!(err, RelayError::MalformedFrame(_)), "{} gave {:?}", text, err);
        }
    }

    #[test]
    fn test_event_table_round_trips() {
        for (name, kind) in EVENT_TYPES {
            assert_eq!(EventKind::from_type(name), *kind);
            assert_eq!(kind.as_type(), Some(*name));
        }
        assert_eq!(EventKind::Unrecognized.as_type(), None);
    }

    #[test]
    fn test_directions() {
        assert_eq!(EventKind::SessionUpdate.direction(), Direction::ClientToServer);
        assert_eq!(EventKind::ResponseAudioDelta.direction(), Direction::ServerToClient);
    }

    #[test]
    fn test_animation_dispatch() {
        assert_eq!(animation_tap(EventKind::ResponseAudioDelta), AnimationTap::AudioDelta);
        assert_eq!(
            animation_tap(EventKind::ResponseAudioTranscriptDelta),
            AnimationTap::TranscriptDelta
        );
        assert_eq!(
            animation_tap(EventKind::InputAudioBufferSpeechStarted),
            AnimationTap::Interrupted
        );
        assert_eq!(animation_tap(EventKind::SessionCreated), AnimationTap::None);
    }
}
