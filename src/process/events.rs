//! Tagged decode of process stdout lines.
//!
//! # Known event types
//!
//! | `type`     | Maps to                          |
//! |------------|----------------------------------|
//! | `session`  | [`StreamEvent::SessionStarted`]  |
//! | `message`  | [`StreamEvent::Activity`]        |
//! | `tool`     | [`StreamEvent::Activity`]        |
//! | `result`   | [`StreamEvent::TurnFinished`]    |
//! | *(other)*  | [`StreamEvent::Unknown`]         |
//!
//! Blank lines, non-JSON lines, JSON without a string `type`, and known
//! types with an invalid payload decode to `None` and are dropped.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::models::Usage;

/// One decoded stdout event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The process opened (or resumed) a session.
    SessionStarted {
        /// Session identifier, usable as a continuation token.
        session_id: String,
    },
    /// Intermediate message or tool activity.
    Activity {
        /// Activity kind (`message` or `tool`).
        kind: String,
        /// Message text or tool name, when present.
        detail: Option<String>,
    },
    /// The turn finished; carries usage and the final result.
    TurnFinished {
        /// Final result text.
        result: Option<String>,
        /// Session identifier reported at the end of the turn.
        session_id: Option<String>,
        /// Tokens consumed by the turn.
        usage: Usage,
        /// Whether the process reports the turn as failed.
        is_error: bool,
        /// Structured status signal (HTTP-like code).
        status: Option<u16>,
        /// Server-suggested delay before retrying.
        retry_after: Option<Duration>,
    },
    /// An event type this crate does not model.
    Unknown {
        /// The unrecognised `type` value.
        kind: String,
    },
}

/// Top-level envelope: a `type` discriminator plus arbitrary fields.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionFields {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageFields {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolFields {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultFields {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// Decode a single stdout line.
///
/// Returns `None` for anything that is not a well-formed event; the
/// caller drops such lines.
#[must_use]
pub fn parse_event_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.starts_with('{') {
        return None;
    }

    let envelope: Envelope = match serde_json::from_str(trimmed) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(%err, "dropping malformed event line");
            return None;
        }
    };

    let decoded = match envelope.kind.as_str() {
        "session" => serde_json::from_value::<SessionFields>(envelope.fields)
            .map(|f| StreamEvent::SessionStarted {
                session_id: f.session_id,
            }),
        "message" => serde_json::from_value::<MessageFields>(envelope.fields).map(|f| {
            StreamEvent::Activity {
                kind: "message".into(),
                detail: f.text,
            }
        }),
        "tool" => serde_json::from_value::<ToolFields>(envelope.fields).map(|f| {
            StreamEvent::Activity {
                kind: "tool".into(),
                detail: f.name,
            }
        }),
        "result" => serde_json::from_value::<ResultFields>(envelope.fields).map(|f| {
            StreamEvent::TurnFinished {
                result: f.result,
                session_id: f.session_id,
                usage: f.usage,
                is_error: f.is_error,
                status: f.status,
                retry_after: f.retry_after_ms.map(Duration::from_millis),
            }
        }),
        other => Ok(StreamEvent::Unknown {
            kind: other.to_owned(),
        }),
    };

    match decoded {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(kind = envelope.kind, %err, "dropping event with invalid payload");
            None
        }
    }
}

/// Fold of the events seen during one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Session id from `SessionStarted`.
    pub started_session: Option<String>,
    /// The last `TurnFinished` event's fields.
    pub final_result: Option<String>,
    /// Session id reported by `TurnFinished`.
    pub finished_session: Option<String>,
    /// Usage summed over all `TurnFinished` events.
    pub usage: Usage,
    /// Whether the last turn reported an error.
    pub is_error: bool,
    /// Last status signal seen.
    pub status: Option<u16>,
    /// Last retry delay seen.
    pub retry_after: Option<Duration>,
    /// Number of activity events.
    pub activity_count: u64,
}

impl StreamSummary {
    /// Fold one event into the summary.
    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::SessionStarted { session_id } => {
                self.started_session = Some(session_id.clone());
            }
            StreamEvent::Activity { .. } => self.activity_count += 1,
            StreamEvent::TurnFinished {
                result,
                session_id,
                usage,
                is_error,
                status,
                retry_after,
            } => {
                if result.is_some() {
                    self.final_result.clone_from(result);
                }
                if session_id.is_some() {
                    self.finished_session.clone_from(session_id);
                }
                self.usage += *usage;
                self.is_error = *is_error;
                self.status = status.or(self.status);
                self.retry_after = retry_after.or(self.retry_after);
            }
            StreamEvent::Unknown { .. } => {}
        }
    }

    /// Continuation token: end-of-turn session id, else the opening one.
    #[must_use]
    pub fn continuation_token(&self) -> Option<String> {
        self.finished_session
            .clone()
            .or_else(|| self.started_session.clone())
    }
}
