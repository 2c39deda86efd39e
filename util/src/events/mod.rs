// util/src/events/mod.rs
pub mod manager;
pub use manager::{EventBus, Receiver};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standard event envelope sent over bus topics.
#[derive(Serialize)]
pub struct EventEnvelope<'a, T> {
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'a str,
    pub topic: &'a str,
    pub payload: T,
    pub ts: String,
}

/// Receiving side of [`EventEnvelope`], payload left untyped.
#[derive(Debug, Deserialize)]
pub struct IncomingEnvelope {
    pub event: String,
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub ts: String,
}

impl IncomingEnvelope {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Broadcast a JSON-serialized `EventEnvelope` on `topic`.
pub async fn emit<T: Serialize>(bus: &EventBus, topic: &str, event: &str, payload: &T) {
    let env = EventEnvelope {
        r#type: "event",
        event,
        topic,
        payload,
        ts: Utc::now().to_rfc3339(),
    };
    match serde_json::to_string(&env) {
        Ok(json) => bus.broadcast(topic, json).await,
        Err(e) => tracing::error!("Failed to serialize '{event}' for '{topic}': {e}"),
    }
}

/// Topic carrying every admission change of one session.
pub fn attendance_session_topic(session_id: &str) -> String {
    format!("attendance:session:{session_id}")
}

/// Topic carrying one student's own admission history changes.
pub fn attendance_student_topic(student_id: i64) -> String {
    format!("attendance:student:{student_id}")
}
