use serde::{Deserialize, Serialize};

use crate::core::error::ValidationError;

/// Maximum length of an NSQ topic name.
pub const MAX_TOPIC_LEN: usize = 64;

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// A request to re-publish `body` to `topic` after `send_in` seconds.
///
/// The same JSON shape is used for inbound requests and for the members
/// stored in the delay store, so a stored entry can be decoded straight
/// back into a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedMessage {
    /// Broker-assigned id. Optional on input, overwritten on ingestion.
    #[serde(default)]
    pub id: String,
    pub topic: String,
    pub body: String,
    pub send_in: i64,
}

impl DelayedMessage {
    pub fn new(topic: impl Into<String>, body: impl Into<String>, send_in: i64) -> Self {
        Self {
            id: String::new(),
            topic: topic.into(),
            body: body.into(),
            send_in,
        }
    }

    /// Checks the request fields. Does not look at `id`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.topic.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        if !is_valid_topic_name(&self.topic) {
            return Err(ValidationError::InvalidTopicName(self.topic.clone()));
        }
        if self.body.is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        if self.send_in <= 0 {
            return Err(ValidationError::NonPositiveDelay(self.send_in));
        }
        Ok(())
    }

    /// Score under which the message is stored: `now + send_in`.
    pub fn execute_at(&self, now: i64) -> Result<i64, ValidationError> {
        now.checked_add(self.send_in)
            .ok_or(ValidationError::DelayOverflow(self.send_in))
    }
}

/// A message popped from the store on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueMessage {
    /// The store member the message was decoded from. Reused verbatim if
    /// the message has to go back into the store.
    pub member: String,
    pub message: DelayedMessage,
}

impl DueMessage {
    pub fn decode(member: String) -> Result<Self, serde_json::Error> {
        let message = decode_message(member.as_bytes())?;
        Ok(Self { member, message })
    }
}

/// Decodes a raw delay request or a stored member.
pub fn decode_message(bytes: &[u8]) -> Result<DelayedMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Serializes a message into its store member form.
pub fn encode_message(msg: &DelayedMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// NSQ topic names: 1..=64 chars of `[.a-zA-Z0-9_-]`, optionally ending
/// in `#ephemeral` (which counts toward the length).
pub fn is_valid_topic_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN {
        return false;
    }
    let stem = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !stem.is_empty()
        && stem
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Current unix time in whole seconds.
pub fn current_unix_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
