use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width of the `message_id` column.
pub const MAX_MESSAGE_ID_LEN: usize = 64;

/// Marker proving a consumer already applied a message's effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

impl ProcessedMessage {
    /// Builds a marker, truncating ids longer than the column allows.
    pub fn new(message_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        let mut message_id = message_id.into();
        if message_id.len() > MAX_MESSAGE_ID_LEN {
            let mut cut = MAX_MESSAGE_ID_LEN;
            while !message_id.is_char_boundary(cut) {
                cut -= 1;
            }
            message_id.truncate(cut);
        }
        Self {
            message_id,
            event_type: event_type.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_ids_are_truncated() {
        let marker = ProcessedMessage::new("x".repeat(100), "USER_FOLLOW");
        assert_eq!(marker.message_id.len(), MAX_MESSAGE_ID_LEN);
    }

    #[test]
    fn test_short_ids_are_kept() {
        let marker = ProcessedMessage::new("abc", "USER_FOLLOW");
        assert_eq!(marker.message_id, "abc");
        assert_eq!(marker.event_type, "USER_FOLLOW");
    }
}
