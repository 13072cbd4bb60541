use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a conversation history; insertion order is chronological.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Response body for `POST /api/chat`. `message` is always present in the
/// JSON, the optional fields are omitted when unset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatResponse {
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}
