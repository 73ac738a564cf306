use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted chat message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub author_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Client-supplied nonce echoed back for optimistic-UI reconciliation.
    /// Never persisted; only present on the MESSAGE_CREATE dispatch that
    /// answers the originating send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}
