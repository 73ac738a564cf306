use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

impl Default for PresenceStatus {
    fn default() -> Self {
        Self::Online
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: i64,
    pub status: PresenceStatus,
}

#[cfg(test)]
mod tests {
    use super::PresenceStatus;

    #[test]
    fn status_uses_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&PresenceStatus::Dnd).unwrap(),
            "\"dnd\""
        );
        let parsed: PresenceStatus = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(parsed, PresenceStatus::Offline);
    }
}
