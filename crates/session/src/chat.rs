use chrono::{DateTime, Utc};
use parley_proto::UserInfo;
use serde::{Deserialize, Serialize};

/// The structured chat message that gets encrypted whole. Both transport
/// paths carry the same shape, so decryption never inspects the route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: UserInfo,
    pub content: ChatContent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatContent {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: UserInfo, text: String) -> Self {
        Self {
            kind: "chat".to_string(),
            sender,
            content: ChatContent {
                text,
                timestamp: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_wire_shape() {
        let message = ChatMessage::new(
            UserInfo {
                id: "u1".to_string(),
                name: "Alice".to_string(),
            },
            "hi".to_string(),
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["sender"]["name"], "Alice");
        assert_eq!(value["content"]["text"], "hi");
        assert!(value["content"]["timestamp"].is_string());
    }
}
