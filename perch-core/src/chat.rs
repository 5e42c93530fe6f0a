//! Chat messages: wire-part parsing and sender roles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::strip_tags;

/// Sender role, derived from the option flags attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    White,
    User,
    Pro,
    Janitor,
    Donor,
    Staff,
    Admin,
    System,
}

impl Role {
    /// Derive the role from an options object. Flags on messages without a
    /// profile come from the service itself.
    pub fn from_options(options: &Value) -> Role {
        let has = |key: &str| options.get(key).is_some();
        if has("profile") {
            if has("admin") {
                Role::Admin
            } else if has("staff") {
                Role::Staff
            } else if has("pro") {
                Role::Pro
            } else if has("janitor") {
                Role::Janitor
            } else if has("donator") {
                Role::Donor
            } else if has("user") {
                Role::User
            } else {
                Role::White
            }
        } else if has("admin") || has("staff") {
            Role::System
        } else {
            Role::White
        }
    }
}

/// One chat message: flattened text plus referenced file ids and room links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub nick: String,
    pub text: String,
    pub role: Role,
    /// Ids of files referenced inline.
    pub files: Vec<String>,
    /// (room id, room name) pairs referenced inline.
    pub rooms: Vec<(String, String)>,
    /// Server-side message id, when the sender can be moderated.
    pub msg_id: Option<u64>,
    /// Sender address, visible to privileged sessions only.
    pub ip: Option<String>,
    /// Whether this echoes a message we sent ourselves.
    pub own: bool,
}

impl ChatMessage {
    /// Build a message from raw protocol data. Unknown part types are skipped.
    pub fn from_data(data: &Value) -> ChatMessage {
        let mut text = String::new();
        let mut files = Vec::new();
        let mut rooms = Vec::new();

        if let Some(parts) = data.get("message").and_then(Value::as_array) {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(v) = part.get("value").and_then(Value::as_str) {
                            text.push_str(v);
                        }
                    }
                    Some("break") => text.push('\n'),
                    Some("file") => {
                        if let Some(id) = part.get("id").and_then(Value::as_str) {
                            files.push(id.to_owned());
                            text.push('@');
                            text.push_str(id);
                        }
                    }
                    Some("room") => {
                        if let Some(id) = part.get("id").and_then(Value::as_str) {
                            let name = part
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or(id)
                                .to_owned();
                            rooms.push((id.to_owned(), name));
                            text.push('#');
                            text.push_str(id);
                        }
                    }
                    Some("url") => {
                        if let Some(v) = part.get("text").and_then(Value::as_str) {
                            text.push_str(v);
                        }
                    }
                    Some("raw") => {
                        if let Some(v) = part.get("value").and_then(Value::as_str) {
                            text.push_str(&strip_tags(v));
                        }
                    }
                    _ => {}
                }
            }
        }

        let options = data.get("options").cloned().unwrap_or(Value::Null);
        let extra = data.get("data").cloned().unwrap_or(Value::Null);
        ChatMessage {
            nick: data
                .get("nick")
                .and_then(Value::as_str)
                .unwrap_or("n/a")
                .to_owned(),
            text,
            role: Role::from_options(&options),
            files,
            rooms,
            msg_id: extra.get("id").and_then(Value::as_u64),
            ip: extra.get("ip").and_then(Value::as_str).map(str::to_owned),
            own: extra.get("self").and_then(Value::as_bool).unwrap_or(false),
        }
    }

    pub fn purple(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Staff)
    }

    pub fn green(&self) -> bool {
        matches!(self.role, Role::User | Role::Pro | Role::Donor | Role::Janitor)
    }

    pub fn system(&self) -> bool {
        self.role == Role::System
    }

    pub fn logged_in(&self) -> bool {
        self.green() || self.purple()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mixed_parts_in_order() {
        let msg = ChatMessage::from_data(&json!({
            "nick": "alice",
            "message": [
                {"type": "text", "value": "see "},
                {"type": "file", "id": "f123"},
                {"type": "break"},
                {"type": "room", "id": "den", "name": "The Den"},
                {"type": "url", "text": "https://example.org"},
                {"type": "raw", "value": "<i>huh</i>"},
                {"type": "hologram", "value": "???"}
            ]
        }));
        assert_eq!(msg.nick, "alice");
        assert_eq!(msg.text, "see @f123\n#denhttps://example.orghuh");
        assert_eq!(msg.files, vec!["f123"]);
        assert_eq!(msg.rooms, vec![("den".to_string(), "The Den".to_string())]);
    }

    #[test]
    fn roles_from_options() {
        assert_eq!(Role::from_options(&json!({"profile": "x", "admin": true})), Role::Admin);
        assert_eq!(Role::from_options(&json!({"profile": "x", "user": true})), Role::User);
        assert_eq!(Role::from_options(&json!({"profile": "x"})), Role::White);
        assert_eq!(Role::from_options(&json!({"admin": true})), Role::System);
        assert_eq!(Role::from_options(&json!({})), Role::White);
    }

    #[test]
    fn own_message_and_moderation_data() {
        let msg = ChatMessage::from_data(&json!({
            "nick": "bob",
            "message": [{"type": "text", "value": "hi"}],
            "options": {"profile": "bob", "user": true},
            "data": {"self": true, "id": 991, "ip": "10.0.0.1"}
        }));
        assert!(msg.own);
        assert!(msg.green());
        assert!(msg.logged_in());
        assert_eq!(msg.msg_id, Some(991));
        assert_eq!(msg.ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn tolerates_missing_fields() {
        let msg = ChatMessage::from_data(&json!({}));
        assert_eq!(msg.nick, "n/a");
        assert_eq!(msg.text, "");
        assert!(!msg.own);
    }
}
