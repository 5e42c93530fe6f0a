//! Room configuration: typed fields plus the wire-key mapping used to apply
//! config pushes and to address fields in REST `setRoomConfig` calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Room configuration snapshot. Updated from the initial REST fetch and from
/// `config`/`changed_config` pushes; wrong-typed wire values are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub room_id: String,
    pub alias: Option<String>,
    pub title: String,
    pub motd: String,
    pub owner: String,
    pub janitors: Vec<String>,
    pub adult: bool,
    pub private: bool,
    pub disabled: bool,
    pub max_title: u64,
    pub max_message: u64,
    pub max_nick: u64,
    pub max_file: u64,
    pub session_lifetime: u64,
    pub file_ttl: u64,
    pub creation_time: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            alias: None,
            title: String::new(),
            motd: String::new(),
            owner: String::new(),
            janitors: Vec::new(),
            adult: false,
            private: true,
            disabled: false,
            max_title: 24,
            max_message: 300,
            max_nick: 12,
            max_file: 10 << 30,
            session_lifetime: 0,
            file_ttl: 0,
            creation_time: 0,
        }
    }
}

impl RoomConfig {
    /// Apply a wire config object, taking only recognized, correctly typed keys.
    pub fn update_from_wire(&mut self, data: &Value) {
        let obj = match data.as_object() {
            Some(o) => o,
            None => return,
        };
        for (key, value) in obj {
            self.apply(key, value);
        }
    }

    /// Apply one wire key/value pair (as pushed by `changed_config`).
    pub fn apply(&mut self, wire_key: &str, value: &Value) {
        match wire_key {
            "room_id" => take_string(value, &mut self.room_id),
            "custom_room_id" => {
                if let Some(s) = value.as_str() {
                    self.alias = Some(s.to_owned());
                }
            }
            "name" => take_string(value, &mut self.title),
            "motd" => take_string(value, &mut self.motd),
            "owner" => take_string(value, &mut self.owner),
            "janitors" => {
                if let Some(arr) = value.as_array() {
                    self.janitors = arr
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect();
                }
            }
            "adult" => take_bool(value, &mut self.adult),
            "private" => take_bool(value, &mut self.private),
            "disabled" => take_bool(value, &mut self.disabled),
            "max_room_name_length" => take_u64(value, &mut self.max_title),
            "chat_max_message_length" => take_u64(value, &mut self.max_message),
            "chat_max_alias_length" => take_u64(value, &mut self.max_nick),
            "file_max_size" => take_u64(value, &mut self.max_file),
            "session_lifetime" => take_u64(value, &mut self.session_lifetime),
            "file_ttl" => take_u64(value, &mut self.file_ttl),
            "created_time" => take_u64(value, &mut self.creation_time),
            _ => {}
        }
    }

    /// Wire key for a friendly field name, for REST `setRoomConfig` calls.
    pub fn wire_key(field: &str) -> Option<&'static str> {
        Some(match field {
            "room_id" => "room_id",
            "alias" => "custom_room_id",
            "title" => "name",
            "motd" => "motd",
            "owner" => "owner",
            "janitors" => "janitors",
            "adult" => "adult",
            "private" => "private",
            "disabled" => "disabled",
            "max_title" => "max_room_name_length",
            "max_message" => "chat_max_message_length",
            "max_nick" => "chat_max_alias_length",
            "max_file" => "file_max_size",
            "session_lifetime" => "session_lifetime",
            "file_ttl" => "file_ttl",
            "creation_time" => "created_time",
            _ => return None,
        })
    }
}

fn take_string(value: &Value, slot: &mut String) {
    if let Some(s) = value.as_str() {
        *slot = s.to_owned();
    }
}

fn take_bool(value: &Value, slot: &mut bool) {
    if let Some(b) = value.as_bool() {
        *slot = b;
    }
}

fn take_u64(value: &Value, slot: &mut u64) {
    if let Some(n) = value.as_u64() {
        *slot = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_takes_mapped_keys() {
        let mut c = RoomConfig::default();
        c.update_from_wire(&json!({
            "name": "lounge",
            "room_id": "r4nd0m",
            "custom_room_id": "lounge-alias",
            "chat_max_message_length": 500,
            "private": false,
            "janitors": ["a", "b"],
            "unrelated": "ignored"
        }));
        assert_eq!(c.title, "lounge");
        assert_eq!(c.room_id, "r4nd0m");
        assert_eq!(c.alias.as_deref(), Some("lounge-alias"));
        assert_eq!(c.max_message, 500);
        assert!(!c.private);
        assert_eq!(c.janitors, vec!["a", "b"]);
    }

    #[test]
    fn wrong_typed_values_are_ignored() {
        let mut c = RoomConfig::default();
        c.update_from_wire(&json!({
            "name": 42,
            "private": "yes",
            "chat_max_message_length": "lots"
        }));
        assert_eq!(c.title, "");
        assert!(c.private);
        assert_eq!(c.max_message, 300);
    }

    #[test]
    fn single_key_change() {
        let mut c = RoomConfig::default();
        c.apply("motd", &json!("welcome"));
        assert_eq!(c.motd, "welcome");
    }

    #[test]
    fn wire_key_mapping() {
        assert_eq!(RoomConfig::wire_key("title"), Some("name"));
        assert_eq!(RoomConfig::wire_key("file_ttl"), Some("file_ttl"));
        assert_eq!(RoomConfig::wire_key("bogus"), None);
    }
}
