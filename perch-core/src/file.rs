//! Shared-file descriptors as pushed over the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One file offered in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub fid: String,
    pub name: String,
    pub file_type: String,
    pub size: u64,
    /// Expiry as seconds since the epoch.
    pub expire_time: u64,
    pub uploader: String,
}

impl FileInfo {
    /// Parse a wire file entry
    /// `[id, name, type, size, expire_ms, _, {nick|user}]`.
    pub fn from_wire(entry: &Value) -> Option<FileInfo> {
        let e = entry.as_array()?;
        let uploader = e
            .get(6)
            .map(|u| {
                u.get("nick")
                    .or_else(|| u.get("user"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned()
            })
            .unwrap_or_default();
        Some(FileInfo {
            fid: e.first()?.as_str()?.to_owned(),
            name: e.get(1)?.as_str()?.to_owned(),
            file_type: e.get(2).and_then(Value::as_str).unwrap_or("").to_owned(),
            size: e.get(3).and_then(Value::as_u64).unwrap_or(0),
            expire_time: e.get(4).and_then(Value::as_u64).unwrap_or(0) / 1000,
            uploader,
        })
    }

    /// Whether the file has expired at `now` (seconds since the epoch).
    pub fn expired(&self, now: u64) -> bool {
        self.expire_time != 0 && now >= self.expire_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_entry() {
        let f = FileInfo::from_wire(&json!([
            "f42", "cat.ogg", "audio", 1024, 1_700_000_000_000u64, null, {"nick": "alice"}
        ]))
        .unwrap();
        assert_eq!(f.fid, "f42");
        assert_eq!(f.name, "cat.ogg");
        assert_eq!(f.file_type, "audio");
        assert_eq!(f.size, 1024);
        assert_eq!(f.expire_time, 1_700_000_000);
        assert_eq!(f.uploader, "alice");
    }

    #[test]
    fn uploader_falls_back_to_user_key() {
        let f = FileInfo::from_wire(&json!([
            "f1", "a", "other", 1, 0, null, {"user": "bob"}
        ]))
        .unwrap();
        assert_eq!(f.uploader, "bob");
    }

    #[test]
    fn malformed_entry_is_none() {
        assert!(FileInfo::from_wire(&json!({"not": "an array"})).is_none());
        assert!(FileInfo::from_wire(&json!([12, "name"])).is_none());
    }

    #[test]
    fn expiry() {
        let f = FileInfo::from_wire(&json!(["f1", "a", "t", 1, 5_000_000, null, {}])).unwrap();
        assert!(!f.expired(4_000));
        assert!(f.expired(5_000));
        assert!(f.expired(6_000));
    }
}
