//! Typed events delivered to listener callbacks.

use perch_core::{ChatMessage, FileInfo};
use serde_json::Value;

/// A decoded room notification. `Clone` so every interested registry gets its
/// own copy.
#[derive(Debug, Clone)]
pub enum Event {
    /// A chat message.
    Chat(ChatMessage),
    /// A single file appearing after the initial listing.
    File(FileInfo),
    /// The initial file listing sent right after subscribing.
    InitialFiles(Vec<FileInfo>),
    /// A file was removed; carries the file id.
    FileRemoved(String),
    /// Moderation purged chat messages; carries the message ids.
    RemovedMessages(Vec<u64>),
    /// Initial config push or a later config change (raw key/value map).
    Config(Value),
    /// Occupant count changed.
    UserCount(u64),
    /// A single user-info key/value update.
    UserInfo { key: String, value: Value },
    /// Own nick was changed by the server.
    NickChanged(String),
    /// Server time, in seconds.
    Time(f64),
    /// The room subscription is live; messages will flow now.
    Subscribed,
    /// Any other notification, passed through raw.
    Generic { target: String, data: Value },
}

impl Event {
    /// The registry key listeners subscribe under.
    pub fn kind(&self) -> &str {
        match self {
            Event::Chat(_) => "chat",
            Event::File(_) => "file",
            Event::InitialFiles(_) => "initial_files",
            Event::FileRemoved(_) => "delete_file",
            Event::RemovedMessages(_) => "removed_messages",
            Event::Config(_) => "config",
            Event::UserCount(_) => "user_count",
            Event::UserInfo { .. } => "user_info",
            Event::NickChanged(_) => "user",
            Event::Time(_) => "time",
            Event::Subscribed => "subscribed",
            Event::Generic { target, .. } => target,
        }
    }
}
