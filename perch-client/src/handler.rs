//! Dispatch of decoded application messages into room state and typed events.
//! Runs on the loop thread, inside the connection task.

use std::sync::Arc;

use perch_core::{ChatMessage, FileInfo};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::Shared;
use crate::error::Error;
use crate::event::Event;

/// Notifications passed through raw rather than decoded.
const GENERICS: &[&str] = &[
    "roomScore",
    "submitChat",
    "submitCommand",
    "pro",
    "room_old",
    "upload",
    "reconnectTimeout",
];

/// Handle one decoded bundle. Events are queued into every thread's registry
/// and the blocked threads are woken once at the end.
pub(crate) fn dispatch(shared: &Arc<Shared>, messages: Vec<(String, Value)>) {
    for (target, data) in messages {
        handle_one(shared, &target, data);
    }
    shared.arbitrator().awaken();
}

fn handle_one(shared: &Arc<Shared>, target: &str, data: Value) {
    match target {
        "chat" => {
            shared.enqueue_event(Event::Chat(ChatMessage::from_data(&data)));
        }
        "files" => handle_files(shared, &data),
        "delete_file" => {
            let fid = match data.as_str() {
                Some(fid) => fid.to_owned(),
                None => return warn!(?data, "delete_file without a file id"),
            };
            // Only report files we actually knew about.
            if shared.room().lock().unwrap().files.remove(&fid).is_some() {
                shared.enqueue_event(Event::FileRemoved(fid));
            }
        }
        "config" => {
            shared.room().lock().unwrap().config.update_from_wire(&data);
            shared.enqueue_event(Event::Config(data));
        }
        "changed_config" => {
            let (key, value) = match (data.get("key").and_then(Value::as_str), data.get("value")) {
                (Some(key), Some(value)) => (key.to_owned(), value.clone()),
                _ => return warn!(?data, "malformed config change"),
            };
            shared.room().lock().unwrap().config.apply(&key, &value);
            shared.enqueue_event(Event::Config(Value::Object(
                [(key, value)].into_iter().collect(),
            )));
        }
        "userCount" => {
            let count = data.as_u64().unwrap_or(0);
            shared.room().lock().unwrap().user_count = count;
            shared.enqueue_event(Event::UserCount(count));
        }
        "userInfo" => handle_user_info(shared, &data),
        "chat_name" => {
            let nick = data.as_str().unwrap_or_default().to_owned();
            shared.room().lock().unwrap().nick = Some(nick.clone());
            shared.enqueue_event(Event::NickChanged(nick));
        }
        "time" => {
            if let Some(ms) = data.as_f64() {
                shared.enqueue_event(Event::Time(ms / 1000.0));
            }
        }
        "removeMessages" => {
            let ids = data
                .get("msgIds")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            shared.enqueue_event(Event::RemovedMessages(ids));
        }
        "subscribed" => {
            debug!("subscription live");
            shared.enqueue_event(Event::Subscribed);
        }
        "key" => {
            if let Some(key) = data.as_str() {
                shared.room().lock().unwrap().key = Some(key.to_owned());
            }
            shared.enqueue_event(Event::Generic {
                target: "key".into(),
                data,
            });
        }
        "callback" => handle_callback(shared, &data),
        "401" => shared.fail(Error::Refused {
            code: 401,
            message: "cannot enter a protected room without the proper password".into(),
        }),
        "429" => shared.fail(Error::Refused {
            code: 429,
            message: "too many requests".into(),
        }),
        _ if GENERICS.contains(&target) => {
            shared.enqueue_event(Event::Generic {
                target: target.to_owned(),
                data,
            });
        }
        _ => warn!(kind = target, ?data, "unhandled notification"),
    }
}

/// `files` carries both the initial listing (`set: true`) and later uploads.
fn handle_files(shared: &Arc<Shared>, data: &Value) {
    let initial = data.get("set").and_then(Value::as_bool).unwrap_or(false);
    let entries = match data.get("files").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return warn!(?data, "files notification without a file list"),
    };
    let mut added = Vec::new();
    for entry in entries {
        match FileInfo::from_wire(entry) {
            Some(file) => added.push(file),
            None => warn!(?entry, "skipping malformed file entry"),
        }
    }
    {
        let mut room = shared.room().lock().unwrap();
        for file in &added {
            room.files.insert(file.fid.clone(), file.clone());
        }
    }
    if initial {
        let listing = shared.room().lock().unwrap().files.values().cloned().collect();
        shared.enqueue_event(Event::InitialFiles(listing));
    } else {
        for file in added {
            shared.enqueue_event(Event::File(file));
        }
    }
}

fn handle_user_info(shared: &Arc<Shared>, data: &Value) {
    let map = match data.as_object() {
        Some(map) => map,
        None => return warn!(?data, "malformed userInfo"),
    };
    for (key, value) in map {
        match key.as_str() {
            "profile" => continue,
            "nick" => {
                let nick = value.as_str().unwrap_or_default().to_owned();
                shared.room().lock().unwrap().nick = Some(nick.clone());
                shared.enqueue_event(Event::NickChanged(nick));
            }
            _ => {
                shared
                    .room()
                    .lock()
                    .unwrap()
                    .user_flags
                    .insert(key.clone(), value.clone());
                // The flag name doubles as an event kind, so listeners can
                // watch a single flag such as "owner" or "admin".
                shared.enqueue_event(Event::Generic {
                    target: key.clone(),
                    data: value.clone(),
                });
            }
        }
        shared.enqueue_event(Event::UserInfo {
            key: key.clone(),
            value: value.clone(),
        });
    }
}

/// Server-side callbacks, as used by `getFileinfo`: `args` is `[error, info]`.
fn handle_callback(shared: &Arc<Shared>, data: &Value) {
    let id = match data.get("id").and_then(Value::as_str) {
        Some(id) => id,
        None => return warn!(?data, "callback without an id"),
    };
    let args = data.get("args").and_then(Value::as_array);
    let result = match args.map(|a| a.as_slice()) {
        Some([Value::Null, info]) => info.clone(),
        Some([err, ..]) => {
            warn!(%err, "callback returned an error");
            err.clone()
        }
        _ => Value::Null,
    };
    shared.resolve_callback(id, result);
}
