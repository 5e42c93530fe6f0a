//! The room façade: connect, chat, files, uploads, account operations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use perch_core::util::random_id;
use perch_core::{FileInfo, RoomConfig};
use serde_json::{json, Value};
use tracing::debug;

use crate::arbitrator::Arbitrator;
use crate::connection::{listen_shared, Connection, ConnectionOptions};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::rest::{expect_ok, Session};
use crate::transport::WsTransport;

/// Room state maintained by the notification handlers, snapshotted by the
/// [`Room`] accessors.
#[derive(Default)]
pub(crate) struct RoomState {
    pub nick: Option<String>,
    pub user_count: u64,
    pub files: BTreeMap<String, FileInfo>,
    pub config: RoomConfig,
    pub key: Option<String>,
    pub user_flags: HashMap<String, Value>,
}

/// How to join a room.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub name: String,
    /// Nick to join as; a random one is generated when absent.
    pub nick: Option<String>,
    pub password: Option<String>,
    pub key: Option<String>,
    pub connection: ConnectionOptions,
}

impl RoomOptions {
    pub fn new(name: &str) -> RoomOptions {
        RoomOptions {
            name: name.to_owned(),
            nick: None,
            password: None,
            key: None,
            connection: ConnectionOptions::default(),
        }
    }

    pub fn nick(mut self, nick: &str) -> Self {
        self.nick = Some(nick.to_owned());
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_owned());
        self
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn connection(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }
}

/// Chat message flavor for [`Room::post_chat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStyle {
    Plain,
    /// `/me` emote.
    Me,
    /// Staff broadcast; needs mod rights.
    Announcement,
}

/// One joined room. Share the [`Session`] between rooms to carry a login over.
pub struct Room {
    conn: Connection,
    session: Arc<Session>,
    room_id: String,
    name: String,
    password: Option<String>,
    key: Option<String>,
    login: Mutex<Option<String>>,
    upload_count: AtomicU64,
}

impl Room {
    /// Fetch the room config over REST, then open the websocket through the
    /// arbitrator. Blocks until the connection is up.
    pub fn connect(
        arbitrator: &Arc<Arbitrator>,
        session: Arc<Session>,
        options: RoomOptions,
    ) -> Result<Room> {
        let mut params = vec![("room", options.name.clone())];
        if let Some(key) = &options.key {
            params.push(("roomKey", key.clone()));
        }
        if let Some(password) = &options.password {
            params.push(("password", password.clone()));
        }
        let raw = expect_ok(session.call("getRoomConfig", &params, Some(&options.name))?)?;

        let mut config = RoomConfig::default();
        config.update_from_wire(&raw);
        let checksum = raw
            .get("checksum2")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("room config without a checksum".into()))?;
        let room_id = if config.room_id.is_empty() {
            options.name.clone()
        } else {
            config.room_id.clone()
        };

        let nick = match &options.nick {
            Some(nick) => nick.clone(),
            None => random_id(6),
        };
        validate_nick(&nick, config.max_nick)?;

        let mut ws_url = format!(
            "{}?room={}&cs={}&nick={}&rn={}&t={}&transport=websocket&EIO=3",
            session.config().ws_url,
            room_id,
            checksum,
            nick,
            random_id(6),
            now_millis(),
        );
        if let Some(password) = &options.password {
            ws_url.push_str(&format!("&password={password}"));
        } else if let Some(key) = &options.key {
            ws_url.push_str(&format!("&key={key}"));
        }

        let agent = session.config().agent.clone();
        let cookies = session.cookie_header();
        debug!(room = %options.name, %nick, "joining");
        let conn = arbitrator.create_connection(options.connection.clone(), move || async move {
            WsTransport::connect(&ws_url, &agent, cookies.as_deref()).await
        })?;

        {
            let mut state = conn.shared().room().lock().unwrap();
            state.config = config;
            state.nick = Some(nick);
        }
        conn.shared().check()?;

        Ok(Room {
            conn,
            session,
            room_id,
            name: options.name,
            password: options.password,
            key: options.key,
            login: Mutex::new(None),
            upload_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn connected(&self) -> bool {
        self.conn.connected()
    }

    /// Current nick, as last confirmed or seeded at join time.
    pub fn nick(&self) -> Option<String> {
        self.state().lock().unwrap().nick.clone()
    }

    pub fn user_count(&self) -> u64 {
        self.state().lock().unwrap().user_count
    }

    /// Snapshot of the room's files, expired ones filtered out.
    pub fn files(&self) -> Vec<FileInfo> {
        let now = now_secs();
        self.state()
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|f| !f.expired(now))
            .cloned()
            .collect()
    }

    /// Snapshot of the room configuration.
    pub fn config(&self) -> RoomConfig {
        self.state().lock().unwrap().config.clone()
    }

    pub fn add_listener(
        &self,
        kind: &str,
        callback: impl FnMut(&Event) -> bool + Send + 'static,
    ) -> Result<()> {
        self.conn.add_listener(kind, callback)
    }

    /// Deliver this thread's events until its last listener detaches or the
    /// connection ends.
    pub fn listen(&self) -> Result<()> {
        self.conn.listen()
    }

    /// Listen until the initial room information has arrived: attaches a
    /// one-shot `time` listener and drains once.
    pub fn listen_once(&self) -> Result<()> {
        self.add_listener("time", |_| false)?;
        self.conn.listen()
    }

    /// Post a chat message. Length-checked against the room config.
    pub fn post_chat(&self, text: &str, style: ChatStyle) -> Result<()> {
        let (nick, max_message) = {
            let state = self.state().lock().unwrap();
            (state.nick.clone(), state.config.max_message)
        };
        if text.chars().count() as u64 > max_message {
            return Err(Error::InvalidArg(format!(
                "chat messages are capped at {max_message} characters"
            )));
        }
        let nick = nick.ok_or(Error::NotConnected)?;
        match style {
            ChatStyle::Plain => self.conn.make_call("chat", vec![json!(nick), json!(text)]),
            ChatStyle::Me => self
                .conn
                .make_call("command", vec![json!(nick), json!("me"), json!(text)]),
            ChatStyle::Announcement => {
                if !self.is_mod() {
                    return Err(Error::Denied("announcements need mod rights".into()));
                }
                self.conn
                    .make_call("command", vec![json!(nick), json!("a"), json!(text)])
            }
        }
    }

    /// Report the room to the moderators.
    pub fn report(&self, reason: &str) -> Result<()> {
        self.conn
            .make_call("submitReport", vec![json!({ "reason": reason })])
    }

    /// Remove files. Owner or janitor rights required.
    pub fn delete_files(&self, ids: &[&str]) -> Result<()> {
        if !self.is_owner() && !self.is_mod() {
            return Err(Error::Denied("deleting files needs owner rights".into()));
        }
        self.conn.make_call("deleteFiles", vec![json!(ids)])
    }

    /// Change one room config field over REST. Owner rights required; field
    /// names match [`RoomConfig`]'s.
    pub fn set_config(&self, field: &str, value: Value) -> Result<()> {
        if !self.is_owner() && !self.is_mod() {
            return Err(Error::Denied("changing config needs owner rights".into()));
        }
        let wire_key = RoomConfig::wire_key(field)
            .ok_or_else(|| Error::InvalidArg(format!("unknown config field {field}")))?;
        let mut change = serde_json::Map::new();
        change.insert(wire_key.to_owned(), value);
        let params = [
            ("room", self.room_id.clone()),
            ("config", Value::Object(change).to_string()),
        ];
        expect_ok(self.session.call("setRoomConfig", &params, Some(&self.name))?)?;
        Ok(())
    }

    /// Time a chatter out. Mod or owner rights required.
    pub fn timeout_chat(&self, msg_id: u64, duration: Duration) -> Result<()> {
        if !self.is_owner() && !self.is_mod() {
            return Err(Error::Denied("timeouts need mod rights".into()));
        }
        self.conn.make_call(
            "timeoutChat",
            vec![json!(msg_id), json!(duration.as_secs())],
        )
    }

    /// Ban by account name and/or address. Mod rights required.
    pub fn ban(&self, nicks: &[&str], addresses: &[&str], hours: u64, reason: &str) -> Result<()> {
        if !self.is_mod() {
            return Err(Error::Denied("bans need mod rights".into()));
        }
        let who = ban_targets(nicks, addresses)?;
        self.conn.make_call(
            "banUser",
            vec![
                who,
                json!({
                    "ban": false,
                    "hellban": false,
                    "mute": false,
                    "purgeFiles": false,
                    "hours": hours,
                    "reason": reason,
                }),
            ],
        )
    }

    /// Lift a ban. Mod rights required.
    pub fn unban(&self, nicks: &[&str], addresses: &[&str], reason: &str) -> Result<()> {
        if !self.is_mod() {
            return Err(Error::Denied("bans need mod rights".into()));
        }
        let who = ban_targets(nicks, addresses)?;
        self.conn.make_call(
            "unbanUser",
            vec![
                who,
                json!({
                    "ban": true,
                    "hellban": true,
                    "mute": true,
                    "timeout": true,
                    "reason": reason,
                }),
            ],
        )
    }

    /// Account stats for `name`, or `None` when no such account exists.
    pub fn user_stats(&self, name: &str) -> Result<Option<Value>> {
        if name.is_empty() {
            return Ok(None);
        }
        let page = self
            .session
            .get(&format!("{}/user/{name}", self.session.config().base_url))?;
        if !page.status().is_success() {
            return Ok(None);
        }
        let params = [("name", name.to_owned())];
        Ok(Some(expect_ok(self.session.call(
            "getUserInfo",
            &params,
            Some(&self.name),
        )?)?))
    }

    /// Ask the server what it knows about a file. Waits up to five seconds
    /// for the server-side callback.
    pub fn fileinfo(&self, fid: &str) -> Result<Value> {
        let shared = self.conn.shared();
        let (cid, rx) = shared.register_callback();
        self.conn
            .make_call("getFileinfo", vec![json!(fid), json!(cid)])?;
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(info) => Ok(info),
            Err(_) => {
                shared.forget_callback(&cid);
                Err(Error::Timeout("fileinfo callback"))
            }
        }
    }

    /// Upload a file, optionally under a different name. Returns the file id.
    pub fn upload_file(&self, path: &Path, upload_as: Option<&str>) -> Result<String> {
        let filename = match upload_as {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::InvalidArg("upload path has no file name".into()))?
                .to_owned(),
        };
        let max_file = self.state().lock().unwrap().config.max_file;
        let size = std::fs::metadata(path)?.len();
        if size > max_file {
            return Err(Error::InvalidArg(format!(
                "files are capped at {} GiB",
                max_file >> 30
            )));
        }

        let (upload_key, server, file_id) = self.generate_upload_key()?;
        debug!(%file_id, %server, "uploading {filename}");

        let mut params = vec![
            ("room", self.room_id.clone()),
            ("key", upload_key),
            ("filename", filename.clone()),
        ];
        if let Some(key) = &self.key {
            params.push(("roomKey", key.clone()));
        }
        if let Some(password) = &self.password {
            params.push(("password", password.clone()));
        }

        let part = reqwest::blocking::multipart::Part::reader(std::fs::File::open(path)?)
            .file_name(filename);
        let form = reqwest::blocking::multipart::Form::new().part("file", part);
        self.session
            .post_multipart(&format!("https://{server}/upload"), &params, form)?;
        Ok(file_id)
    }

    /// Log in as the current nick. The session token is installed on the live
    /// connection and stored in the REST cookie jar for later rooms.
    pub fn login(&self, password: &str) -> Result<()> {
        if self.login.lock().unwrap().is_some() {
            return Err(Error::Denied("already logged in".into()));
        }
        let nick = self.nick().ok_or(Error::NotConnected)?;
        let params = [("name", nick), ("password", password.to_owned())];
        let resp = expect_ok(self.session.call("login", &params, Some(&self.name))?)?;
        let token = resp
            .get("session")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Rest("login response without a session".into()))?
            .to_owned();
        self.conn.make_call("useSession", vec![json!(token)])?;
        self.session.set_session_cookie(&token);
        *self.login.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Register the current nick as an account and adopt the fresh session.
    pub fn register(&self, password: &str) -> Result<()> {
        if self.login.lock().unwrap().is_some() {
            return Err(Error::Denied("already logged in".into()));
        }
        if password.len() < 8 {
            return Err(Error::InvalidArg(
                "passwords need at least 8 characters".into(),
            ));
        }
        let nick = self.nick().ok_or(Error::NotConnected)?;
        let params = [("name", nick), ("password", password.to_owned())];
        let resp = expect_ok(self.session.call("register", &params, Some(&self.name))?)?;
        let token = resp
            .get("session")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Rest("register response without a session".into()))?
            .to_owned();
        self.conn.make_call("useSession", vec![json!(token)])?;
        self.session.set_session_cookie(&token);
        *self.login.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Log the current session out, on the server and locally.
    pub fn logout(&self) -> Result<()> {
        if self.login.lock().unwrap().is_none() {
            return Err(Error::Denied("not logged in".into()));
        }
        let params = [("room", self.room_id.clone())];
        let resp = expect_ok(self.session.call("logout", &params, Some(&self.name))?)?;
        if !resp.get("success").and_then(Value::as_bool).unwrap_or(false) {
            return Err(Error::Rest("logout unsuccessful".into()));
        }
        self.conn
            .make_call("logout", vec![json!({ "room": self.room_id })])?;
        self.session.clear_session_cookie();
        *self.login.lock().unwrap() = None;
        Ok(())
    }

    /// Change nick. Only possible while logged out.
    pub fn change_nick(&self, new_nick: &str) -> Result<()> {
        if self.login.lock().unwrap().is_some() {
            return Err(Error::Denied("log out before changing nick".into()));
        }
        let max_nick = self.state().lock().unwrap().config.max_nick;
        validate_nick(new_nick, max_nick)?;
        let nick = self.nick().ok_or(Error::NotConnected)?;
        self.conn.make_call(
            "command",
            vec![json!(nick), json!("nick"), json!(new_nick)],
        )?;
        self.state().lock().unwrap().nick = Some(new_nick.to_owned());
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.conn.close()
    }

    fn state(&self) -> &Mutex<RoomState> {
        self.conn.shared().room()
    }

    fn is_owner(&self) -> bool {
        let state = self.state().lock().unwrap();
        match (&state.nick, state.config.owner.as_str()) {
            (Some(nick), owner) if !owner.is_empty() => nick.eq_ignore_ascii_case(owner),
            _ => false,
        }
    }

    fn is_mod(&self) -> bool {
        let state = self.state().lock().unwrap();
        ["admin", "staff", "janitor"].iter().any(|flag| {
            state
                .user_flags
                .get(*flag)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
    }

    /// Ask the service for an upload slot, waiting out throttle intervals.
    fn generate_upload_key(&self) -> Result<(String, String, String)> {
        let nick = self.nick().ok_or(Error::NotConnected)?;
        loop {
            let mut params = vec![
                ("name", nick.clone()),
                ("room", self.room_id.clone()),
                ("c", self.upload_count.fetch_add(1, Ordering::Relaxed).to_string()),
            ];
            if let Some(key) = &self.key {
                params.push(("roomKey", key.clone()));
            }
            if let Some(password) = &self.password {
                params.push(("password", password.clone()));
            }
            let info = self.session.call("getUploadKey", &params, Some(&self.name))?;
            let slot = (
                info.get("key").and_then(Value::as_str),
                info.get("server").and_then(Value::as_str),
                info.get("file_id").and_then(Value::as_str),
            );
            if let (Some(key), Some(server), Some(file_id)) = slot {
                return Ok((key.to_owned(), server.to_owned(), file_id.to_owned()));
            }
            let backoff = info
                .pointer("/error/info/timeout")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if backoff == 0 {
                return Err(Error::Rest(format!("could not get an upload key: {info}")));
            }
            debug!(backoff, "upload throttled");
            std::thread::sleep(Duration::from_millis(backoff / 10));
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        let _ = self.conn.close();
    }
}

/// Drain several rooms' listeners on the calling thread; all rooms must share
/// one arbitrator. Returns when every room is done.
pub fn listen_many(rooms: &[&Room]) -> Result<()> {
    let first = match rooms.first() {
        Some(room) => room.conn.shared().arbitrator().clone(),
        None => return Err(Error::NoListeners),
    };
    if rooms
        .iter()
        .any(|r| !Arc::ptr_eq(r.conn.shared().arbitrator(), &first))
    {
        return Err(Error::InvalidArg(
            "rooms must share one arbitrator to be listened together".into(),
        ));
    }
    let shareds: Vec<_> = rooms.iter().map(|r| r.conn.shared()).collect();
    listen_shared(&shareds)
}

fn validate_nick(nick: &str, max_nick: u64) -> Result<()> {
    let len = nick.chars().count() as u64;
    if len < 3 || len > max_nick {
        return Err(Error::InvalidArg(format!(
            "nicks must be between 3 and {max_nick} characters"
        )));
    }
    if !nick.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidArg(
            "nicks may only contain alphanumeric characters".into(),
        ));
    }
    Ok(())
}

/// `[{"user": nick}...]` / `[{"ip": address}...]` list for ban calls.
fn ban_targets(nicks: &[&str], addresses: &[&str]) -> Result<Value> {
    if nicks.is_empty() && addresses.is_empty() {
        return Err(Error::InvalidArg(
            "ban calls need at least one nick or address".into(),
        ));
    }
    let mut who = Vec::new();
    for address in addresses {
        who.push(json!({ "ip": address }));
    }
    for nick in nicks {
        who.push(json!({ "user": nick }));
    }
    Ok(Value::Array(who))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_validation() {
        assert!(validate_nick("abc", 12).is_ok());
        assert!(validate_nick("ab", 12).is_err());
        assert!(validate_nick("abcdefghijklm", 12).is_err());
        assert!(validate_nick("with space", 12).is_err());
        assert!(validate_nick("under_score", 12).is_err());
    }

    #[test]
    fn ban_target_lists() {
        assert!(ban_targets(&[], &[]).is_err());
        assert_eq!(
            ban_targets(&["alice"], &["10.0.0.1", "10.0.0.2"]).unwrap(),
            json!([
                { "ip": "10.0.0.1" },
                { "ip": "10.0.0.2" },
                { "user": "alice" },
            ])
        );
    }
}
