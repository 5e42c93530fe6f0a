//! Perch protocol core.
//! Host-driven: no I/O, no threads; the host feeds frames and timer ticks
//! into [`protocol::ProtocolState`] and performs the returned actions.

pub mod chat;
pub mod config;
pub mod envelope;
pub mod file;
pub mod frame;
pub mod protocol;
pub mod util;

pub use chat::{ChatMessage, Role};
pub use config::RoomConfig;
pub use envelope::DataPayload;
pub use file::FileInfo;
pub use frame::{Frame, FrameError};
pub use protocol::{ProtocolError, ProtocolState, WireAction, DEFAULT_PING_INTERVAL, MAX_UNACKED};
