//! Blocking client for perch rooms: one shared event-loop thread per
//! [`Arbitrator`], per-thread listener registries, and a REST session for
//! everything outside the websocket.
//!
//! ```no_run
//! use perch_client::{Arbitrator, ChatStyle, Room, RoomOptions, ServiceConfig, Session};
//! use std::sync::Arc;
//!
//! # fn main() -> perch_client::Result<()> {
//! let arbitrator = Arbitrator::new()?;
//! let session = Arc::new(Session::new(ServiceConfig::default())?);
//! let room = Room::connect(&arbitrator, session, RoomOptions::new("BEEPi"))?;
//! room.post_chat("hello", ChatStyle::Plain)?;
//! room.add_listener("chat", |event| {
//!     println!("{event:?}");
//!     true
//! })?;
//! room.listen()?;
//! # Ok(())
//! # }
//! ```

mod arbitrator;
mod connection;
mod error;
mod event;
mod handler;
mod listeners;
mod rest;
mod room;
mod transport;

pub use arbitrator::Arbitrator;
pub use connection::{Connection, ConnectionOptions};
pub use error::{Error, Result};
pub use event::Event;
pub use rest::{expect_ok, ServiceConfig, Session};
pub use room::{listen_many, ChatStyle, Room, RoomOptions};
pub use transport::{Transport, WsTransport};
