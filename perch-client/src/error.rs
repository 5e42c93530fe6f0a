//! Client error type. `Clone` because connection-fatal errors are stored once
//! in the connection's exception slot and re-raised to every caller thread.

use perch_core::protocol::ProtocolError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed remotely")]
    RemoteClose,
    #[error("last ping remained unanswered")]
    PingTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rest call failed: {0}")]
    Rest(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("service refused us ({code}): {message}")]
    Refused { code: u16, message: String },
    #[error("no active listeners for this thread")]
    NoListeners,
    #[error("event loop is not running")]
    LoopClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("not allowed: {0}")]
    Denied(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::PingTimeout => Error::PingTimeout,
            ProtocolError::RemoteClose => Error::RemoteClose,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Rest(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
