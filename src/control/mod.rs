//! TWAMP-Control: message codec and the per-connection state machine.

pub mod channel;
pub mod messages;

pub use channel::{ChannelOutcome, ChannelState, ControlChannel};
pub use messages::{Command, ControlMessage, DecodeError, Greeting};

use std::{io, time::Duration};

use thiserror::Error;

/// Default bound on handshake reads, message remainders and writes.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that terminate a control connection.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection mid-message ({expected} bytes expected)")]
    ShortRead { expected: usize },
    #[error("peer stopped accepting data ({expected} bytes to write)")]
    ShortWrite { expected: usize },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer requested unsupported mode {0:#04x}")]
    UnsupportedMode(u8),
    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("session expired while its control connection was open")]
    SessionExpired,
}
