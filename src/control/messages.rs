//! TWAMP-Control message formats for the unauthenticated subset.
//!
//! Every message has a fixed size. The first octet of a command message is
//! its command code; the Greeting has no command octet and is always the
//! first thing exchanged on a connection.

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Size of the Greeting exchanged by both sides.
pub const GREETING_LEN: usize = 12;

/// Mode bitmap value for unauthenticated mode.
pub const MODE_UNAUTHENTICATED: u8 = 1;

/// Accept code meaning the session was accepted.
pub const ACCEPT_OK: u8 = 0;

/// Errors produced while decoding control messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("unsupported mode {0:#04x}")]
    BadMode(u8),
    #[error("unknown command code {0}")]
    UnknownCommand(u8),
}

/// Control command codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    RequestSession,
    AcceptSession,
    StartSessions,
    StartAck,
    StopSessions,
    StopAck,
}

impl Command {
    /// Maps a wire code to a command.
    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Command::RequestSession),
            3 => Ok(Command::AcceptSession),
            4 => Ok(Command::StopSessions),
            7 => Ok(Command::StartSessions),
            8 => Ok(Command::StartAck),
            9 => Ok(Command::StopAck),
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }

    /// Wire code of the command.
    pub fn code(self) -> u8 {
        match self {
            Command::RequestSession => 1,
            Command::AcceptSession => 3,
            Command::StopSessions => 4,
            Command::StartSessions => 7,
            Command::StartAck => 8,
            Command::StopAck => 9,
        }
    }

    /// Total message length including the command octet.
    pub fn message_len(self) -> usize {
        match self {
            Command::RequestSession | Command::AcceptSession => 28,
            Command::StartSessions
            | Command::StartAck
            | Command::StopSessions
            | Command::StopAck => 12,
        }
    }
}

/// Greeting sent by the server and answered by the client.
///
/// Layout: byte 3 carries the mode bitmap; bytes 4..8 carry an opaque value
/// the server fills with random data. The rest is zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub mode: u8,
    pub opaque: u32,
}

impl Greeting {
    /// Greeting offering or selecting unauthenticated mode.
    pub fn unauthenticated(opaque: u32) -> Self {
        Greeting {
            mode: MODE_UNAUTHENTICATED,
            opaque,
        }
    }

    pub fn encode(&self) -> [u8; GREETING_LEN] {
        let mut buf = [0u8; GREETING_LEN];
        buf[3] = self.mode;
        buf[4..8].copy_from_slice(&self.opaque.to_be_bytes());
        buf
    }

    /// Decodes a Greeting, rejecting anything but unauthenticated mode.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, GREETING_LEN)?;
        let mode = buf[3];
        if mode != MODE_UNAUTHENTICATED {
            return Err(DecodeError::BadMode(mode));
        }
        Ok(Greeting {
            mode,
            opaque: read_u32(buf, 4),
        })
    }
}

/// A decoded command message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    RequestSession { sid: u32, sender: SocketAddrV4 },
    AcceptSession { sid: u32, accept: u8 },
    StartSessions,
    StartAck,
    StopSessions,
    StopAck,
}

impl ControlMessage {
    /// Command code this message is sent under.
    pub fn command(&self) -> Command {
        match self {
            ControlMessage::RequestSession { .. } => Command::RequestSession,
            ControlMessage::AcceptSession { .. } => Command::AcceptSession,
            ControlMessage::StartSessions => Command::StartSessions,
            ControlMessage::StartAck => Command::StartAck,
            ControlMessage::StopSessions => Command::StopSessions,
            ControlMessage::StopAck => Command::StopAck,
        }
    }

    /// Serializes the message into its fixed-size wire form.
    pub fn encode(&self) -> Vec<u8> {
        let command = self.command();
        let mut buf = vec![0u8; command.message_len()];
        buf[0] = command.code();

        match *self {
            ControlMessage::RequestSession { sid, sender } => {
                buf[12..16].copy_from_slice(&sid.to_be_bytes());
                buf[20..22].copy_from_slice(&sender.port().to_be_bytes());
                buf[24..28].copy_from_slice(&sender.ip().octets());
            }
            ControlMessage::AcceptSession { sid, accept } => {
                buf[12..16].copy_from_slice(&sid.to_be_bytes());
                buf[16] = accept;
            }
            _ => {}
        }

        buf
    }

    /// Decodes a complete command message, command octet included.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        check_len(buf, 1)?;
        let command = Command::from_code(buf[0])?;
        check_len(buf, command.message_len())?;

        Ok(match command {
            Command::RequestSession => {
                let port = u16::from_be_bytes([buf[20], buf[21]]);
                let ip = Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]);
                ControlMessage::RequestSession {
                    sid: read_u32(buf, 12),
                    sender: SocketAddrV4::new(ip, port),
                }
            }
            Command::AcceptSession => ControlMessage::AcceptSession {
                sid: read_u32(buf, 12),
                accept: buf[16],
            },
            Command::StartSessions => ControlMessage::StartSessions,
            Command::StartAck => ControlMessage::StartAck,
            Command::StopSessions => ControlMessage::StopSessions,
            Command::StopAck => ControlMessage::StopAck,
        })
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.len() < expected {
        return Err(DecodeError::ShortRead {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
