//! TWAMP-Test packet layout for unauthenticated mode (RFC 5357 Section 4.2.1).
//!
//! The reflector never rebuilds a packet from a struct: it stamps the two
//! reflector timestamps into a copy of the received bytes so that any
//! sender-echo fields and padding survive untouched. [`TestPacket`] is the
//! typed view used by the client and by tests.
//!
//! Wire format handled here:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         (unused, 4 octets)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sender Timestamp                       |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Receive Timestamp                       |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Transmit Timestamp                      |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Sender-echo fields / padding (copied)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::ops::Range;

/// Shortest datagram the reflector will stamp and echo.
pub const MIN_TEST_PACKET_LEN: usize = 32;

/// Size of the test packets the client sends.
pub const DEFAULT_TEST_PACKET_LEN: usize = 64;

const SEQUENCE: Range<usize> = 0..4;
const SENDER_TIMESTAMP: Range<usize> = 8..16;
const RECEIVE_TIMESTAMP: Range<usize> = 16..24;
const TRANSMIT_TIMESTAMP: Range<usize> = 24..32;

/// Typed view of the fixed part of a test packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TestPacket {
    /// Sequence number chosen by the sender.
    pub sequence_number: u32,
    /// When the sender transmitted the packet.
    pub sender_timestamp: u64,
    /// When the reflector received the packet.
    pub receive_timestamp: u64,
    /// When the reflector sent the reflection.
    pub transmit_timestamp: u64,
}

impl TestPacket {
    /// Builds a sender-side packet; reflector timestamps are left zero.
    pub fn new(sequence_number: u32, sender_timestamp: u64) -> Self {
        TestPacket {
            sequence_number,
            sender_timestamp,
            ..Default::default()
        }
    }

    /// Serializes the packet into `len` bytes, zero padded past the fixed part.
    ///
    /// `len` is raised to [`MIN_TEST_PACKET_LEN`] when smaller.
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len.max(MIN_TEST_PACKET_LEN)];
        buf[SEQUENCE].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[SENDER_TIMESTAMP].copy_from_slice(&self.sender_timestamp.to_be_bytes());
        buf[RECEIVE_TIMESTAMP].copy_from_slice(&self.receive_timestamp.to_be_bytes());
        buf[TRANSMIT_TIMESTAMP].copy_from_slice(&self.transmit_timestamp.to_be_bytes());
        buf
    }

    /// Parses the fixed part of a test packet.
    ///
    /// Returns `None` when the buffer is shorter than [`MIN_TEST_PACKET_LEN`].
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < MIN_TEST_PACKET_LEN {
            return None;
        }
        Some(TestPacket {
            sequence_number: read_u32(buf, SEQUENCE),
            sender_timestamp: read_u64(buf, SENDER_TIMESTAMP),
            receive_timestamp: read_u64(buf, RECEIVE_TIMESTAMP),
            transmit_timestamp: read_u64(buf, TRANSMIT_TIMESTAMP),
        })
    }
}

/// Writes the receive timestamp into a received packet in place.
///
/// Returns `false` and leaves the buffer untouched if it is too short.
pub fn stamp_receive_timestamp(buf: &mut [u8], timestamp: u64) -> bool {
    write_u64(buf, RECEIVE_TIMESTAMP, timestamp)
}

/// Writes the transmit timestamp into an outgoing reflection in place.
///
/// Returns `false` and leaves the buffer untouched if it is too short.
pub fn stamp_transmit_timestamp(buf: &mut [u8], timestamp: u64) -> bool {
    write_u64(buf, TRANSMIT_TIMESTAMP, timestamp)
}

fn write_u64(buf: &mut [u8], range: Range<usize>, value: u64) -> bool {
    match buf.get_mut(range) {
        Some(field) => {
            field.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[range]);
    u32::from_be_bytes(raw)
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[range]);
    u64::from_be_bytes(raw)
}
