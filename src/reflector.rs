//! TWAMP-Test Session Reflector.
//!
//! One task owns the shared UDP test socket. Each datagram is matched to an
//! active session by source IP, stamped in place and sent back to the exact
//! source address. Anything that does not qualify is dropped silently: the
//! sender accounts for it as loss.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{
    packets::{stamp_receive_timestamp, stamp_transmit_timestamp, MIN_TEST_PACKET_LEN},
    session::{Session, SessionRegistry},
    time::now_ntp,
};

/// Largest datagram the reflector will take in.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Aggregate packet counters for the reflector.
pub struct ReflectorCounters {
    pub packets_received: AtomicU64,
    pub packets_reflected: AtomicU64,
    pub dropped_short: AtomicU64,
    pub dropped_unmatched: AtomicU64,
    pub send_errors: AtomicU64,
}

impl ReflectorCounters {
    pub fn new() -> Self {
        ReflectorCounters {
            packets_received: AtomicU64::new(0),
            packets_reflected: AtomicU64::new(0),
            dropped_short: AtomicU64::new(0),
            dropped_unmatched: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ReflectorCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a datagram was not reflected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    TooShort(usize),
    NoSession,
}

/// Validates a received datagram and writes its receive timestamp.
///
/// The length check comes first, so short datagrams never touch the registry.
pub fn prepare_reflection(
    packet: &mut [u8],
    src: &SocketAddr,
    registry: &SessionRegistry,
    received_at: u64,
) -> Result<Session, DropReason> {
    if packet.len() < MIN_TEST_PACKET_LEN {
        return Err(DropReason::TooShort(packet.len()));
    }

    let session = registry.find_by_address(src).ok_or(DropReason::NoSession)?;
    stamp_receive_timestamp(packet, received_at);
    Ok(session)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Runs the receive/reflect loop until `cancel` fires.
pub async fn run_reflector(
    socket: UdpSocket,
    registry: Arc<SessionRegistry>,
    counters: Arc<ReflectorCounters>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    // ICMP port unreachable from an earlier reflection surfaces here on some platforms.
                    log::warn!("Test socket receive error: {}", e);
                    continue;
                }
            },
        };
        let rcvt = now_ntp();
        ReflectorCounters::bump(&counters.packets_received);

        let packet = &mut buf[..len];
        let session = match prepare_reflection(packet, &src, &registry, rcvt) {
            Ok(session) => session,
            Err(DropReason::TooShort(len)) => {
                log::debug!("Dropping {}-byte datagram from {}", len, src);
                ReflectorCounters::bump(&counters.dropped_short);
                continue;
            }
            Err(DropReason::NoSession) => {
                log::debug!("Dropping datagram from {}: no active session", src);
                ReflectorCounters::bump(&counters.dropped_unmatched);
                continue;
            }
        };

        loop {
            stamp_transmit_timestamp(packet, now_ntp());
            match socket.send_to(packet, src).await {
                Ok(sent) if sent == len => {
                    ReflectorCounters::bump(&counters.packets_reflected);
                }
                Ok(sent) => {
                    log::warn!(
                        "Short send to {} (sid {}): {} of {} bytes",
                        src,
                        session.sid,
                        sent,
                        len
                    );
                    ReflectorCounters::bump(&counters.send_errors);
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    log::warn!("Failed to reflect to {} (sid {}): {}", src, session.sid, e);
                    ReflectorCounters::bump(&counters.send_errors);
                }
            }
            break;
        }
    }

    log::debug!("Reflector loop finished");
}
