//! TWAMP-Control client and test-packet sender.
//!
//! Negotiates a single session with a server, sends numbered test packets
//! from a UDP socket on the same local IP as the control connection, and
//! summarizes the reflections.

use std::{
    collections::HashSet,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{timeout, Instant},
};

use crate::{
    control::{
        messages::{ACCEPT_OK, GREETING_LEN, MODE_UNAUTHENTICATED},
        Command, ControlMessage, DecodeError, Greeting,
    },
    packets::{TestPacket, DEFAULT_TEST_PACKET_LEN},
    reflector::MAX_DATAGRAM_LEN,
    stats::{RoundTripSummary, RttSample},
    time::{now_ntp, ntp_diff_nanos},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("server closed the control connection")]
    Closed,
    #[error("server does not offer unauthenticated mode (modes {0:#04x})")]
    UnsupportedMode(u8),
    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("session rejected with accept code {0}")]
    Rejected(u8),
    #[error("expected {expected:?}, got {got:?}")]
    Unexpected { expected: Command, got: Command },
    #[error("control connection is not IPv4 ({0})")]
    NotIpv4(SocketAddr),
    #[error("test run of {count} packets every {interval:?} is too long to schedule")]
    RunTooLong { count: u32, interval: Duration },
}

/// Settings for one client test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub remote_addr: Ipv4Addr,
    pub control_port: u16,
    pub test_port: u16,
    pub count: u32,
    pub interval: Duration,
    /// How long to keep listening after the last packet went out.
    pub reply_wait: Duration,
    pub sid: u32,
    pub io_timeout: Duration,
}

pub struct ControlClient<S> {
    stream: S,
    io_timeout: Duration,
}

impl ControlClient<TcpStream> {
    pub async fn connect(addr: SocketAddr, io_timeout: Duration) -> Result<Self, ClientError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(io_timeout))??;
        Ok(ControlClient::new(stream, io_timeout))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

impl<S> ControlClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, io_timeout: Duration) -> Self {
        ControlClient { stream, io_timeout }
    }

    /// Reads the server Greeting and answers it selecting unauthenticated mode.
    pub async fn handshake(&mut self) -> Result<Greeting, ClientError> {
        let mut buf = [0u8; GREETING_LEN];
        self.read_exact(&mut buf).await?;

        let modes = buf[3];
        if modes & MODE_UNAUTHENTICATED == 0 {
            return Err(ClientError::UnsupportedMode(modes));
        }
        let opaque = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        self.write(&Greeting::unauthenticated(opaque).encode()).await?;
        Ok(Greeting {
            mode: modes,
            opaque,
        })
    }

    pub async fn request_session(&mut self, sid: u32, sender: SocketAddrV4) -> Result<(), ClientError> {
        self.write(&ControlMessage::RequestSession { sid, sender }.encode())
            .await?;
        match self.expect(Command::AcceptSession).await? {
            ControlMessage::AcceptSession { accept, .. } if accept != ACCEPT_OK => {
                Err(ClientError::Rejected(accept))
            }
            _ => Ok(()),
        }
    }

    pub async fn start_sessions(&mut self) -> Result<(), ClientError> {
        self.write(&ControlMessage::StartSessions.encode()).await?;
        self.expect(Command::StartAck).await.map(|_| ())
    }

    pub async fn stop_sessions(&mut self) -> Result<(), ClientError> {
        self.write(&ControlMessage::StopSessions.encode()).await?;
        self.expect(Command::StopAck).await.map(|_| ())
    }

    async fn expect(&mut self, expected: Command) -> Result<ControlMessage, ClientError> {
        let mut code = [0u8; 1];
        self.read_exact(&mut code).await?;
        let got = Command::from_code(code[0])?;
        if got != expected {
            return Err(ClientError::Unexpected { expected, got });
        }

        let mut message = vec![0u8; got.message_len()];
        message[0] = code[0];
        self.read_exact(&mut message[1..]).await?;
        Ok(ControlMessage::decode(&message)?)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ClientError> {
        match timeout(self.io_timeout, self.stream.read_exact(buf)).await {
            Err(_) => Err(ClientError::Timeout(self.io_timeout)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), ClientError> {
        let limit = self.io_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(buf).await?;
            stream.flush().await
        };
        timeout(limit, write)
            .await
            .map_err(|_| ClientError::Timeout(limit))?
            .map_err(ClientError::from)
    }
}

/// Negotiates a session, runs the test and stops the session again.
pub async fn run_test(config: &ClientConfig) -> Result<RoundTripSummary, ClientError> {
    let run_length = run_length(config).ok_or(ClientError::RunTooLong {
        count: config.count,
        interval: config.interval,
    })?;

    let control_addr = SocketAddr::from((config.remote_addr, config.control_port));
    let mut control = ControlClient::connect(control_addr, config.io_timeout).await?;
    control.handshake().await?;

    let local_ip = match control.local_addr()? {
        SocketAddr::V4(addr) => *addr.ip(),
        other => return Err(ClientError::NotIpv4(other)),
    };
    let socket = UdpSocket::bind((local_ip, 0)).await?;
    let sender = match socket.local_addr()? {
        SocketAddr::V4(addr) => addr,
        other => return Err(ClientError::NotIpv4(other)),
    };
    socket
        .connect((config.remote_addr, config.test_port))
        .await?;

    control.request_session(config.sid, sender).await?;
    log::info!(
        "Session sid {} accepted, sending {} packets from {}",
        config.sid,
        config.count,
        sender
    );
    control.start_sessions().await?;

    let deadline = Instant::now()
        .checked_add(run_length)
        .ok_or(ClientError::RunTooLong {
            count: config.count,
            interval: config.interval,
        })?;
    let (sent, samples) = tokio::join!(
        send_packets(&socket, config.count, config.interval),
        collect_reflections(&socket, config.count, deadline),
    );
    let sent = sent?;

    control.stop_sessions().await?;
    Ok(RoundTripSummary::from_samples(sent, &samples))
}

/// Time from the first packet until the client stops listening.
fn run_length(config: &ClientConfig) -> Option<Duration> {
    config
        .interval
        .checked_mul(config.count)?
        .checked_add(config.reply_wait)
}

async fn send_packets(socket: &UdpSocket, count: u32, interval: Duration) -> io::Result<u32> {
    let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
    let mut sent = 0;

    for seq in 0..count {
        timer.tick().await;
        let packet = TestPacket::new(seq, now_ntp()).to_bytes(DEFAULT_TEST_PACKET_LEN);
        match socket.send(&packet).await {
            Ok(_) => sent += 1,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::warn!("Test packet {} refused by remote", seq);
                sent += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(sent)
}

async fn collect_reflections(socket: &UdpSocket, count: u32, deadline: Instant) -> Vec<RttSample> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut seen = HashSet::new();
    let mut samples = Vec::new();

    while samples.len() < count as usize {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                log::debug!("Test socket receive error: {}", e);
                continue;
            }
        };
        let received_at = now_ntp();

        let Some(packet) = TestPacket::from_bytes(&buf[..len]) else {
            log::debug!("Ignoring {}-byte datagram", len);
            continue;
        };
        if packet.sequence_number >= count || !seen.insert(packet.sequence_number) {
            log::debug!("Ignoring unexpected sequence {}", packet.sequence_number);
            continue;
        }

        let residence = ntp_diff_nanos(packet.transmit_timestamp, packet.receive_timestamp).max(0);
        let total = ntp_diff_nanos(received_at, packet.sender_timestamp).max(0);
        samples.push(RttSample {
            seq: packet.sequence_number,
            rtt_ns: (total - residence).max(0) as u64,
            residence_ns: residence as u64,
        });
    }

    samples
}
