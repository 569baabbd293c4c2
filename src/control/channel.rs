//! Server side of one TWAMP-Control connection.
//!
//! The channel speaks first with a Greeting, checks the peer's mode and then
//! serves commands strictly one after another until Stop-Sessions, end of
//! stream, an error, or cancellation. Whatever the exit path, the session it
//! registered is removed before the stream is dropped.

use std::{io, net::SocketAddr, net::SocketAddrV4, sync::Arc, time::Duration, time::Instant};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use super::{
    messages::{Command, ControlMessage, DecodeError, Greeting, ACCEPT_OK, GREETING_LEN},
    ControlError,
};
use crate::session::{Session, SessionKey, SessionRegistry, SessionState};

/// Where a control channel is in the negotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingGreeting,
    NegotiatingMode,
    AwaitingCommand,
    Configuring,
    Starting,
    Stopping,
    Closed,
}

/// How a channel that did not fail came to an end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Peer sent Stop-Sessions and got its Stop-Ack.
    Stopped,
    /// Peer closed the stream on a message boundary.
    PeerClosed,
    /// The server is shutting down.
    Cancelled,
}

/// Server side of one control connection, generic over the byte stream.
pub struct ControlChannel<S> {
    stream: S,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    io_timeout: Duration,
    state: ChannelState,
    session: Option<SessionKey>,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        registry: Arc<SessionRegistry>,
        io_timeout: Duration,
    ) -> Self {
        ControlChannel {
            stream,
            peer,
            registry,
            io_timeout,
            state: ChannelState::AwaitingGreeting,
            session: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Runs the channel to completion and closes the stream.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ChannelOutcome, ControlError> {
        let result = tokio::select! {
            result = self.serve() => result,
            _ = cancel.cancelled() => Ok(ChannelOutcome::Cancelled),
        };

        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<ChannelOutcome, ControlError> {
        self.state = ChannelState::AwaitingGreeting;
        let greeting = Greeting::unauthenticated(rand::random());
        self.write_all(&greeting.encode()).await?;

        self.state = ChannelState::NegotiatingMode;
        let mut buf = [0u8; GREETING_LEN];
        match timeout(self.io_timeout, self.read_first(&mut buf[..1])).await {
            Err(_) => return Err(ControlError::Timeout(self.io_timeout)),
            Ok(result) => {
                if !result? {
                    return Ok(ChannelOutcome::PeerClosed);
                }
            }
        }
        self.read_rest(&mut buf[1..]).await?;
        match Greeting::decode(&buf) {
            Ok(_) => {}
            Err(DecodeError::BadMode(mode)) => return Err(ControlError::UnsupportedMode(mode)),
            Err(e) => return Err(e.into()),
        }
        log::debug!("control {}: unauthenticated mode negotiated", self.peer);

        loop {
            self.state = ChannelState::AwaitingCommand;
            let mut code = [0u8; 1];
            let opened = if self.session.is_none() {
                // Still setting up: the peer must send Request-Session in time.
                match timeout(self.io_timeout, self.read_first(&mut code)).await {
                    Err(_) => return Err(ControlError::Timeout(self.io_timeout)),
                    Ok(result) => result?,
                }
            } else {
                self.read_first(&mut code).await?
            };
            if !opened {
                return Ok(ChannelOutcome::PeerClosed);
            }

            let command = Command::from_code(code[0])?;
            let mut message = vec![0u8; command.message_len()];
            message[0] = code[0];
            self.read_rest(&mut message[1..]).await?;
            self.touch();

            match ControlMessage::decode(&message)? {
                ControlMessage::RequestSession { sid, sender } => {
                    self.request_session(sid, sender).await?
                }
                ControlMessage::StartSessions => self.start_sessions().await?,
                ControlMessage::StopSessions => {
                    self.stop_sessions().await?;
                    return Ok(ChannelOutcome::Stopped);
                }
                other => {
                    return Err(ControlError::ProtocolViolation(format!(
                        "{:?} is not accepted by a server",
                        other.command()
                    )))
                }
            }
        }
    }

    async fn request_session(&mut self, sid: u32, sender: SocketAddrV4) -> Result<(), ControlError> {
        self.state = ChannelState::Configuring;

        if let Some(previous) = self.session.take() {
            if let Some(old) = self.registry.remove(previous) {
                log::info!(
                    "control {}: session {} (sid {}) replaced by a new request",
                    self.peer,
                    previous,
                    old.sid
                );
            }
        }

        let key = self.registry.add(Session::configured(sid, sender));
        self.session = Some(key);
        log::info!(
            "control {}: session {} created, sid {}, test peer {}",
            self.peer,
            key,
            sid,
            sender
        );

        let accept = ControlMessage::AcceptSession {
            sid,
            accept: ACCEPT_OK,
        };
        self.write_all(&accept.encode()).await
    }

    async fn start_sessions(&mut self) -> Result<(), ControlError> {
        self.state = ChannelState::Starting;

        let key = self.session.ok_or_else(|| {
            ControlError::ProtocolViolation("Start-Sessions before Request-Session".to_string())
        })?;
        if !self.registry.set_state(key, SessionState::Active) {
            self.session = None;
            return Err(ControlError::SessionExpired);
        }
        log::info!("control {}: session {} started", self.peer, key);

        self.write_all(&ControlMessage::StartAck.encode()).await
    }

    async fn stop_sessions(&mut self) -> Result<(), ControlError> {
        self.state = ChannelState::Stopping;

        if let Some(key) = self.session.take() {
            self.registry.set_state(key, SessionState::Closed);
            self.registry.remove(key);
            log::info!("control {}: session {} stopped", self.peer, key);
        }

        self.write_all(&ControlMessage::StopAck.encode()).await
    }

    fn touch(&self) {
        if let Some(key) = self.session {
            self.registry.touch(key, Instant::now());
        }
    }

    async fn close(&mut self) {
        if let Some(key) = self.session.take() {
            if self.registry.remove(key).is_some() {
                log::info!("control {}: session {} removed", self.peer, key);
            }
        }
        self.state = ChannelState::Closed;
        let _ = timeout(self.io_timeout, self.stream.shutdown()).await;
    }

    /// Reads the first bytes of a message. `Ok(false)` means a clean end of
    /// stream before any byte arrived.
    async fn read_first(&mut self, buf: &mut [u8]) -> Result<bool, ControlError> {
        loop {
            match self.stream.read(buf).await {
                Ok(0) => return Ok(false),
                Ok(n) if n == buf.len() => return Ok(true),
                Ok(n) => {
                    return self.read_rest(&mut buf[n..]).await.map(|_| true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads the remainder of a message already in progress.
    async fn read_rest(&mut self, buf: &mut [u8]) -> Result<(), ControlError> {
        let expected = buf.len();
        match timeout(self.io_timeout, self.stream.read_exact(buf)).await {
            Err(_) => Err(ControlError::Timeout(self.io_timeout)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ControlError::ShortRead { expected })
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), ControlError> {
        let limit = self.io_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(buf).await?;
            stream.flush().await?;
            Ok::<(), io::Error>(())
        };
        match timeout(limit, write).await {
            Err(_) => Err(ControlError::Timeout(limit)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::WriteZero => {
                Err(ControlError::ShortWrite { expected: buf.len() })
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => Ok(()),
        }
    }
}
