//! Server lifecycle: binds the control and test sockets, runs the accept loop,
//! the reflector and the expiry sweep, and tears all of it down on `stop()`.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
    net::{TcpListener, UdpSocket},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    configuration::{DEFAULT_CONTROL_PORT, DEFAULT_TEST_PORT},
    control::{ControlChannel, DEFAULT_IO_TIMEOUT},
    reflector::{run_reflector, ReflectorCounters},
    session::{SessionRegistry, DEFAULT_SESSION_TTL},
    stats::ReflectorStats,
};

/// Default period of the expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: Ipv4Addr,
    /// TCP port for TWAMP-Control. Zero picks an ephemeral port.
    pub control_port: u16,
    /// UDP port shared by all test sessions. Zero picks an ephemeral port.
    pub test_port: u16,
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub io_timeout: Duration,
}

impl ServerConfig {
    /// Checks the durations the server tasks cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.session_ttl.is_zero() {
            return Err(ServerError::ZeroDuration("session_ttl"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ServerError::ZeroDuration("cleanup_interval"));
        }
        if self.io_timeout.is_zero() {
            return Err(ServerError::ZeroDuration("io_timeout"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            control_port: DEFAULT_CONTROL_PORT,
            test_port: DEFAULT_TEST_PORT,
            session_ttl: DEFAULT_SESSION_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Lifecycle of a [`Server`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Everything that exists only while the server runs.
struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    connections: TaskTracker,
    control_addr: SocketAddr,
    test_addr: SocketAddr,
}

/// TWAMP server owning the registry, the counters and the running tasks.
pub struct Server {
    state: ServerState,
    registry: Arc<SessionRegistry>,
    counters: Arc<ReflectorCounters>,
    shutdown: CancellationToken,
    running: Option<Running>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl Server {
    pub fn new() -> Self {
        Server {
            state: ServerState::Stopped,
            registry: Arc::new(SessionRegistry::new()),
            counters: Arc::new(ReflectorCounters::new()),
            shutdown: CancellationToken::new(),
            running: None,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Binds both sockets and spawns the server tasks.
    pub async fn start(&mut self, config: &ServerConfig) -> Result<(), ServerError> {
        if self.state != ServerState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }
        config.validate()?;
        self.state = ServerState::Starting;

        let running = match self.spawn_tasks(config).await {
            Ok(running) => running,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };

        log::info!(
            "TWAMP server listening: control {}, test {}",
            running.control_addr,
            running.test_addr
        );

        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }
        self.running = Some(running);
        self.started_at = Some(Instant::now());
        self.stopped_at = None;
        self.state = ServerState::Running;
        Ok(())
    }

    async fn spawn_tasks(&self, config: &ServerConfig) -> Result<Running, ServerError> {
        let control_bind = SocketAddr::from((config.bind_addr, config.control_port));
        let listener = TcpListener::bind(control_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: control_bind,
                source,
            })?;

        let test_bind = SocketAddr::from((config.bind_addr, config.test_port));
        let socket = UdpSocket::bind(test_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: test_bind,
                source,
            })?;

        let control_addr = listener.local_addr()?;
        let test_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();

        let tasks = vec![
            tokio::spawn(accept_loop(
                listener,
                self.registry.clone(),
                config.io_timeout,
                connections.clone(),
                cancel.child_token(),
            )),
            tokio::spawn(run_reflector(
                socket,
                self.registry.clone(),
                self.counters.clone(),
                cancel.child_token(),
            )),
            tokio::spawn(sweep_loop(
                self.registry.clone(),
                config.session_ttl,
                config.cleanup_interval,
                cancel.child_token(),
            )),
        ];

        Ok(Running {
            cancel,
            tasks,
            connections,
            control_addr,
            test_addr,
        })
    }

    /// Stops every task, waits for all of them and clears the registry.
    ///
    /// Calling it on a stopped server does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.state = ServerState::Stopping;
        log::info!("Shutting down TWAMP server");

        running.cancel.cancel();
        for handle in running.tasks {
            if let Err(e) = handle.await {
                log::error!("Server task ended abnormally: {}", e);
            }
        }

        running.connections.close();
        running.connections.wait().await;

        self.registry.clear();
        self.stopped_at = Some(Instant::now());
        self.state = ServerState::Stopped;
        log::info!("TWAMP server stopped");
    }

    /// Token a signal handler cancels to ask for shutdown. Cancelling it does
    /// not stop anything by itself; whoever owns the server calls `stop()`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.control_addr)
    }

    pub fn test_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.test_addr)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn counters(&self) -> Arc<ReflectorCounters> {
        self.counters.clone()
    }

    /// Reflector statistics, with uptime of the current or last run.
    pub fn stats(&self) -> ReflectorStats {
        let uptime = match self.started_at {
            Some(start) => self
                .stopped_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(start),
            None => Duration::ZERO,
        };
        ReflectorStats::collect(&self.counters, &self.registry, uptime.as_secs_f64())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    io_timeout: Duration,
    connections: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to accept control connection: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };

        log::info!("Control connection from {}", peer);
        let channel = ControlChannel::new(stream, peer, registry.clone(), io_timeout);
        let token = cancel.child_token();
        connections.spawn(async move {
            match channel.run(token).await {
                Ok(outcome) => log::info!("Control connection {} closed: {:?}", peer, outcome),
                Err(e) => log::warn!("Control connection {} failed: {}", peer, e),
            }
        });
    }

    log::debug!("Accept loop finished");
}

async fn sweep_loop(
    registry: Arc<SessionRegistry>,
    ttl: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval(period);
    // Skip the first immediate tick
    timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let expired = registry.sweep_expired(Instant::now(), ttl);
                for session in &expired {
                    log::info!(
                        "Session sid {} ({}) expired after {:?} idle",
                        session.sid,
                        session.test_peer,
                        ttl
                    );
                }
                if !expired.is_empty() {
                    log::debug!("Session cleanup: removed {} stale sessions", expired.len());
                }
            }
        }
    }
}
