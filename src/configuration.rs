pub use clap::Parser;

use std::{net::Ipv4Addr, time::Duration};

use thiserror::Error;

use crate::{client::ClientConfig, server::ServerConfig, stats::OutputFormat};

/// Well-known TWAMP-Control port.
pub const DEFAULT_CONTROL_PORT: u16 = 862;
/// Port shared by every test session on this reflector.
pub const DEFAULT_TEST_PORT: u16 = 863;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} port must be set when connecting to a remote server")]
    MissingPort(&'static str),
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TWAMP control server and session reflector", long_about = None)]
pub struct Configuration {
    /// Remote server to test against; runs as a client when set
    #[arg(short, long)]
    pub remote_addr: Option<Ipv4Addr>,
    /// Local address to bind for
    #[arg(short, long, default_value = "0.0.0.0")]
    pub local_addr: Ipv4Addr,
    /// TCP port for TWAMP-Control
    #[arg(short = 'p', long, default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,
    /// UDP port for test packets
    #[arg(short = 't', long, default_value_t = DEFAULT_TEST_PORT)]
    pub test_port: u16,
    /// Seconds without control activity before a session is dropped
    #[arg(long, default_value_t = 300)]
    pub session_ttl: u64,
    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 10)]
    pub cleanup_interval: u64,
    /// Seconds allowed for handshake reads, partial messages and writes
    #[arg(long, default_value_t = 10)]
    pub io_timeout: u64,
    /// How statistics are printed
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Number of test packets to send (client)
    #[arg(short, long, default_value_t = 10)]
    pub count: u32,
    /// Milliseconds between test packets (client)
    #[arg(short, long, default_value_t = 100)]
    pub interval: u64,
    /// Milliseconds to wait for late reflections after the last packet (client)
    #[arg(short, long, default_value_t = 1000)]
    pub wait: u64,
    /// Session identifier to request; random when omitted (client)
    #[arg(short, long)]
    pub sid: Option<u32>,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.session_ttl == 0 {
            return Err(ConfigurationError::Zero("session-ttl"));
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigurationError::Zero("cleanup-interval"));
        }
        if self.io_timeout == 0 {
            return Err(ConfigurationError::Zero("io-timeout"));
        }

        if self.is_client() {
            if self.count == 0 {
                return Err(ConfigurationError::Zero("count"));
            }
            if self.interval == 0 {
                return Err(ConfigurationError::Zero("interval"));
            }
            if self.control_port == 0 {
                return Err(ConfigurationError::MissingPort("control"));
            }
            if self.test_port == 0 {
                return Err(ConfigurationError::MissingPort("test"));
            }
        }

        Ok(())
    }

    pub fn is_client(&self) -> bool {
        self.remote_addr.is_some()
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.local_addr,
            control_port: self.control_port,
            test_port: self.test_port,
            session_ttl: Duration::from_secs(self.session_ttl),
            cleanup_interval: Duration::from_secs(self.cleanup_interval),
            io_timeout: Duration::from_secs(self.io_timeout),
        }
    }

    /// Client settings, or `None` when no remote address was given.
    pub fn client_config(&self) -> Option<ClientConfig> {
        let remote = self.remote_addr?;
        Some(ClientConfig {
            remote_addr: remote,
            control_port: self.control_port,
            test_port: self.test_port,
            count: self.count,
            interval: Duration::from_millis(self.interval),
            reply_wait: Duration::from_millis(self.wait),
            sid: self.sid.unwrap_or_else(rand::random),
            io_timeout: Duration::from_secs(self.io_timeout),
        })
    }
}
