//! TWAMP Suite - Two-Way Active Measurement Protocol server, unauthenticated mode.
//!
//! This crate provides a TWAMP-Control server (RFC 5357) that negotiates test
//! sessions over TCP and a session reflector that echoes UDP test packets with
//! receive and transmit timestamps. A small client drives the same protocol
//! for measurements against any compatible server.
//!
//! # Usage
//!
//! Run as a server:
//! ```bash
//! twamp-suite --local-addr 0.0.0.0 --control-port 862 --test-port 863
//! ```
//!
//! Run as a client:
//! ```bash
//! twamp-suite --remote-addr 192.168.1.1 --count 100 --interval 10
//! ```

/// Control client and test-packet sender.
pub mod client;
/// Command-line configuration and validation.
pub mod configuration;
/// TWAMP-Control codec and per-connection state machine.
pub mod control;
/// Test packet layout and in-place timestamping.
pub mod packets;
/// Test packet reflector.
pub mod reflector;
/// Server lifecycle and task supervision.
pub mod server;
/// Session state and the shared registry.
pub mod session;
/// Statistics output.
pub mod stats;
/// NTP timestamp generation and conversion.
pub mod time;
