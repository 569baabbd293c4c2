//! Integration tests for the control server and reflector over loopback.
//!
//! Each test starts a real server on ephemeral localhost ports and talks to it
//! with raw sockets or the bundled client.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use twamp_suite::client::{run_test, ClientConfig, ControlClient};
use twamp_suite::control::{ControlMessage, Greeting};
use twamp_suite::packets::{TestPacket, DEFAULT_TEST_PACKET_LEN};
use twamp_suite::server::{Server, ServerConfig, ServerState};
use twamp_suite::session::SessionState;
use twamp_suite::time::now_ntp;

const GUARD: Duration = Duration::from_secs(5);

async fn start_server() -> Server {
    let mut server = Server::new();
    let config = ServerConfig {
        bind_addr: Ipv4Addr::LOCALHOST,
        control_port: 0,
        test_port: 0,
        io_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    };
    server.start(&config).await.expect("server failed to start");
    server
}

async fn open_session(server: &Server, sender: SocketAddrV4) -> ControlClient<TcpStream> {
    let mut client = ControlClient::connect(server.control_addr().unwrap(), GUARD)
        .await
        .unwrap();
    client.handshake().await.unwrap();
    client.request_session(42, sender).await.unwrap();
    client.start_sessions().await.unwrap();
    client
}

/// Waits up to a short time for a reflection.
async fn recv_reflection(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1500];
    match timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_greeting_offers_unauthenticated_mode() {
    let mut server = start_server().await;

    let mut stream = TcpStream::connect(server.control_addr().unwrap())
        .await
        .unwrap();
    let mut greeting = [0u8; 12];
    timeout(GUARD, stream.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(greeting[3], 1);
    assert_eq!(&greeting[8..], &[0u8; 4]);

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_mode_gets_no_accept() {
    let mut server = start_server().await;

    let mut stream = TcpStream::connect(server.control_addr().unwrap())
        .await
        .unwrap();
    let mut greeting = [0u8; 12];
    stream.read_exact(&mut greeting).await.unwrap();

    let mut reply = Greeting::unauthenticated(0).encode();
    reply[3] = 2;
    stream.write_all(&reply).await.unwrap();
    let request = ControlMessage::RequestSession {
        sid: 1,
        sender: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000),
    };
    // The server may already have closed; a failed write is fine.
    let _ = stream.write_all(&request.encode()).await;

    let mut rest = Vec::new();
    let _ = timeout(GUARD, stream.read_to_end(&mut rest)).await;
    assert!(rest.is_empty(), "server answered a connection in the wrong mode");
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_session_lifecycle() {
    let mut server = start_server().await;
    let registry = server.registry();
    let sender = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5000);

    let mut client = ControlClient::connect(server.control_addr().unwrap(), GUARD)
        .await
        .unwrap();
    client.handshake().await.unwrap();

    client.request_session(42, sender).await.unwrap();
    let sessions = registry.snapshot();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].1.sid, 42);
    assert_eq!(sessions[0].1.test_peer, sender);
    assert_eq!(sessions[0].1.state, SessionState::Configured);

    client.start_sessions().await.unwrap();
    assert_eq!(registry.active_count(), 1);

    client.stop_sessions().await.unwrap();
    assert!(registry.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_reflection_ignores_source_port() {
    let mut server = start_server().await;
    let test_addr = server.test_addr().unwrap();

    // The declared port differs from the one the packets come from.
    let _control = open_session(&server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sent_at = now_ntp();
    let mut packet = TestPacket::new(9, sent_at).to_bytes(DEFAULT_TEST_PACKET_LEN);
    packet[50..54].copy_from_slice(b"data");
    socket.send_to(&packet, test_addr).await.unwrap();

    let reflected = recv_reflection(&socket).await.expect("no reflection");
    assert_eq!(reflected.len(), DEFAULT_TEST_PACKET_LEN);
    let parsed = TestPacket::from_bytes(&reflected).unwrap();
    assert_eq!(parsed.sequence_number, 9);
    assert_eq!(parsed.sender_timestamp, sent_at);
    assert!(parsed.receive_timestamp >= sent_at);
    assert!(parsed.transmit_timestamp >= parsed.receive_timestamp);
    assert_eq!(&reflected[50..54], b"data");

    assert_eq!(
        server.counters().packets_reflected.load(Ordering::Relaxed),
        1
    );
    server.stop().await;
}

#[tokio::test]
async fn test_short_and_unsolicited_packets_are_dropped() {
    let mut server = start_server().await;
    let test_addr = server.test_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // No session yet.
    let packet = TestPacket::new(1, now_ntp()).to_bytes(DEFAULT_TEST_PACKET_LEN);
    socket.send_to(&packet, test_addr).await.unwrap();
    assert!(recv_reflection(&socket).await.is_none());

    let _control = open_session(&server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).await;
    socket.send_to(&packet[..31], test_addr).await.unwrap();
    assert!(recv_reflection(&socket).await.is_none());

    let stats = server.stats();
    assert_eq!(stats.dropped_unmatched, 1);
    assert_eq!(stats.dropped_short, 1);
    assert_eq!(stats.packets_reflected, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_closing_control_stops_reflection() {
    let mut server = start_server().await;
    let test_addr = server.test_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = TestPacket::new(1, now_ntp()).to_bytes(DEFAULT_TEST_PACKET_LEN);

    let control = open_session(&server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).await;
    socket.send_to(&packet, test_addr).await.unwrap();
    assert!(recv_reflection(&socket).await.is_some());

    drop(control);
    let registry = server.registry();
    timeout(GUARD, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session outlived its control connection");

    socket.send_to(&packet, test_addr).await.unwrap();
    assert!(recv_reflection(&socket).await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_client_run_against_server() {
    let mut server = start_server().await;
    let control_addr: SocketAddr = server.control_addr().unwrap();

    let config = ClientConfig {
        remote_addr: Ipv4Addr::LOCALHOST,
        control_port: control_addr.port(),
        test_port: server.test_addr().unwrap().port(),
        count: 5,
        interval: Duration::from_millis(10),
        reply_wait: Duration::from_millis(500),
        sid: 7,
        io_timeout: GUARD,
    };
    let summary = timeout(Duration::from_secs(10), run_test(&config))
        .await
        .expect("client run hung")
        .unwrap();

    assert_eq!(summary.packets_sent, 5);
    assert_eq!(summary.packets_received, 5);
    assert_eq!(summary.packets_lost, 0);
    assert!(summary.min_rtt_ms.is_some());
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_stop_twice_leaves_registry_empty() {
    let mut server = start_server().await;
    let _control = open_session(&server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).await;
    assert_eq!(server.registry().len(), 1);

    timeout(GUARD, server.stop()).await.unwrap();
    timeout(GUARD, server.stop()).await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.registry().is_empty());
}
