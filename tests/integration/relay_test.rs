//! Integration Tests for the STUN responder and TURN relay
//!
//! Every test runs real servers on loopback UDP sockets.

use anyhow::{Context, Result};
use bytes::Bytes;
use nat_relay::{StaticCredentials, StunServer, StunServerConfig, TurnServer, TurnServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use stun_proto::{long_term_key, Attribute, Message, MessageClass, Method, TRANSPORT_UDP};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const REALM: &str = "example.org";
const USER: &str = "alice";
const PASSWORD: &str = "wonderland";

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

async fn recv_message(socket: &UdpSocket) -> Result<Message> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .context("no response within 2s")??;
    Ok(Message::decode(&buf[..len])?)
}

/// Nothing arrives on `socket` for a short while
async fn assert_silent(socket: &UdpSocket) {
    let mut buf = vec![0u8; 2048];
    let received = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(received.is_err(), "unexpected datagram");
}

async fn start_turn(config: TurnServerConfig) -> Result<Arc<TurnServer>> {
    let server = TurnServer::bind(
        TurnServerConfig {
            listen_addr: loopback(),
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..config
        },
        Arc::new(StaticCredentials::new(USER, PASSWORD)),
    )
    .await?;
    server.spawn();
    Ok(server)
}

/// Minimal TURN client speaking the long-term credential mechanism
struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
    nonce: String,
    key: Vec<u8>,
}

impl TestClient {
    /// Connect and obtain a nonce through an unauthenticated Allocate
    async fn connect(server: SocketAddr, password: &str) -> Result<Self> {
        let socket = UdpSocket::bind(loopback()).await?;
        let unsigned = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        socket.send_to(&unsigned.encode(), server).await?;
        let challenge = recv_message(&socket).await?;
        assert_eq!(challenge.error_code().map(|e| e.code), Some(401));
        assert_eq!(challenge.realm(), Some(REALM));

        Ok(TestClient {
            socket,
            server,
            nonce: challenge.nonce().context("challenge without nonce")?.to_string(),
            key: long_term_key(USER, REALM, password),
        })
    }

    fn sign(&self, message: Message) -> Bytes {
        message
            .with(Attribute::Username(USER.to_string()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(self.nonce.clone()))
            .encode_with(Some(&self.key), true)
    }

    async fn request(&self, message: Message) -> Result<Message> {
        let id = message.transaction_id;
        self.socket.send_to(&self.sign(message), self.server).await?;
        let response = recv_message(&self.socket).await?;
        assert_eq!(response.transaction_id, id);
        Ok(response)
    }

    async fn allocate(&self, lifetime: Option<u32>) -> Result<Message> {
        let mut request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        if let Some(lifetime) = lifetime {
            request.add(Attribute::Lifetime(lifetime));
        }
        self.request(request).await
    }

    async fn send_indication(&self, peer: SocketAddr, data: &'static [u8]) -> Result<()> {
        let indication = Message::indication(Method::Send)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(Bytes::from_static(data)));
        self.socket.send_to(&indication.encode(), self.server).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_stun_binding_reflects_source_address() -> Result<()> {
    let server = StunServer::bind(StunServerConfig {
        listen_addr: loopback(),
    })
    .await?;
    let handle = server.spawn();
    let server_addr = server.local_addr()?;

    let client = UdpSocket::bind(loopback()).await?;
    let client_addr = client.local_addr()?;

    // Junk is dropped without an answer and the server keeps serving
    client.send_to(b"definitely not stun", server_addr).await?;
    client.send_to(&[0u8; 20], server_addr).await?;
    assert_silent(&client).await;

    let request = Message::request(Method::Binding);
    client.send_to(&request.encode_with(None, true), server_addr).await?;
    let response = recv_message(&client).await?;

    assert_eq!(response.transaction_id, request.transaction_id);
    assert!(response.is(Method::Binding, MessageClass::SuccessResponse));
    assert_eq!(response.xor_mapped_address(), Some(client_addr));
    assert!(response.has_fingerprint());

    server.close();
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn test_turn_rejects_wrong_password() -> Result<()> {
    let server = start_turn(TurnServerConfig::default()).await?;
    let client = TestClient::connect(server.local_addr()?, "not-the-password").await?;

    let response = client.allocate(None).await?;
    assert_eq!(response.error_code().map(|e| e.code), Some(401));
    assert!(response.nonce().is_some());
    assert_eq!(server.stats().await.active_allocations, 0);

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_turn_relays_only_to_permitted_peers() -> Result<()> {
    let server = start_turn(TurnServerConfig::default()).await?;
    let client = TestClient::connect(server.local_addr()?, PASSWORD).await?;
    let client_addr = client.socket.local_addr()?;

    let allocated = client.allocate(Some(120)).await?;
    assert_eq!(allocated.class(), MessageClass::SuccessResponse);
    assert_eq!(allocated.xor_mapped_address(), Some(client_addr));
    assert_eq!(allocated.lifetime(), Some(120));
    let relayed = allocated.xor_relayed_address().context("no relayed address")?;
    assert_eq!(relayed.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    let peer = UdpSocket::bind(loopback()).await?;
    let peer_addr = peer.local_addr()?;

    // Without a permission the datagram never leaves the relay
    client.send_indication(peer_addr, b"too early").await?;
    assert_silent(&peer).await;
    let stats = server.stats().await;
    assert_eq!(stats.permissions, 0);
    assert_eq!(stats.channel_bindings, 0);

    let permitted = client
        .request(
            Message::request(Method::CreatePermission).with(Attribute::XorPeerAddress(peer_addr)),
        )
        .await?;
    assert_eq!(permitted.class(), MessageClass::SuccessResponse);
    assert_eq!(server.stats().await.permissions, 1);

    client.send_indication(peer_addr, b"hello peer").await?;
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..len], b"hello peer");
    assert_eq!(from, relayed);
    // Send indications never create channel bindings
    assert_eq!(server.stats().await.channel_bindings, 0);

    // The answer comes back wrapped in a Data indication
    peer.send_to(b"hello client", relayed).await?;
    let data = recv_message(&client.socket).await?;
    assert!(data.is(Method::Data, MessageClass::Indication));
    assert_eq!(data.xor_peer_address(), Some(peer_addr));
    assert_eq!(data.data().map(|d| &d[..]), Some(&b"hello client"[..]));

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_turn_refresh_zero_releases_allocation() -> Result<()> {
    let server = start_turn(TurnServerConfig::default()).await?;
    let client = TestClient::connect(server.local_addr()?, PASSWORD).await?;

    client.allocate(None).await?;
    assert_eq!(server.stats().await.active_allocations, 1);

    let refreshed = client
        .request(Message::request(Method::Refresh).with(Attribute::Lifetime(0)))
        .await?;
    assert_eq!(refreshed.class(), MessageClass::SuccessResponse);
    assert_eq!(refreshed.lifetime(), Some(0));
    assert_eq!(server.stats().await.active_allocations, 0);

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn test_expired_allocation_frees_its_port() -> Result<()> {
    // A single relay port makes reuse observable
    let port = 47_311;
    let server = start_turn(TurnServerConfig {
        relay_port_range: Some(port..=port),
        ..TurnServerConfig::default()
    })
    .await?;
    let server_addr = server.local_addr()?;

    let first = TestClient::connect(server_addr, PASSWORD).await?;
    let allocated = first.allocate(Some(1)).await?;
    assert_eq!(allocated.xor_relayed_address().map(|a| a.port()), Some(port));

    let second = TestClient::connect(server_addr, PASSWORD).await?;
    let refused = second.allocate(None).await?;
    assert_eq!(refused.error_code().map(|e| e.code), Some(508));

    // Lifetime 1s plus one sweep
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(server.stats().await.active_allocations, 0);

    let stale = first
        .request(Message::request(Method::Refresh).with(Attribute::Lifetime(600)))
        .await?;
    assert_eq!(stale.error_code().map(|e| e.code), Some(437));

    let reused = second.allocate(None).await?;
    assert_eq!(reused.class(), MessageClass::SuccessResponse);
    assert_eq!(reused.xor_relayed_address().map(|a| a.port()), Some(port));

    server.close().await;
    Ok(())
}
