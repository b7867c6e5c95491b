//! TURN relay server
//!
//! Main server for relaying packets when direct peer-to-peer connections
//! are not possible. Authenticated requests use long-term credentials with
//! a realm and server-issued nonces; relay state lives in the
//! [`AllocationManager`].
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::allocation::{Allocation, AllocationConfig, AllocationManager, RelayStats};
use crate::auth::{AuthHandler, NonceManager, NONCE_LIFETIME};
use crate::error::{RelayError, RelayResult};
use crate::stun_server::binding_response;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use stun_proto::{
    is_channel_data, peek_header, verify_integrity, Attribute, ChannelData, DecodeError,
    ErrorCode, Message, MessageClass, MessageType, Method, SOFTWARE, TRANSPORT_UDP,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65_536;

/// TURN server configuration
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    /// UDP listen address
    pub listen_addr: SocketAddr,
    /// IP relay sockets are bound on
    pub relay_ip: IpAddr,
    /// Server public address advertised for relays
    pub public_ip: Option<IpAddr>,
    /// Relay port range; ephemeral ports when `None`
    pub relay_port_range: Option<RangeInclusive<u16>>,
    /// Authentication realm
    pub realm: String,
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
    pub max_allocations: usize,
    /// Nonce validity
    pub nonce_lifetime: Duration,
}

impl Default for TurnServerConfig {
    fn default() -> Self {
        let allocation = AllocationConfig::default();
        TurnServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3478)),
            relay_ip: allocation.relay_ip,
            public_ip: allocation.public_ip,
            relay_port_range: allocation.port_range,
            realm: "example.org".to_string(),
            default_lifetime: allocation.default_lifetime,
            max_lifetime: allocation.max_lifetime,
            max_allocations: allocation.max_allocations,
            nonce_lifetime: NONCE_LIFETIME,
        }
    }
}

impl TurnServerConfig {
    fn allocation_config(&self) -> AllocationConfig {
        AllocationConfig {
            relay_ip: self.relay_ip,
            public_ip: self.public_ip,
            port_range: self.relay_port_range.clone(),
            default_lifetime: self.default_lifetime,
            max_lifetime: self.max_lifetime,
            max_allocations: self.max_allocations,
        }
    }
}

/// Request that passed authentication
struct Authenticated<'a> {
    message: &'a Message,
    username: &'a str,
    key: Vec<u8>,
}

/// TURN server
pub struct TurnServer {
    config: TurnServerConfig,
    socket: Arc<UdpSocket>,
    allocations: Arc<AllocationManager>,
    auth: Arc<dyn AuthHandler>,
    nonces: NonceManager,
    cancel: CancellationToken,
}

impl TurnServer {
    /// Bind the listening socket
    pub async fn bind(config: TurnServerConfig, auth: Arc<dyn AuthHandler>) -> RelayResult<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        info!(addr = %socket.local_addr()?, realm = %config.realm, "TURN server listening");

        let allocations = Arc::new(AllocationManager::new(
            config.allocation_config(),
            Arc::clone(&socket),
        ));
        Ok(Arc::new(TurnServer {
            nonces: NonceManager::new(config.nonce_lifetime),
            config,
            socket,
            allocations,
            auth,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn allocations(&self) -> &Arc<AllocationManager> {
        &self.allocations
    }

    /// Get server statistics
    pub async fn stats(&self) -> RelayStats {
        self.allocations.stats().await
    }

    /// Serve until [`close`](Self::close) or a socket error
    pub async fn run(&self) -> RelayResult<()> {
        let sweeper = self.allocations.spawn_sweeper(self.cancel.child_token());
        let result = self.serve().await;

        sweeper.abort();
        self.allocations.close_all().await;
        info!("TURN server stopped");
        result
    }

    async fn serve(&self) -> RelayResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!(error = %e, "TURN socket receive failed");
                        return Err(e.into());
                    }
                },
            };

            let Some(response) = self.handle_datagram(&buf[..len], from).await else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&response, from).await {
                warn!(client = %from, error = %e, "Failed to send TURN response");
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<RelayResult<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run().await })
    }

    /// Stop serving and tear down every allocation
    pub async fn close(&self) {
        self.cancel.cancel();
        self.allocations.close_all().await;
    }

    /// Process one datagram, returning the response to send back if any
    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<Bytes> {
        if is_channel_data(data) {
            self.handle_channel_data(data, from).await;
            return None;
        }

        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => return self.decode_failure(data, from, e),
        };

        match (message.method(), message.class()) {
            (Method::Binding, MessageClass::Request) => Some(binding_response(&message, from)),
            (Method::Send, MessageClass::Indication) => {
                self.handle_send(&message, from).await;
                None
            }
            (_, MessageClass::Request) => Some(self.handle_authenticated(&message, data, from).await),
            _ => {
                debug!(client = %from, message_type = ?message.message_type, "Ignoring message");
                None
            }
        }
    }

    fn decode_failure(&self, data: &[u8], from: SocketAddr, e: DecodeError) -> Option<Bytes> {
        debug!(client = %from, error = %e, "Failed to decode STUN message");
        let (message_type, transaction_id) = peek_header(data)?;
        if message_type.class != MessageClass::Request {
            return None;
        }

        let mut response = Message::new(
            MessageType::new(message_type.method, MessageClass::ErrorResponse),
            transaction_id,
        );
        let relay_error = RelayError::from(e);
        response.add(Attribute::ErrorCode(relay_error.error_code()));
        if let RelayError::Decode(DecodeError::UnknownAttributes { attributes, .. }) = relay_error {
            response.add(Attribute::UnknownAttributes(attributes));
        }
        response.add(Attribute::Software(SOFTWARE.to_string()));
        Some(response.encode_with(None, true))
    }

    async fn handle_channel_data(&self, data: &[u8], from: SocketAddr) {
        let frame = match ChannelData::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %from, error = %e, "Discarding malformed ChannelData");
                return;
            }
        };
        if let Err(e) = self.allocations.relay_channel_data(from, &frame).await {
            debug!(client = %from, channel = frame.number, error = %e, "ChannelData not relayed");
        }
    }

    /// Send indication: forwarded only to permitted peers, never installs state
    async fn handle_send(&self, message: &Message, from: SocketAddr) {
        let (Some(peer), Some(data)) = (message.xor_peer_address(), message.data()) else {
            debug!(client = %from, "Send indication without XOR-PEER-ADDRESS or DATA");
            return;
        };
        if let Err(e) = self.allocations.send_indication(from, peer, data).await {
            debug!(client = %from, peer = %peer, error = %e, "Send indication dropped");
        }
    }

    /// Error response asking the client to (re)authenticate with a fresh nonce
    async fn challenge(&self, request: &Message, code: u16) -> Bytes {
        request
            .error_response(ErrorCode::new(code))
            .with(Attribute::Realm(self.config.realm.clone()))
            .with(Attribute::Nonce(self.nonces.issue().await))
            .with(Attribute::Software(SOFTWARE.to_string()))
            .encode_with(None, true)
    }

    async fn authenticate<'a>(
        &self,
        request: &'a Message,
        raw: &[u8],
        from: SocketAddr,
    ) -> Result<Authenticated<'a>, Bytes> {
        if !request.has_integrity() {
            return Err(self.challenge(request, ErrorCode::UNAUTHORIZED).await);
        }
        let (Some(username), Some(realm), Some(nonce)) =
            (request.username(), request.realm(), request.nonce())
        else {
            return Err(request
                .error_response(ErrorCode::new(ErrorCode::BAD_REQUEST))
                .encode_with(None, true));
        };
        if !self.nonces.is_valid(nonce).await {
            debug!(client = %from, "Stale nonce");
            return Err(self.challenge(request, ErrorCode::STALE_NONCE).await);
        }

        let key = match self.auth.auth_key(username, realm, from).await {
            Some(key) if realm == self.config.realm => key,
            _ => {
                warn!(client = %from, username, "Unknown TURN user");
                return Err(self.challenge(request, ErrorCode::UNAUTHORIZED).await);
            }
        };
        if verify_integrity(raw, &key).is_err() {
            warn!(client = %from, username, "MESSAGE-INTEGRITY check failed");
            return Err(self.challenge(request, ErrorCode::UNAUTHORIZED).await);
        }

        Ok(Authenticated {
            message: request,
            username,
            key,
        })
    }

    async fn handle_authenticated(&self, request: &Message, raw: &[u8], from: SocketAddr) -> Bytes {
        let authenticated = match self.authenticate(request, raw, from).await {
            Ok(authenticated) => authenticated,
            Err(challenge) => return challenge,
        };

        let result = match request.method() {
            Method::Allocate => self.handle_allocate(&authenticated, from).await,
            Method::Refresh => self.handle_refresh(&authenticated, from).await,
            Method::CreatePermission => self.handle_create_permission(&authenticated, from).await,
            Method::ChannelBind => self.handle_channel_bind(&authenticated, from).await,
            other => Err(RelayError::InvalidRequest(format!(
                "unsupported method {:?}",
                other
            ))),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(client = %from, method = ?request.method(), error = %e, "TURN request failed");
                request.error_response(e.error_code())
            }
        };
        response
            .with(Attribute::Software(SOFTWARE.to_string()))
            .encode_with(Some(&authenticated.key), true)
    }

    /// Allocation owned by this client and user
    async fn owned_allocation(&self, request: &Authenticated<'_>, from: SocketAddr) -> RelayResult<Arc<Allocation>> {
        let allocation = self.allocations.get_allocation(from).await?;
        if allocation.username() != request.username {
            return Err(RelayError::WrongCredentials(from.to_string()));
        }
        Ok(allocation)
    }

    async fn handle_allocate(&self, request: &Authenticated<'_>, from: SocketAddr) -> RelayResult<Message> {
        let message = request.message;
        // An expired allocation the sweeper has not reached yet counts as gone
        if let Ok(existing) = self.allocations.get_allocation(from).await {
            // Retransmitted Allocate gets the original answer again
            if existing.transaction_id() == message.transaction_id {
                let lifetime = existing.remaining_lifetime().await;
                return Ok(allocate_success(message, &existing, from, lifetime));
            }
            return Err(RelayError::AllocationMismatch(format!(
                "{} already has an allocation",
                from
            )));
        }

        let transport = message.requested_transport().ok_or_else(|| {
            RelayError::InvalidRequest("missing REQUESTED-TRANSPORT".to_string())
        })?;
        if transport != TRANSPORT_UDP {
            return Err(RelayError::UnsupportedTransport(transport));
        }

        let allocation = self
            .allocations
            .create_allocation(from, request.username, message.transaction_id, message.lifetime())
            .await?;
        let lifetime = self.allocations.lifetime_for(message.lifetime());
        Ok(allocate_success(message, &allocation, from, lifetime))
    }

    async fn handle_refresh(&self, request: &Authenticated<'_>, from: SocketAddr) -> RelayResult<Message> {
        self.owned_allocation(request, from).await?;
        let lifetime = self
            .allocations
            .refresh_allocation(from, request.message.lifetime())
            .await?;
        Ok(request
            .message
            .success_response()
            .with(Attribute::Lifetime(lifetime.as_secs() as u32)))
    }

    async fn handle_create_permission(
        &self,
        request: &Authenticated<'_>,
        from: SocketAddr,
    ) -> RelayResult<Message> {
        let peers = request.message.xor_peer_addresses();
        if peers.is_empty() {
            return Err(RelayError::InvalidRequest(
                "missing XOR-PEER-ADDRESS".to_string(),
            ));
        }
        self.owned_allocation(request, from).await?;
        self.allocations.create_permission(from, &peers).await?;
        debug!(client = %from, peers = ?peers, "Permissions installed");
        Ok(request.message.success_response())
    }

    async fn handle_channel_bind(
        &self,
        request: &Authenticated<'_>,
        from: SocketAddr,
    ) -> RelayResult<Message> {
        let message = request.message;
        let (Some(number), Some(peer)) = (message.channel_number(), message.xor_peer_address())
        else {
            return Err(RelayError::InvalidRequest(
                "missing CHANNEL-NUMBER or XOR-PEER-ADDRESS".to_string(),
            ));
        };
        self.owned_allocation(request, from)
            .await?
            .bind_channel(number, peer)
            .await?;
        debug!(client = %from, channel = number, peer = %peer, "Channel bound");
        Ok(message.success_response())
    }
}

fn allocate_success(
    request: &Message,
    allocation: &Allocation,
    from: SocketAddr,
    lifetime: Duration,
) -> Message {
    request
        .success_response()
        .with(Attribute::XorRelayedAddress(allocation.relay_addr()))
        .with(Attribute::XorMappedAddress(from))
        .with(Attribute::Lifetime(lifetime.as_secs().max(1) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use stun_proto::{long_term_key, TransactionId};

    const REALM: &str = "example.org";

    async fn test_server() -> Arc<TurnServer> {
        let config = TurnServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..TurnServerConfig::default()
        };
        TurnServer::bind(config, Arc::new(StaticCredentials::new("demo", "secret")))
            .await
            .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// Run the 401 round trip and return the issued nonce
    async fn obtain_nonce(server: &TurnServer) -> String {
        let request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        let response = server
            .handle_datagram(&request.encode(), client_addr())
            .await
            .unwrap();
        let response = Message::decode(&response).unwrap();
        assert_eq!(response.error_code().map(|e| e.code), Some(401));
        assert_eq!(response.realm(), Some(REALM));
        response.nonce().unwrap().to_string()
    }

    fn signed(message: Message, nonce: &str, password: &str) -> Bytes {
        message
            .with(Attribute::Username("demo".to_string()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(nonce.to_string()))
            .encode_with(Some(&long_term_key("demo", REALM, password)), true)
    }

    async fn exchange(server: &TurnServer, wire: &[u8]) -> Message {
        let response = server.handle_datagram(wire, client_addr()).await.unwrap();
        Message::decode(&response).unwrap()
    }

    #[tokio::test]
    async fn test_allocate_flow() {
        let server = test_server().await;
        let nonce = obtain_nonce(&server).await;

        let request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP))
            .with(Attribute::Lifetime(300));
        let wire = signed(request.clone(), &nonce, "secret");
        let response = exchange(&server, &wire).await;

        assert_eq!(response.class(), MessageClass::SuccessResponse);
        assert_eq!(response.xor_mapped_address(), Some(client_addr()));
        assert_eq!(response.lifetime(), Some(300));
        let relayed = response.xor_relayed_address().unwrap();
        assert_eq!(relayed.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        verify_integrity(
            &server.handle_datagram(&wire, client_addr()).await.unwrap(),
            &long_term_key("demo", REALM, "secret"),
        )
        .unwrap();

        // Retransmission gets the same relay, a new transaction gets 437
        let again = exchange(&server, &wire).await;
        assert_eq!(again.xor_relayed_address(), Some(relayed));

        let second = signed(
            Message::request(Method::Allocate).with(Attribute::RequestedTransport(TRANSPORT_UDP)),
            &nonce,
            "secret",
        );
        let conflict = exchange(&server, &second).await;
        assert_eq!(conflict.error_code().map(|e| e.code), Some(437));
        assert_eq!(server.stats().await.active_allocations, 1);
    }

    #[tokio::test]
    async fn test_allocate_over_unswept_expired_allocation() {
        let server = test_server().await;
        let nonce = obtain_nonce(&server).await;

        let short = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP))
            .with(Attribute::Lifetime(1));
        let first = exchange(&server, &signed(short, &nonce, "secret")).await;
        assert_eq!(first.class(), MessageClass::SuccessResponse);

        // No sweeper runs here, so the expired entry is still in the table
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(server.allocations().allocation_count().await, 1);

        let fresh = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        let response = exchange(&server, &signed(fresh, &nonce, "secret")).await;
        assert_eq!(response.class(), MessageClass::SuccessResponse);
        assert!(response.xor_relayed_address().is_some());
        assert_eq!(server.stats().await.active_allocations, 1);
    }

    #[tokio::test]
    async fn test_wrong_password_creates_nothing() {
        let server = test_server().await;
        let nonce = obtain_nonce(&server).await;

        let request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        let response = exchange(&server, &signed(request, &nonce, "wrong")).await;
        assert_eq!(response.error_code().map(|e| e.code), Some(401));
        assert!(response.nonce().is_some());
        assert_eq!(server.allocations().allocation_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_nonce_and_missing_fields() {
        let server = test_server().await;

        let request = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP));
        let response = exchange(&server, &signed(request, "0011223344", "secret")).await;
        assert_eq!(response.error_code().map(|e| e.code), Some(438));
        assert!(response.nonce().is_some());

        // MESSAGE-INTEGRITY without USERNAME/REALM/NONCE
        let bare = Message::request(Method::Allocate)
            .with(Attribute::RequestedTransport(TRANSPORT_UDP))
            .encode_with(Some(&b"key"[..]), false);
        let response = exchange(&server, &bare).await;
        assert_eq!(response.error_code().map(|e| e.code), Some(400));
    }

    #[tokio::test]
    async fn test_allocate_validation() {
        let server = test_server().await;
        let nonce = obtain_nonce(&server).await;

        let missing = exchange(
            &server,
            &signed(Message::request(Method::Allocate), &nonce, "secret"),
        )
        .await;
        assert_eq!(missing.error_code().map(|e| e.code), Some(400));

        let tcp = exchange(
            &server,
            &signed(
                Message::request(Method::Allocate).with(Attribute::RequestedTransport(6)),
                &nonce,
                "secret",
            ),
        )
        .await;
        assert_eq!(tcp.error_code().map(|e| e.code), Some(442));
        // Error responses are signed as well
        assert!(tcp.has_integrity());
    }

    #[tokio::test]
    async fn test_requests_without_allocation() {
        let server = test_server().await;
        let nonce = obtain_nonce(&server).await;
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let permission = exchange(
            &server,
            &signed(
                Message::request(Method::CreatePermission).with(Attribute::XorPeerAddress(peer)),
                &nonce,
                "secret",
            ),
        )
        .await;
        assert_eq!(permission.error_code().map(|e| e.code), Some(437));

        let refresh = exchange(
            &server,
            &signed(Message::request(Method::Refresh), &nonce, "secret"),
        )
        .await;
        assert_eq!(refresh.error_code().map(|e| e.code), Some(437));
    }

    #[tokio::test]
    async fn test_unknown_comprehension_required_attribute() {
        let server = test_server().await;
        let request = Message::request(Method::Allocate).with(Attribute::Unknown {
            attr_type: 0x0031,
            value: Bytes::from_static(&[0, 0, 0, 0]),
        });
        let response = exchange(&server, &request.encode()).await;
        assert_eq!(response.error_code().map(|e| e.code), Some(420));
        assert_eq!(
            response.get(stun_proto::attr_type::UNKNOWN_ATTRIBUTES),
            Some(&Attribute::UnknownAttributes(vec![0x0031]))
        );
    }

    #[tokio::test]
    async fn test_binding_and_junk() {
        let server = test_server().await;
        let request = Message::request(Method::Binding);
        let response = exchange(&server, &request.encode()).await;
        assert_eq!(response.xor_mapped_address(), Some(client_addr()));

        assert!(server
            .handle_datagram(&[0xde, 0xad, 0xbe, 0xef], client_addr())
            .await
            .is_none());

        // Indication with a readable header is never answered
        let mut broken = Message::new(
            MessageType::new(Method::Send, MessageClass::Indication),
            TransactionId::new(),
        )
        .encode()
        .to_vec();
        broken.extend_from_slice(&[0, 0]);
        assert!(server.handle_datagram(&broken, client_addr()).await.is_none());
    }
}
