//! TURN client used to obtain relayed candidates (RFC 5766)
//!
//! Holds one allocation on a TURN server reached through a host socket.
//! Responses arrive through that socket's read loop, which resolves them
//! in the shared transaction map.
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


use crate::error::{IceError, IceResult};
use crate::transaction::{RetransmitConfig, TransactionMap};
use crate::transport::{HostSocket, Route};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stun_proto::{
    long_term_key, verify_integrity, Attribute, ErrorCode, Message, MessageClass, Method,
    TRANSPORT_UDP,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requested allocation lifetime in seconds
const REQUESTED_LIFETIME: u32 = 600;

/// Permissions are reinstalled once older than this (server keeps them 300 s)
const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

/// Shortest pause between two refreshes
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the LIFETIME 0 exchange at close
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// TURN server address and long-term credentials
#[derive(Debug, Clone)]
pub struct TurnServerAddr {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

/// Realm, nonce and derived key from the server's 401 challenge
#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

impl Credentials {
    fn from_challenge(challenge: &Message, username: &str, password: &str) -> IceResult<Self> {
        let realm = challenge
            .realm()
            .ok_or_else(|| IceError::Protocol("401 without REALM".to_string()))?;
        let nonce = challenge
            .nonce()
            .ok_or_else(|| IceError::Protocol("401 without NONCE".to_string()))?;
        Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            key: long_term_key(username, realm, password),
        })
    }

    fn update_nonce(&mut self, response: &Message) {
        if let Some(realm) = response.realm() {
            if realm != self.realm {
                self.realm = realm.to_string();
                self.key = long_term_key(&self.username, &self.realm, &self.password);
            }
        }
        if let Some(nonce) = response.nonce() {
            self.nonce = nonce.to_string();
        }
    }

    fn sign(&self, mut request: Message) -> Bytes {
        request.add(Attribute::Username(self.username.clone()));
        request.add(Attribute::Realm(self.realm.clone()));
        request.add(Attribute::Nonce(self.nonce.clone()));
        request.encode_with(Some(&self.key), true)
    }
}

/// Socket, server and retransmission settings shared by every request
struct Channel {
    host: Arc<HostSocket>,
    server: SocketAddr,
    transactions: Arc<TransactionMap>,
    retransmit: RetransmitConfig,
}

impl Channel {
    /// Send an authenticated request, retrying once on 438 Stale Nonce
    async fn request<F>(&self, credentials: &Mutex<Credentials>, build: F) -> IceResult<Message>
    where
        F: Fn() -> Message,
    {
        let mut retried = false;
        loop {
            let request = build();
            let (raw, key) = {
                let credentials = credentials.lock().await;
                (credentials.sign(request.clone()), credentials.key.clone())
            };
            let response = self
                .transactions
                .transact(
                    &Route::Direct(Arc::clone(&self.host.socket)),
                    &raw,
                    request.transaction_id,
                    self.server,
                    &self.retransmit,
                )
                .await?;

            match response.message.class() {
                MessageClass::SuccessResponse => {
                    verify_integrity(&response.raw, &key).map_err(|_| {
                        IceError::Unauthorized("TURN response failed integrity check".to_string())
                    })?;
                    return Ok(response.message);
                }
                _ => {
                    let error = error_of(&response.message);
                    if error.code == ErrorCode::STALE_NONCE && !retried {
                        debug!(server = %self.server, "Nonce went stale, retrying");
                        credentials.lock().await.update_nonce(&response.message);
                        retried = true;
                        continue;
                    }
                    return Err(IceError::TurnRejected(error));
                }
            }
        }
    }
}

fn error_of(response: &Message) -> ErrorCode {
    response
        .error_code()
        .cloned()
        .unwrap_or_else(|| ErrorCode::new(ErrorCode::SERVER_ERROR))
}

/// One TURN allocation
pub struct TurnClient {
    channel: Channel,
    credentials: Mutex<Credentials>,
    relayed: SocketAddr,
    mapped: SocketAddr,
    lifetime: Mutex<Duration>,
    permissions: Mutex<HashMap<IpAddr, Instant>>,
}

impl TurnClient {
    /// Allocate a relayed address on `server` through `host`.
    ///
    /// The first Allocate is sent without credentials to obtain the
    /// server's realm and nonce from its 401 challenge.
    pub(crate) async fn allocate(
        host: Arc<HostSocket>,
        server: &TurnServerAddr,
        transactions: Arc<TransactionMap>,
        retransmit: RetransmitConfig,
    ) -> IceResult<Arc<Self>> {
        let channel = Channel {
            host,
            server: server.addr,
            transactions,
            retransmit,
        };
        let allocate = || {
            Message::request(Method::Allocate)
                .with(Attribute::RequestedTransport(TRANSPORT_UDP))
                .with(Attribute::Lifetime(REQUESTED_LIFETIME))
        };

        let first = allocate();
        let challenge = channel
            .transactions
            .transact(
                &Route::Direct(Arc::clone(&channel.host.socket)),
                &first.encode_with(None, true),
                first.transaction_id,
                channel.server,
                &channel.retransmit,
            )
            .await?
            .message;
        let error = error_of(&challenge);
        if challenge.class() != MessageClass::ErrorResponse || error.code != ErrorCode::UNAUTHORIZED {
            return Err(IceError::Protocol(format!(
                "expected 401 challenge to Allocate, got {:?}",
                challenge.message_type
            )));
        }

        let credentials = Mutex::new(Credentials::from_challenge(
            &challenge,
            &server.username,
            &server.password,
        )?);
        let response = channel.request(&credentials, allocate).await?;

        let relayed = response
            .xor_relayed_address()
            .ok_or_else(|| IceError::Protocol("Allocate success without XOR-RELAYED-ADDRESS".to_string()))?;
        let mapped = response
            .xor_mapped_address()
            .ok_or_else(|| IceError::Protocol("Allocate success without XOR-MAPPED-ADDRESS".to_string()))?;
        let lifetime = response.lifetime().unwrap_or(REQUESTED_LIFETIME);

        info!(
            server = %channel.server,
            relayed = %relayed,
            mapped = %mapped,
            lifetime_secs = lifetime,
            "TURN allocation created"
        );

        Ok(Arc::new(TurnClient {
            channel,
            credentials,
            relayed,
            mapped,
            lifetime: Mutex::new(Duration::from_secs(u64::from(lifetime))),
            permissions: Mutex::new(HashMap::new()),
        }))
    }

    /// Relayed transport address
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed
    }

    /// Server reflexive address of the host socket as seen by the server
    pub fn mapped_addr(&self) -> SocketAddr {
        self.mapped
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.channel.server
    }

    /// Refresh the allocation; returns the granted lifetime
    pub async fn refresh(&self, lifetime: u32) -> IceResult<Duration> {
        let response = self
            .channel
            .request(&self.credentials, || {
                Message::request(Method::Refresh).with(Attribute::Lifetime(lifetime))
            })
            .await?;
        let granted = Duration::from_secs(u64::from(response.lifetime().unwrap_or(lifetime)));
        *self.lifetime.lock().await = granted;
        debug!(relayed = %self.relayed, lifetime_secs = granted.as_secs(), "TURN allocation refreshed");
        Ok(granted)
    }

    /// Install a permission for `peer`'s IP unless a fresh one exists.
    ///
    /// The permission table is not locked while the request is in flight,
    /// so traffic to peers that already have a permission keeps flowing.
    pub async fn create_permission(&self, peer: SocketAddr) -> IceResult<()> {
        if self.has_permission(peer.ip()).await {
            return Ok(());
        }
        self.channel
            .request(&self.credentials, || {
                Message::request(Method::CreatePermission).with(Attribute::XorPeerAddress(peer))
            })
            .await?;
        self.permissions.lock().await.insert(peer.ip(), Instant::now());
        debug!(relayed = %self.relayed, peer = %peer.ip(), "TURN permission installed");
        Ok(())
    }

    async fn has_permission(&self, ip: IpAddr) -> bool {
        self.permissions
            .lock()
            .await
            .get(&ip)
            .is_some_and(|installed| installed.elapsed() < PERMISSION_REFRESH)
    }

    /// Relay `data` to `peer` in a Send indication
    pub(crate) fn send_to<'a>(&'a self, data: &'a [u8], peer: SocketAddr) -> BoxFuture<'a, IceResult<()>> {
        Box::pin(async move {
            self.create_permission(peer).await?;
            let indication = Message::indication(Method::Send)
                .with(Attribute::XorPeerAddress(peer))
                .with(Attribute::Data(Bytes::copy_from_slice(data)))
                .encode_with(None, true);
            self.channel
                .host
                .socket
                .send_to(&indication, self.channel.server)
                .await?;
            Ok(())
        })
    }

    /// Refresh at half the granted lifetime until cancelled or released
    pub(crate) fn spawn_refresher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let lifetime = *client.lifetime.lock().await;
                let Some(wait) = refresh_delay(lifetime) else {
                    debug!(relayed = %client.relayed, "TURN allocation released, refresher stopped");
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if let Err(e) = client.refresh(REQUESTED_LIFETIME).await {
                    warn!(relayed = %client.relayed, error = %e, "TURN refresh failed");
                }
            }
        })
    }

    /// Ask the server to drop the allocation with a LIFETIME 0 Refresh.
    ///
    /// Goes through the regular request path, so a stale nonce is renewed
    /// once before giving up.
    pub(crate) async fn release(&self) {
        match tokio::time::timeout(RELEASE_TIMEOUT, self.refresh(0)).await {
            Ok(Ok(_)) => info!(relayed = %self.relayed, "TURN allocation released"),
            Ok(Err(e)) => {
                debug!(relayed = %self.relayed, error = %e, "Failed to release TURN allocation")
            }
            Err(_) => debug!(relayed = %self.relayed, "TURN release timed out"),
        }
    }
}

/// Pause before the next refresh; None once the allocation has no lifetime left
fn refresh_delay(lifetime: Duration) -> Option<Duration> {
    if lifetime.is_zero() {
        return None;
    }
    Some((lifetime / 2).max(MIN_REFRESH_DELAY))
}
