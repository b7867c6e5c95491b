//! TURN allocation management
//!
//! Each allocation owns one relay socket and one read loop forwarding
//! permitted peer traffic back to the client. The manager table is keyed by
//! the client transport address.
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


use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stun_proto::{
    is_valid_channel_number, Attribute, ChannelData, Message, Method, TransactionId,
};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Permission lifetime (RFC 5766 Section 8)
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Channel binding lifetime (RFC 5766 Section 11)
pub const CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 65_536;

/// Allocation manager configuration
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// IP relay sockets are bound on
    pub relay_ip: IpAddr,
    /// Address advertised in XOR-RELAYED-ADDRESS (defaults to the bound IP)
    pub public_ip: Option<IpAddr>,
    /// Relay port range; ephemeral ports when `None`
    pub port_range: Option<RangeInclusive<u16>>,
    /// Lifetime granted when the client asks for none
    pub default_lifetime: Duration,
    /// Upper bound on granted lifetimes
    pub max_lifetime: Duration,
    /// Maximum concurrent allocations
    pub max_allocations: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig {
            relay_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_ip: None,
            port_range: None,
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            max_allocations: 1000,
        }
    }
}

/// Mutable part of an allocation, guarded by its own lock
struct AllocationState {
    expires_at: Instant,
    /// Peer IP -> permission expiry
    permissions: HashMap<IpAddr, Instant>,
    /// Channel number -> (peer, binding expiry)
    channels: HashMap<u16, (SocketAddr, Instant)>,
    relay_socket: Option<Arc<UdpSocket>>,
    expired: bool,
}

impl AllocationState {
    fn is_live(&self, now: Instant) -> bool {
        !self.expired && self.expires_at > now
    }

    fn is_permitted(&self, peer_ip: &IpAddr, now: Instant) -> bool {
        self.permissions
            .get(peer_ip)
            .map(|expires| *expires > now)
            .unwrap_or(false)
    }

    fn channel_for(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        self.channels
            .iter()
            .find(|(_, (bound, expires))| *bound == peer && *expires > now)
            .map(|(number, _)| *number)
    }
}

/// A TURN allocation
pub struct Allocation {
    id: Uuid,
    client: SocketAddr,
    relay_addr: SocketAddr,
    username: String,
    /// Transaction of the Allocate request that created it
    transaction_id: TransactionId,
    state: Mutex<AllocationState>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl Allocation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Address advertised to the client and its peers
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Check if allocation is expired
    pub async fn is_expired(&self) -> bool {
        !self.state.lock().await.is_live(Instant::now())
    }

    /// Time left before expiry
    pub async fn remaining_lifetime(&self) -> Duration {
        self.state
            .lock()
            .await
            .expires_at
            .saturating_duration_since(Instant::now())
    }

    async fn live_state(&self) -> RelayResult<MutexGuard<'_, AllocationState>> {
        let state = self.state.lock().await;
        if !state.is_live(Instant::now()) {
            return Err(RelayError::AllocationExpired(self.id.to_string()));
        }
        Ok(state)
    }

    /// Refresh allocation (extend lifetime)
    pub async fn refresh(&self, lifetime: Duration) -> RelayResult<()> {
        let mut state = self.live_state().await?;
        state.expires_at = Instant::now() + lifetime;
        Ok(())
    }

    /// Install or refresh the permission for a peer IP
    pub async fn add_permission(&self, peer_ip: IpAddr) -> RelayResult<()> {
        let mut state = self.live_state().await?;
        state
            .permissions
            .insert(peer_ip, Instant::now() + PERMISSION_LIFETIME);
        Ok(())
    }

    /// Check if peer IP is permitted
    pub async fn is_permitted(&self, peer_ip: IpAddr) -> bool {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.is_live(now) && state.is_permitted(&peer_ip, now)
    }

    /// Bind a channel to a peer; also installs a permission for the peer IP.
    ///
    /// Bindings are one-to-one. Rebinding the same pair refreshes it.
    pub async fn bind_channel(&self, number: u16, peer: SocketAddr) -> RelayResult<()> {
        if !is_valid_channel_number(number) {
            return Err(RelayError::InvalidRequest(format!(
                "channel number 0x{:04x} out of range",
                number
            )));
        }

        let mut state = self.live_state().await?;
        let now = Instant::now();
        if let Some((bound, _)) = state.channels.get(&number) {
            if *bound != peer {
                return Err(RelayError::InvalidRequest(format!(
                    "channel 0x{:04x} is bound to {}",
                    number, bound
                )));
            }
        }
        if let Some(other) = state.channel_for(peer, now) {
            if other != number {
                return Err(RelayError::InvalidRequest(format!(
                    "{} is bound to channel 0x{:04x}",
                    peer, other
                )));
            }
        }

        state.channels.insert(number, (peer, now + CHANNEL_LIFETIME));
        state
            .permissions
            .insert(peer.ip(), now + PERMISSION_LIFETIME);
        Ok(())
    }

    /// Peer bound to a channel
    pub async fn channel_peer(&self, number: u16) -> Option<SocketAddr> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .channels
            .get(&number)
            .filter(|(_, expires)| *expires > now)
            .map(|(peer, _)| *peer)
    }

    /// Send from the relay socket to a permitted peer
    pub async fn send_to_peer(&self, peer: SocketAddr, data: &[u8]) -> RelayResult<usize> {
        let socket = {
            let state = self.live_state().await?;
            if !state.is_permitted(&peer.ip(), Instant::now()) {
                return Err(RelayError::PermissionDenied(peer.to_string()));
            }
            state
                .relay_socket
                .clone()
                .ok_or_else(|| RelayError::AllocationExpired(self.id.to_string()))?
        };
        Ok(socket.send_to(data, peer).await?)
    }

    /// Wrap a peer datagram for the client, `None` if the peer is not permitted
    async fn frame_for_client(&self, peer: SocketAddr, data: &[u8]) -> Option<Bytes> {
        let now = Instant::now();
        let state = self.state.lock().await;
        if !state.is_live(now) || !state.is_permitted(&peer.ip(), now) {
            return None;
        }

        let data = Bytes::copy_from_slice(data);
        let frame = match state.channel_for(peer, now) {
            Some(number) => ChannelData::new(number, data).encode(),
            None => Message::indication(Method::Data)
                .with(Attribute::XorPeerAddress(peer))
                .with(Attribute::Data(data))
                .encode_with(None, true),
        };
        Some(frame)
    }

    /// Drop stale permissions and channels; true when the allocation itself is due
    async fn prune(&self, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        state.permissions.retain(|_, expires| *expires > now);
        state.channels.retain(|_, (_, expires)| *expires > now);
        !state.is_live(now)
    }

    /// (permissions, channel bindings)
    async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.permissions.len(), state.channels.len())
    }

    /// Stop the relay loop and drop the socket
    async fn release(&self) {
        {
            let mut state = self.state.lock().await;
            state.expired = true;
            state.permissions.clear();
            state.channels.clear();
            state.relay_socket = None;
        }
        if let Some(task) = self.relay_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("relay_addr", &self.relay_addr)
            .field("username", &self.username)
            .finish()
    }
}

/// Allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Active allocations
    pub active_allocations: usize,
    /// Installed permissions across all allocations
    pub permissions: usize,
    /// Channel bindings across all allocations
    pub channel_bindings: usize,
}

/// Allocation manager
pub struct AllocationManager {
    config: AllocationConfig,
    /// Listening socket of the TURN server, used to reach clients
    server_socket: Arc<UdpSocket>,
    /// Active allocations by client address
    allocations: RwLock<HashMap<SocketAddr, Arc<Allocation>>>,
    /// Reserved relay ports when a range is configured
    ports_in_use: Mutex<HashSet<u16>>,
}

impl AllocationManager {
    /// Create a new allocation manager
    pub fn new(config: AllocationConfig, server_socket: Arc<UdpSocket>) -> Self {
        AllocationManager {
            config,
            server_socket,
            allocations: RwLock::new(HashMap::new()),
            ports_in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Granted lifetime for a requested LIFETIME value
    pub fn lifetime_for(&self, requested: Option<u32>) -> Duration {
        match requested {
            None | Some(0) => self.config.default_lifetime,
            Some(secs) => Duration::from_secs(u64::from(secs)).min(self.config.max_lifetime),
        }
    }

    /// Create a new allocation and start its relay loop
    pub async fn create_allocation(
        &self,
        client: SocketAddr,
        username: &str,
        transaction_id: TransactionId,
        requested_lifetime: Option<u32>,
    ) -> RelayResult<Arc<Allocation>> {
        let mut allocations = self.allocations.write().await;
        if let Some(existing) = allocations.get(&client).cloned() {
            if !existing.is_expired().await {
                return Err(RelayError::AllocationMismatch(format!(
                    "{} already has an allocation",
                    client
                )));
            }
            // Expired but not swept yet
            allocations.remove(&client);
            self.release(&existing).await;
        }
        if allocations.len() >= self.config.max_allocations {
            return Err(RelayError::InsufficientCapacity(
                "Maximum allocations reached".to_string(),
            ));
        }

        let (socket, local) = self.bind_relay_socket().await?;
        let socket = Arc::new(socket);
        let relay_addr = SocketAddr::new(self.config.public_ip.unwrap_or(local.ip()), local.port());
        let lifetime = self.lifetime_for(requested_lifetime);

        let allocation = Arc::new(Allocation {
            id: Uuid::new_v4(),
            client,
            relay_addr,
            username: username.to_string(),
            transaction_id,
            state: Mutex::new(AllocationState {
                expires_at: Instant::now() + lifetime,
                permissions: HashMap::new(),
                channels: HashMap::new(),
                relay_socket: Some(Arc::clone(&socket)),
                expired: false,
            }),
            relay_task: Mutex::new(None),
        });

        let task = tokio::spawn(relay_loop(
            Arc::downgrade(&allocation),
            socket,
            Arc::clone(&self.server_socket),
            client,
        ));
        *allocation.relay_task.lock().await = Some(task);
        allocations.insert(client, Arc::clone(&allocation));

        info!(
            allocation_id = %allocation.id,
            client = %client,
            relay = %relay_addr,
            lifetime_secs = lifetime.as_secs(),
            "Allocation created"
        );
        Ok(allocation)
    }

    async fn bind_relay_socket(&self) -> RelayResult<(UdpSocket, SocketAddr)> {
        let Some(range) = self.config.port_range.clone() else {
            let socket = UdpSocket::bind(SocketAddr::new(self.config.relay_ip, 0)).await?;
            let local = socket.local_addr()?;
            return Ok((socket, local));
        };

        let mut in_use = self.ports_in_use.lock().await;
        for port in range {
            if in_use.contains(&port) {
                continue;
            }
            let addr = SocketAddr::new(self.config.relay_ip, port);
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    in_use.insert(port);
                    return Ok((socket, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RelayError::InsufficientCapacity(
            "Relay port range exhausted".to_string(),
        ))
    }

    /// Allocation for a client, expired or not
    pub async fn find(&self, client: SocketAddr) -> Option<Arc<Allocation>> {
        self.allocations.read().await.get(&client).cloned()
    }

    /// Live allocation for a client
    pub async fn get_allocation(&self, client: SocketAddr) -> RelayResult<Arc<Allocation>> {
        match self.find(client).await {
            Some(allocation) if !allocation.is_expired().await => Ok(allocation),
            _ => Err(RelayError::AllocationMismatch(format!(
                "No allocation for {}",
                client
            ))),
        }
    }

    /// Refresh an allocation; a zero lifetime deletes it.
    ///
    /// Returns the granted lifetime.
    pub async fn refresh_allocation(
        &self,
        client: SocketAddr,
        requested_lifetime: Option<u32>,
    ) -> RelayResult<Duration> {
        let allocation = self.get_allocation(client).await?;
        if requested_lifetime == Some(0) {
            self.delete_allocation(client).await?;
            return Ok(Duration::ZERO);
        }
        let lifetime = self.lifetime_for(requested_lifetime);
        allocation.refresh(lifetime).await?;
        debug!(client = %client, lifetime_secs = lifetime.as_secs(), "Allocation refreshed");
        Ok(lifetime)
    }

    /// Delete allocation
    pub async fn delete_allocation(&self, client: SocketAddr) -> RelayResult<()> {
        let allocation = self
            .allocations
            .write()
            .await
            .remove(&client)
            .ok_or_else(|| RelayError::AllocationMismatch(format!("No allocation for {}", client)))?;
        self.release(&allocation).await;
        Ok(())
    }

    async fn release(&self, allocation: &Allocation) {
        allocation.release().await;
        if self.config.port_range.is_some() {
            self.ports_in_use
                .lock()
                .await
                .remove(&allocation.relay_addr.port());
        }
        info!(
            allocation_id = %allocation.id,
            client = %allocation.client,
            relay = %allocation.relay_addr,
            "Allocation released"
        );
    }

    /// CreatePermission for one or more peers
    pub async fn create_permission(
        &self,
        client: SocketAddr,
        peers: &[SocketAddr],
    ) -> RelayResult<()> {
        let allocation = self.get_allocation(client).await?;
        for peer in peers {
            allocation.add_permission(peer.ip()).await?;
        }
        Ok(())
    }

    /// ChannelBind
    pub async fn bind_channel(
        &self,
        client: SocketAddr,
        number: u16,
        peer: SocketAddr,
    ) -> RelayResult<()> {
        self.get_allocation(client)
            .await?
            .bind_channel(number, peer)
            .await
    }

    /// Relay the payload of a Send indication
    pub async fn send_indication(
        &self,
        client: SocketAddr,
        peer: SocketAddr,
        data: &[u8],
    ) -> RelayResult<usize> {
        self.get_allocation(client)
            .await?
            .send_to_peer(peer, data)
            .await
    }

    /// Relay a ChannelData frame to the bound peer
    pub async fn relay_channel_data(
        &self,
        client: SocketAddr,
        frame: &ChannelData,
    ) -> RelayResult<usize> {
        let allocation = self.get_allocation(client).await?;
        let peer = allocation.channel_peer(frame.number).await.ok_or_else(|| {
            RelayError::InvalidRequest(format!("channel 0x{:04x} is not bound", frame.number))
        })?;
        allocation.send_to_peer(peer, &frame.data).await
    }

    /// Clean up expired allocations, permissions and channel bindings
    pub async fn reap_expired(&self) -> usize {
        self.reap_expired_at(Instant::now()).await
    }

    /// Same as [`reap_expired`](Self::reap_expired) with an explicit clock
    pub async fn reap_expired_at(&self, now: Instant) -> usize {
        let expired = {
            let mut allocations = self.allocations.write().await;
            let mut expired = Vec::new();
            let entries: Vec<(SocketAddr, Arc<Allocation>)> = allocations
                .iter()
                .map(|(client, allocation)| (*client, Arc::clone(allocation)))
                .collect();
            for (client, allocation) in entries {
                if allocation.prune(now).await {
                    allocations.remove(&client);
                    expired.push(allocation);
                }
            }
            expired
        };

        for allocation in &expired {
            self.release(allocation).await;
        }
        expired.len()
    }

    /// Run [`reap_expired`](Self::reap_expired) every second until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = manager.reap_expired().await;
                        if reaped > 0 {
                            debug!(reaped, "Expired allocations reaped");
                        }
                    }
                }
            }
        })
    }

    /// Get allocation count
    pub async fn allocation_count(&self) -> usize {
        self.allocations.read().await.len()
    }

    /// Get allocation statistics
    pub async fn stats(&self) -> RelayStats {
        let allocations: Vec<Arc<Allocation>> =
            self.allocations.read().await.values().cloned().collect();
        let mut stats = RelayStats {
            active_allocations: allocations.len(),
            ..RelayStats::default()
        };
        for allocation in allocations {
            let (permissions, channels) = allocation.counts().await;
            stats.permissions += permissions;
            stats.channel_bindings += channels;
        }
        stats
    }

    /// Tear down every allocation
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Allocation>> = self
            .allocations
            .write()
            .await
            .drain()
            .map(|(_, allocation)| allocation)
            .collect();
        for allocation in &drained {
            self.release(allocation).await;
        }
    }
}

/// Forward peer datagrams arriving on the relay socket to the client
async fn relay_loop(
    allocation: Weak<Allocation>,
    socket: Arc<UdpSocket>,
    server_socket: Arc<UdpSocket>,
    client: SocketAddr,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(client = %client, error = %e, "Relay socket receive failed");
                break;
            }
        };
        let Some(allocation) = allocation.upgrade() else {
            break;
        };

        match allocation.frame_for_client(peer, &buf[..len]).await {
            Some(frame) => {
                if let Err(e) = server_socket.send_to(&frame, client).await {
                    warn!(client = %client, error = %e, "Failed to forward relayed data");
                }
            }
            None => debug!(peer = %peer, client = %client, "Dropping datagram from unpermitted peer"),
        }
    }
}
