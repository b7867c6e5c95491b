//! Host sockets, read loops and send routes
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


use crate::error::IceResult;
use crate::transaction::{StunResponse, TransactionMap};
use crate::turn_client::TurnClient;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use stun_proto::{looks_like_stun, Message, MessageClass, Method};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65_536;

/// Where to send datagrams originating from a local candidate
#[derive(Clone)]
pub(crate) enum Route {
    /// Straight out of a host socket
    Direct(Arc<UdpSocket>),
    /// Through a TURN allocation as Send indications
    Relayed(Arc<TurnClient>),
}

impl Route {
    pub(crate) async fn send_to(&self, data: &[u8], dest: SocketAddr) -> IceResult<()> {
        match self {
            Route::Direct(socket) => {
                socket.send_to(data, dest).await?;
                Ok(())
            }
            Route::Relayed(turn) => turn.send_to(data, dest).await,
        }
    }
}

/// TURN server reached from a host socket and the relayed address it granted
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelayBinding {
    pub server: SocketAddr,
    pub relayed: SocketAddr,
}

/// Datagram handed to the agent
#[derive(Debug, Clone)]
pub(crate) struct Inbound {
    /// Local candidate address it arrived on (relayed address for TURN traffic)
    pub local: SocketAddr,
    pub from: SocketAddr,
    pub raw: Bytes,
    /// Decoded STUN message; None for application data
    pub message: Option<Message>,
}

/// Bound UDP socket backing a host candidate
pub(crate) struct HostSocket {
    pub socket: Arc<UdpSocket>,
    pub addr: SocketAddr,
    relay: RwLock<Option<RelayBinding>>,
}

impl HostSocket {
    pub(crate) async fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = socket.local_addr()?;
        Ok(Arc::new(HostSocket {
            socket: Arc::new(socket),
            addr,
            relay: RwLock::new(None),
        }))
    }

    /// Unwrap Data indications from `binding.server` as traffic on `binding.relayed`
    pub(crate) async fn set_relay(&self, binding: RelayBinding) {
        *self.relay.write().await = Some(binding);
    }

    /// Start the read loop for this socket
    pub(crate) fn spawn_read_loop(
        self: &Arc<Self>,
        transactions: Arc<TransactionMap>,
        inbound: mpsc::UnboundedSender<Inbound>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let host = Arc::clone(self);
        tokio::spawn(async move { host.read_loop(transactions, inbound, cancel).await })
    }

    async fn read_loop(
        &self,
        transactions: Arc<TransactionMap>,
        inbound: mpsc::UnboundedSender<Inbound>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    // ICMP port unreachable surfaces here on some platforms
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        warn!(addr = %self.addr, error = %e, "Host socket receive failed");
                        break;
                    }
                },
            };

            let raw = Bytes::copy_from_slice(&buf[..len]);
            let relay = *self.relay.read().await;
            let (local, from, raw) = match relay {
                Some(binding) if binding.server == from => match unwrap_data_indication(&raw) {
                    Some((peer, payload)) => (binding.relayed, peer, payload),
                    None => (self.addr, from, raw),
                },
                _ => (self.addr, from, raw),
            };

            if !dispatch(local, from, raw, &transactions, &inbound).await {
                debug!(addr = %self.addr, "Agent stopped listening");
                break;
            }
        }
        debug!(addr = %self.addr, "Host socket read loop stopped");
    }
}

/// Peer address and payload of a TURN Data indication
fn unwrap_data_indication(raw: &[u8]) -> Option<(SocketAddr, Bytes)> {
    if !looks_like_stun(raw) {
        return None;
    }
    let message = Message::decode(raw).ok()?;
    if !message.is(Method::Data, MessageClass::Indication) {
        return None;
    }
    Some((message.xor_peer_address()?, message.data()?.clone()))
}

/// Resolve responses against pending transactions; pass everything else on.
///
/// Returns false once the inbound receiver is gone.
async fn dispatch(
    local: SocketAddr,
    from: SocketAddr,
    raw: Bytes,
    transactions: &TransactionMap,
    inbound: &mpsc::UnboundedSender<Inbound>,
) -> bool {
    let message = if looks_like_stun(&raw) {
        match Message::decode(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(from = %from, error = %e, "Discarding undecodable STUN message");
                return true;
            }
        }
    } else {
        None
    };

    if let Some(message) = &message {
        if message.class().is_response() {
            let response = StunResponse {
                message: message.clone(),
                raw,
                from,
            };
            if !transactions.resolve(response).await {
                debug!(from = %from, "Discarding response to unknown transaction");
            }
            return true;
        }
    }

    inbound
        .send(Inbound {
            local,
            from,
            raw,
            message,
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stun_proto::Attribute;

    #[test]
    fn test_unwrap_data_indication() {
        let peer: SocketAddr = "198.51.100.2:4000".parse().unwrap();
        let indication = Message::indication(Method::Data)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(Bytes::from_static(b"payload")))
            .encode();
        let (from, payload) = unwrap_data_indication(&indication).unwrap();
        assert_eq!(from, peer);
        assert_eq!(&payload[..], b"payload");

        let send = Message::indication(Method::Send)
            .with(Attribute::XorPeerAddress(peer))
            .encode();
        assert!(unwrap_data_indication(&send).is_none());
        assert!(unwrap_data_indication(b"plain").is_none());
    }

    #[tokio::test]
    async fn test_read_loop_demultiplexes() {
        let host = HostSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let transactions = Arc::new(TransactionMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = host.spawn_read_loop(Arc::clone(&transactions), tx, cancel.clone());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", host.addr).await.unwrap();
        let request = Message::request(Method::Binding);
        peer.send_to(&request.encode(), host.addr).await.unwrap();

        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(data.message.is_none());
        assert_eq!(&data.raw[..], b"hello");
        assert_eq!(data.local, host.addr);

        let stun = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stun.message.map(|m| m.transaction_id),
            Some(request.transaction_id)
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_loop_unwraps_relayed_traffic() {
        let host = HostSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relayed: SocketAddr = "127.0.0.1:49999".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        host.set_relay(RelayBinding {
            server: server.local_addr().unwrap(),
            relayed,
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        host.spawn_read_loop(Arc::new(TransactionMap::new()), tx, cancel.clone());

        let indication = Message::indication(Method::Data)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(Bytes::from_static(b"via relay")))
            .encode();
        server.send_to(&indication, host.addr).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.local, relayed);
        assert_eq!(inbound.from, peer);
        assert_eq!(&inbound.raw[..], b"via relay");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_read_loop_ends_when_receiver_dropped() {
        let host = HostSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = host.spawn_read_loop(Arc::new(TransactionMap::new()), tx, cancel.clone());
        drop(rx);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"nobody listens", host.addr).await.unwrap();

        // Stops without being cancelled
        let stopped = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(stopped.is_ok(), "read loop kept running after the receiver was dropped");
        assert!(!cancel.is_cancelled());
    }
}
