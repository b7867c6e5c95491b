//! STUN binding responder
//!
//! Answers Binding requests with the source transport address of the
//! request. Stateless; anything else is dropped.
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


use crate::error::RelayResult;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use stun_proto::{Attribute, Message, MessageClass, Method, SOFTWARE};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 2048;

/// STUN server configuration
#[derive(Debug, Clone)]
pub struct StunServerConfig {
    /// UDP listen address
    pub listen_addr: SocketAddr,
}

impl Default for StunServerConfig {
    fn default() -> Self {
        StunServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3478)),
        }
    }
}

/// Binding Success for `request` reporting `from` as XOR-MAPPED-ADDRESS
pub(crate) fn binding_response(request: &Message, from: SocketAddr) -> Bytes {
    request
        .success_response()
        .with(Attribute::XorMappedAddress(from))
        .with(Attribute::Software(SOFTWARE.to_string()))
        .encode_with(None, true)
}

/// STUN binding responder
pub struct StunServer {
    socket: UdpSocket,
    cancel: CancellationToken,
}

impl StunServer {
    /// Bind the listening socket
    pub async fn bind(config: StunServerConfig) -> RelayResult<Arc<Self>> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        info!(addr = %socket.local_addr()?, "STUN server listening");
        Ok(Arc::new(StunServer {
            socket,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until [`close`](Self::close) or a socket error
    pub async fn run(&self) -> RelayResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!(error = %e, "STUN socket receive failed");
                        return Err(e.into());
                    }
                },
            };

            let Some(response) = Self::handle_datagram(&buf[..len], from) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&response, from).await {
                warn!(client = %from, error = %e, "Failed to send Binding response");
            }
        }
        info!("STUN server stopped");
        Ok(())
    }

    /// Run on a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<RelayResult<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run().await })
    }

    /// Stop serving
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn handle_datagram(data: &[u8], from: SocketAddr) -> Option<Bytes> {
        let request = match Message::decode(data) {
            Ok(request) => request,
            Err(e) => {
                debug!(client = %from, error = %e, "Discarding undecodable datagram");
                return None;
            }
        };
        if !request.is(Method::Binding, MessageClass::Request) {
            debug!(client = %from, message_type = ?request.message_type, "Ignoring non-Binding message");
            return None;
        }
        Some(binding_response(&request, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> StunServerConfig {
        StunServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[test]
    fn test_binding_response() {
        let from: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let request = Message::request(Method::Binding);
        let response = StunServer::handle_datagram(&request.encode(), from).unwrap();

        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.class(), MessageClass::SuccessResponse);
        assert_eq!(decoded.xor_mapped_address(), Some(from));
        assert!(decoded.has_fingerprint());
    }

    #[test]
    fn test_ignores_other_messages() {
        let from: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        assert!(StunServer::handle_datagram(&[1, 2, 3, 4], from).is_none());

        let allocate = Message::request(Method::Allocate);
        assert!(StunServer::handle_datagram(&allocate.encode(), from).is_none());

        let indication = Message::indication(Method::Binding);
        assert!(StunServer::handle_datagram(&indication.encode(), from).is_none());
    }

    #[tokio::test]
    async fn test_server_round_trip_and_close() {
        let server = StunServer::bind(loopback()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Message::request(Method::Binding);
        client.send_to(&request.encode(), addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::decode(&buf[..len]).unwrap();
        assert_eq!(
            response.xor_mapped_address(),
            Some(client.local_addr().unwrap())
        );

        server.close();
        handle.await.unwrap().unwrap();
    }
}
