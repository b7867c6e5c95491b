//! STUN client transactions with retransmission
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
use crate::transport::Route;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use stun_proto::{Message, TransactionId};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Retransmission schedule for client transactions
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    /// Retransmissions after the initial send
    pub max_retransmissions: u32,
    /// Wait after the initial send in milliseconds
    pub initial_rto_ms: u64,
    /// Cap on the wait between sends in milliseconds
    pub max_rto_ms: u64,
    /// Multiplier applied to the wait after each send
    pub multiplier: f64,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            max_retransmissions: 3,
            initial_rto_ms: 500,
            max_rto_ms: 2000,
            multiplier: 2.0,
        }
    }
}

impl RetransmitConfig {
    /// Create a new retransmission configuration
    pub fn new(max_retransmissions: u32, initial_rto_ms: u64, max_rto_ms: u64, multiplier: f64) -> Self {
        Self {
            max_retransmissions,
            initial_rto_ms,
            max_rto_ms,
            multiplier,
        }
    }

    /// How long to wait for a response after send number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_rto_ms as f64) * self.multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_rto_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Time from the first send until the transaction gives up
    pub fn total_timeout(&self) -> Duration {
        (0..=self.max_retransmissions)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

/// Response matched to an outstanding transaction
#[derive(Debug, Clone)]
pub struct StunResponse {
    pub message: Message,
    /// Datagram as received, for MESSAGE-INTEGRITY verification
    pub raw: Bytes,
    /// Source of the response (the peer for relayed traffic)
    pub from: SocketAddr,
}

/// Outstanding client transactions keyed by transaction ID
#[derive(Debug, Default)]
pub struct TransactionMap {
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<StunResponse>>>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, id: TransactionId) -> oneshot::Receiver<StunResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Stop waiting for `id`
    pub async fn remove(&self, id: &TransactionId) {
        self.pending.lock().await.remove(id);
    }

    /// Hand a response to its waiting transaction; false if none matches
    pub async fn resolve(&self, response: StunResponse) -> bool {
        let Some(tx) = self
            .pending
            .lock()
            .await
            .remove(&response.message.transaction_id)
        else {
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Abort every outstanding transaction with [`IceError::Closed`]
    pub async fn fail_all(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send `request` to `dest` over `route` and wait for the matching
    /// response, retransmitting on the configured schedule.
    pub(crate) async fn transact(
        &self,
        route: &Route,
        request: &Bytes,
        id: TransactionId,
        dest: SocketAddr,
        config: &RetransmitConfig,
    ) -> IceResult<StunResponse> {
        let mut rx = self.register(id).await;

        for attempt in 0..=config.max_retransmissions {
            if let Err(e) = route.send_to(request, dest).await {
                warn!(dest = %dest, error = %e, "Failed to send STUN request");
                self.remove(&id).await;
                return Err(e);
            }

            match timeout(config.delay_for_attempt(attempt), &mut rx).await {
                Ok(Ok(response)) => {
                    if attempt > 0 {
                        debug!(
                            transaction_id = %id,
                            attempt = attempt,
                            "Response received after retransmission"
                        );
                    }
                    return Ok(response);
                }
                Ok(Err(_)) => return Err(IceError::Closed),
                Err(_) if attempt < config.max_retransmissions => {
                    debug!(
                        transaction_id = %id,
                        dest = %dest,
                        attempt = attempt + 1,
                        max_retransmissions = config.max_retransmissions,
                        "Retransmitting STUN request"
                    );
                }
                Err(_) => {}
            }
        }

        self.remove(&id).await;
        Err(IceError::Timeout(format!(
            "no response from {} after {} sends",
            dest,
            config.max_retransmissions + 1
        )))
    }
}
