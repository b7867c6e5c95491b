//! Long-term credential authentication for TURN
//!
//! The server asks an [`AuthHandler`] for the HMAC key of a username and
//! hands out short-lived nonces through [`NonceManager`].
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


use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun_proto::long_term_key;
use tokio::sync::Mutex;

/// Default nonce validity
pub const NONCE_LIFETIME: Duration = Duration::from_secs(600);

/// Source of long-term credential keys
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// MD5(username:realm:password) for a known user, `None` otherwise
    async fn auth_key(&self, username: &str, realm: &str, src: SocketAddr) -> Option<Vec<u8>>;
}

/// A single statically configured user
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        StaticCredentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthHandler for StaticCredentials {
    async fn auth_key(&self, username: &str, realm: &str, _src: SocketAddr) -> Option<Vec<u8>> {
        (username == self.username).then(|| long_term_key(username, realm, &self.password))
    }
}

/// Issues and validates nonces
pub struct NonceManager {
    /// Nonce -> issue time
    nonces: Mutex<HashMap<String, Instant>>,
    lifetime: Duration,
}

impl NonceManager {
    pub fn new(lifetime: Duration) -> Self {
        NonceManager {
            nonces: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Fresh nonce: 16 random bytes, hex encoded
    pub async fn issue(&self) -> String {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let now = Instant::now();
        let mut nonces = self.nonces.lock().await;
        nonces.retain(|_, issued| now.duration_since(*issued) < self.lifetime);
        nonces.insert(nonce.clone(), now);
        nonce
    }

    /// Whether the nonce was issued here and has not expired
    pub async fn is_valid(&self, nonce: &str) -> bool {
        let nonces = self.nonces.lock().await;
        nonces
            .get(nonce)
            .map(|issued| issued.elapsed() < self.lifetime)
            .unwrap_or(false)
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new(NONCE_LIFETIME)
    }
}
