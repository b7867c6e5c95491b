//! Out-of-band exchange of credentials and candidates
//!
//! A session description travels between peers as base64-encoded JSON.
//! The shorter credentials-only token is base64 of `ufrag:pwd`.
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


use crate::candidate::Candidate;
use crate::error::{IceError, IceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Local credentials and candidates of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub ufrag: String,
    pub pwd: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl SessionDescription {
    /// Encode as a copy-pasteable token
    pub fn encode(&self) -> IceResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| IceError::InvalidToken(format!("serialize failed: {}", e)))?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(token: &str) -> IceResult<Self> {
        let json = STANDARD
            .decode(token.trim())
            .map_err(|e| IceError::InvalidToken(format!("bad base64: {}", e)))?;
        let description: SessionDescription = serde_json::from_slice(&json)
            .map_err(|e| IceError::InvalidToken(format!("bad description: {}", e)))?;
        if description.ufrag.is_empty() || description.pwd.is_empty() {
            return Err(IceError::InvalidToken("empty credentials".to_string()));
        }
        Ok(description)
    }

    /// Short token carrying only `ufrag:pwd`
    pub fn credentials_token(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.ufrag, self.pwd))
    }

    /// Decode either a full description token or a credentials-only one
    pub fn credentials_only(token: &str) -> IceResult<Self> {
        if let Ok(description) = Self::decode(token) {
            return Ok(description);
        }
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|e| IceError::InvalidToken(format!("bad base64: {}", e)))?;
        let text = String::from_utf8(raw)
            .map_err(|_| IceError::InvalidToken("credentials are not UTF-8".to_string()))?;
        match text.split_once(':') {
            Some((ufrag, pwd)) if !ufrag.is_empty() && !pwd.is_empty() => Ok(SessionDescription {
                ufrag: ufrag.to_string(),
                pwd: pwd.to_string(),
                candidates: Vec::new(),
            }),
            _ => Err(IceError::InvalidToken("expected ufrag:pwd".to_string())),
        }
    }
}
