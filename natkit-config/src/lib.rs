//! Configuration management for NATKit services
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


use config::ConfigError;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Which service the binary runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Stun,
    Turn,
    Ice,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stun" => Ok(Mode::Stun),
            "turn" => Ok(Mode::Turn),
            "ice" => Ok(Mode::Ice),
            other => Err(ConfigError::Message(format!(
                "NATKIT_MODE must be stun, turn or ice, got '{}'",
                other
            ))),
        }
    }
}

/// TURN relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Relay bind address; a non-zero port starts the port range
    pub bind: SocketAddr,
    /// Explicit relay port range
    pub ports: Option<RangeInclusive<u16>>,
    pub realm: String,
    pub username: String,
    pub password: String,
}

impl RelayConfig {
    /// Port range to allocate relay sockets from, if any
    pub fn port_range(&self) -> Option<RangeInclusive<u16>> {
        match (&self.ports, self.bind.port()) {
            (Some(ports), _) => Some(ports.clone()),
            (None, 0) => None,
            (None, start) => Some(start..=u16::MAX),
        }
    }
}

/// ICE agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IceConfig {
    pub controlling: bool,
    /// Offer only the TURN relayed candidate
    pub relay_only: bool,
    /// `host:port` of the STUN server
    pub stun_server: Option<String>,
    /// `host:port` of the TURN server
    pub turn_server: Option<String>,
    /// Peer token; read from stdin when absent
    pub secret: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mode: Mode,
    /// STUN/TURN listen address
    pub listen: SocketAddr,
    pub relay: RelayConfig,
    pub ice: IceConfig,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mode = var("NATKIT_MODE", "stun").parse()?;
        let listen = parse_addr("NATKIT_LISTEN", &var("NATKIT_LISTEN", "0.0.0.0:3478"))?;
        let bind = parse_addr("NATKIT_RELAY", &var("NATKIT_RELAY", "0.0.0.0:0"))?;
        let ports = lookup("NATKIT_RELAY_PORTS")
            .map(|value| parse_port_range(&value))
            .transpose()?;
        let controlling = parse_bool("NATKIT_CONTROLLING", &var("NATKIT_CONTROLLING", "false"))?;
        let relay_only = parse_bool("NATKIT_RELAY_ONLY", &var("NATKIT_RELAY_ONLY", "false"))?;

        Ok(Self {
            mode,
            listen,
            relay: RelayConfig {
                bind,
                ports,
                realm: var("NATKIT_REALM", "example.org"),
                username: var("NATKIT_USER", "demo"),
                password: var("NATKIT_PASS", "demo"),
            },
            ice: IceConfig {
                controlling,
                relay_only,
                stun_server: lookup("NATKIT_STUN_SERVER").filter(|s| !s.is_empty()),
                turn_server: lookup("NATKIT_TURN_SERVER").filter(|s| !s.is_empty()),
                secret: lookup("NATKIT_SECRET").filter(|s| !s.is_empty()),
            },
            log_level: Some(var("LOG_LEVEL", "info")),
            log_format: lookup("LOG_FORMAT"),
        })
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Get log format, defaulting to "console"
    pub fn log_format(&self) -> &str {
        self.log_format.as_deref().unwrap_or("console")
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Message(format!("{} '{}' is not ip:port: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Message(format!(
            "{} must be true or false, got '{}'",
            key, value
        ))),
    }
}

/// `min-max`, inclusive
fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let invalid = || ConfigError::Message(format!("NATKIT_RELAY_PORTS '{}' is not min-max", value));
    let (min, max) = value.split_once('-').ok_or_else(invalid)?;
    let min: u16 = min.trim().parse().map_err(|_| invalid())?;
    let max: u16 = max.trim().parse().map_err(|_| invalid())?;
    if min == 0 || min > max {
        return Err(invalid());
    }
    Ok(min..=max)
}
