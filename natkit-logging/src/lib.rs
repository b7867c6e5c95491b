//! Structured logging setup for NATKit services
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


use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event (for production)
    Json,
    /// Human-readable lines (for development)
    Console,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// `RUST_LOG` when set, else `default_level`
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber in the given format.
///
/// Returns false when a subscriber was already installed.
pub fn init(format: LogFormat, service_name: &str, default_level: &str) -> bool {
    match format {
        LogFormat::Json => init_logging(service_name, default_level),
        LogFormat::Console => init_console_logging(service_name, default_level),
    }
}

/// Initialize JSON logging
///
/// This sets up:
/// - JSON formatted logs with target, file and line
/// - Environment-based log level filtering
/// - Service name tagging
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Logging initialized");
    }
    installed
}

/// Initialize human-readable console logging
pub fn init_console_logging(service_name: &str, default_level: &str) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Console logging initialized");
    }
    installed
}
