//! NATKit
//!
//! Runs one of three services selected by `NATKIT_MODE`: a STUN binding
//! responder, a TURN relay with a single static credential, or an ICE peer
//! that exchanges a token with its counterpart and connects to it.
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


mod peer;

use anyhow::Result;
use nat_relay::{
    RelayResult, StaticCredentials, StunServer, StunServerConfig, TurnServer, TurnServerConfig,
};
use natkit_config::{AppConfig, Mode};
use natkit_logging::LogFormat;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    let format: LogFormat = config
        .log_format()
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    natkit_logging::init(format, "natkit", config.log_level());

    info!(mode = ?config.mode, listen = %config.listen, "Starting NATKit");

    match config.mode {
        Mode::Stun => run_stun(&config).await?,
        Mode::Turn => run_turn(&config).await?,
        Mode::Ice => peer::run(&config).await?,
    }

    info!("NATKit stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }
}

/// Wait for the server task or for `shutdown`, whichever comes first.
///
/// A server task that ends on its own is reported at once; otherwise
/// `close` runs and the task is joined.
async fn supervise<S, C>(mut handle: JoinHandle<RelayResult<()>>, shutdown: S, close: C) -> Result<()>
where
    S: Future<Output = ()>,
    C: Future<Output = ()>,
{
    tokio::select! {
        finished = &mut handle => {
            finished??;
            warn!("Server stopped without a shutdown signal");
            return Ok(());
        }
        _ = shutdown => {}
    }
    close.await;
    handle.await??;
    Ok(())
}

async fn run_stun(config: &AppConfig) -> Result<()> {
    let server = StunServer::bind(StunServerConfig {
        listen_addr: config.listen,
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to start STUN server: {}", e))?;
    let handle = server.spawn();

    info!("STUN server running. Press Ctrl+C to stop.");
    supervise(handle, wait_for_shutdown(), async { server.close() }).await
}

async fn run_turn(config: &AppConfig) -> Result<()> {
    let relay = &config.relay;
    let server_config = TurnServerConfig {
        listen_addr: config.listen,
        relay_ip: relay.bind.ip(),
        relay_port_range: relay.port_range(),
        realm: relay.realm.clone(),
        ..TurnServerConfig::default()
    };
    let auth = Arc::new(StaticCredentials::new(&relay.username, &relay.password));
    let server = TurnServer::bind(server_config, auth)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start TURN server: {}", e))?;
    let handle = server.spawn();

    info!(
        realm = %relay.realm,
        username = %relay.username,
        "TURN server running. Press Ctrl+C to stop."
    );
    supervise(handle, wait_for_shutdown(), server.close()).await
}
