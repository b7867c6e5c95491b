//! ICE peer mode
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


use anyhow::{Context, Result};
use ice_agent::{IceAgent, IceAgentConfig, SessionDescription, TurnServerAddr};
use natkit_config::AppConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// Resolve a `host:port` string to its first address
async fn resolve(target: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("Failed to resolve {}", target))?
        .next()
        .with_context(|| format!("No address found for {}", target))
}

/// Peer token from `NATKIT_SECRET`, else the first non-empty stdin line
async fn read_peer_token(config: &AppConfig) -> Result<String> {
    if let Some(secret) = &config.ice.secret {
        return Ok(secret.clone());
    }

    println!("Paste the peer token and press Enter:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            return Ok(line.to_string());
        }
    }
    anyhow::bail!("stdin closed before a peer token was read")
}

pub async fn run(config: &AppConfig) -> Result<()> {
    let mut agent_config = IceAgentConfig {
        relay_only: config.ice.relay_only,
        ..IceAgentConfig::default()
    };
    if let Some(stun) = &config.ice.stun_server {
        agent_config.stun_server = Some(resolve(stun).await?);
    }
    if let Some(turn) = &config.ice.turn_server {
        agent_config.turn_server = Some(TurnServerAddr {
            addr: resolve(turn).await?,
            username: config.relay.username.clone(),
            password: config.relay.password.clone(),
        });
    }

    let agent = Arc::new(IceAgent::new(agent_config));
    info!(agent_id = %agent.agent_id(), "ICE agent created");

    // Log every state change
    let mut states = agent.subscribe().await;
    let state_task = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            info!(state = ?state, "ICE connection state changed");
        }
    });

    agent
        .gather_candidates()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start gathering: {}", e))?;
    let candidates = agent
        .gathering_complete()
        .await
        .map_err(|e| anyhow::anyhow!("Candidate gathering failed: {}", e))?;
    for candidate in &candidates {
        info!(candidate = %candidate, "Local candidate");
    }

    let token = agent.local_description().await.encode()?;
    println!("Local token (give this to the peer):");
    println!("{}", token);

    let remote = SessionDescription::credentials_only(&read_peer_token(config).await?)?;
    for candidate in remote.candidates.iter().cloned() {
        if let Err(e) = agent.add_remote_candidate(candidate).await {
            warn!(error = %e, "Ignoring remote candidate");
        }
    }

    let connect = async {
        if config.ice.controlling {
            agent.dial(&remote.ufrag, &remote.pwd).await
        } else {
            agent.accept(&remote.ufrag, &remote.pwd).await
        }
    };

    let connected = tokio::select! {
        result = connect => Some(result),
        _ = super::wait_for_shutdown() => None,
    };

    match connected {
        Some(Ok(pair)) => {
            info!(
                local = %pair.local,
                remote = %pair.remote,
                priority = pair.priority,
                "Selected candidate pair"
            );

            let receiver = Arc::clone(&agent);
            let recv_task = tokio::spawn(async move {
                while let Ok(data) = receiver.recv().await {
                    info!(bytes = data.len(), "Datagram received from peer");
                }
            });

            if let Err(e) = agent.send(b"hello from natkit").await {
                warn!(error = %e, "Failed to greet peer");
            }

            info!("ICE peer connected. Press Ctrl+C to stop.");
            super::wait_for_shutdown().await;
            agent.close().await;
            let _ = recv_task.await;
        }
        Some(Err(e)) => {
            error!(error = %e, "ICE connection failed");
            agent.close().await;
        }
        None => agent.close().await,
    }

    let _ = state_task.await;
    Ok(())
}
