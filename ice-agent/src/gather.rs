//! Candidate gathering: host, server reflexive and relayed
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


use crate::agent::IceAgentConfig;
use crate::candidate::{Candidate, CandidateType, DEFAULT_LOCAL_PREFERENCE};
use crate::error::{IceError, IceResult};
use crate::transaction::TransactionMap;
use crate::transport::{HostSocket, Inbound, RelayBinding, Route};
use crate::turn_client::TurnClient;
use futures::future::join_all;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use stun_proto::{Message, Method};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channels the gathered sockets feed into
pub(crate) struct GatherContext {
    pub transactions: Arc<TransactionMap>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub cancel: CancellationToken,
}

/// Everything produced by one gathering run
pub(crate) struct Gathered {
    pub host_sockets: Vec<Arc<HostSocket>>,
    pub candidates: Vec<Candidate>,
    pub turn: Option<Arc<TurnClient>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Interface addresses to bind host candidates on.
///
/// Configured addresses win; otherwise every non-loopback IPv4 interface.
pub fn interface_addresses(configured: &[IpAddr]) -> Vec<IpAddr> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            let mut addresses: Vec<IpAddr> = interfaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| iface.ip())
                .filter(IpAddr::is_ipv4)
                .collect();
            addresses.dedup();
            addresses
        }
        Err(e) => {
            warn!(error = %e, "Failed to enumerate network interfaces");
            Vec::new()
        }
    }
}

/// Gather all candidates.
///
/// Fails only when no host candidate can be created; STUN and TURN
/// failures just leave their candidates out. With `relay_only` the relayed
/// candidate is the only one kept and gathering fails without it.
pub(crate) async fn gather(config: &IceAgentConfig, ctx: &GatherContext) -> IceResult<Gathered> {
    let mut gathered = Gathered {
        host_sockets: Vec::new(),
        candidates: Vec::new(),
        turn: None,
        tasks: Vec::new(),
    };

    for (index, ip) in interface_addresses(&config.interfaces).into_iter().enumerate() {
        let host = match HostSocket::bind(SocketAddr::new(ip, 0)).await {
            Ok(host) => host,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to bind host candidate");
                continue;
            }
        };
        let preference = DEFAULT_LOCAL_PREFERENCE.saturating_sub(index as u16);
        let candidate = Candidate::new_host(config.component, host.addr, preference);
        debug!(candidate = %candidate, "Gathered host candidate");

        gathered.tasks.push(host.spawn_read_loop(
            Arc::clone(&ctx.transactions),
            ctx.inbound.clone(),
            ctx.cancel.clone(),
        ));
        gathered.candidates.push(candidate);
        gathered.host_sockets.push(host);
    }

    if gathered.host_sockets.is_empty() {
        return Err(IceError::Gather("no host candidate could be created".to_string()));
    }

    let reflexive = join_all(
        gathered
            .host_sockets
            .iter()
            .zip(gathered.candidates.clone())
            .filter_map(|(host, candidate)| {
                let server = config.stun_server?;
                (server.is_ipv4() == host.addr.is_ipv4())
                    .then(|| server_reflexive(Arc::clone(host), candidate, server, config, ctx))
            }),
    );
    let relayed = relayed(&gathered.host_sockets, config, ctx);
    let (reflexive, relayed) = tokio::join!(reflexive, relayed);

    for candidate in reflexive.into_iter().flatten() {
        if gathered.candidates.iter().any(|c| c.address == candidate.address) {
            continue;
        }
        gathered.candidates.push(candidate);
    }
    if let Some((turn, candidate)) = relayed {
        gathered.tasks.push(turn.spawn_refresher(ctx.cancel.clone()));
        gathered.candidates.push(candidate);
        gathered.turn = Some(turn);
    }
    if config.relay_only {
        gathered
            .candidates
            .retain(|c| c.candidate_type == CandidateType::Relayed);
        if gathered.candidates.is_empty() {
            for task in gathered.tasks.drain(..) {
                task.abort();
            }
            return Err(IceError::Gather(
                "relay-only gathering produced no relayed candidate".to_string(),
            ));
        }
    }

    info!(
        candidates = gathered.candidates.len(),
        host_sockets = gathered.host_sockets.len(),
        relayed = gathered.turn.is_some(),
        "Candidate gathering complete"
    );
    Ok(gathered)
}

/// Ask the STUN server for the public address of `host`
async fn server_reflexive(
    host: Arc<HostSocket>,
    base: Candidate,
    server: SocketAddr,
    config: &IceAgentConfig,
    ctx: &GatherContext,
) -> Option<Candidate> {
    let request = Message::request(Method::Binding);
    let response = ctx
        .transactions
        .transact(
            &Route::Direct(Arc::clone(&host.socket)),
            &request.encode_with(None, true),
            request.transaction_id,
            server,
            &config.retransmit,
        )
        .await;

    let mapped = match response {
        Ok(response) => response.message.mapped_address(),
        Err(e) => {
            warn!(server = %server, base = %host.addr, error = %e, "STUN binding failed");
            return None;
        }
    };
    let Some(mapped) = mapped else {
        warn!(server = %server, "Binding response without mapped address");
        return None;
    };
    if mapped == host.addr {
        debug!(base = %host.addr, "Host candidate is not behind a NAT");
        return None;
    }

    let candidate = Candidate::new_server_reflexive(
        config.component,
        mapped,
        host.addr,
        base.local_preference(),
    );
    debug!(candidate = %candidate, "Gathered server reflexive candidate");
    Some(candidate)
}

/// Allocate on the TURN server through the first host socket of its family
async fn relayed(
    hosts: &[Arc<HostSocket>],
    config: &IceAgentConfig,
    ctx: &GatherContext,
) -> Option<(Arc<TurnClient>, Candidate)> {
    let server = config.turn_server.as_ref()?;
    let host = hosts
        .iter()
        .find(|host| host.addr.is_ipv4() == server.addr.is_ipv4())?;

    let turn = match TurnClient::allocate(
        Arc::clone(host),
        server,
        Arc::clone(&ctx.transactions),
        config.retransmit.clone(),
    )
    .await
    {
        Ok(turn) => turn,
        Err(e) => {
            warn!(server = %server.addr, error = %e, "TURN allocation failed");
            return None;
        }
    };

    host.set_relay(RelayBinding {
        server: server.addr,
        relayed: turn.relayed_addr(),
    })
    .await;

    let candidate = Candidate::new_relayed(
        config.component,
        turn.relayed_addr(),
        turn.mapped_addr(),
        DEFAULT_LOCAL_PREFERENCE,
    );
    debug!(candidate = %candidate, "Gathered relayed candidate");
    Some((turn, candidate))
}
