//! Integration Tests for ICE agents
//!
//! Two agents on loopback exchange signaling tokens and connect, optionally
//! with live STUN and TURN servers for gathering.

use anyhow::{Context, Result};
use ice_agent::{
    CandidateType, IceAgent, IceAgentConfig, IceConnectionState, IceRole, PairState,
    RetransmitConfig, SessionDescription, TurnServerAddr,
};
use nat_relay::{StaticCredentials, StunServer, StunServerConfig, TurnServer, TurnServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_stream::StreamExt;

fn loopback_config() -> IceAgentConfig {
    IceAgentConfig {
        interfaces: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        connect_timeout: Duration::from_secs(10),
        ..IceAgentConfig::default()
    }
}

/// Gather and return the agent's signaling token
async fn gathered(config: IceAgentConfig) -> Result<(IceAgent, String)> {
    let agent = IceAgent::new(config);
    agent.gather_candidates().await?;
    agent.gathering_complete().await?;
    let token = agent.local_description().await.encode()?;
    Ok((agent, token))
}

/// Feed the peer's token into `agent` and return its credentials
async fn apply_token(agent: &IceAgent, token: &str) -> Result<(String, String)> {
    let remote = SessionDescription::decode(token)?;
    for candidate in remote.candidates {
        agent.add_remote_candidate(candidate).await?;
    }
    Ok((remote.ufrag, remote.pwd))
}

#[tokio::test]
async fn test_agents_connect_through_tokens() -> Result<()> {
    let (alice, alice_token) = gathered(loopback_config()).await?;
    let (bob, bob_token) = gathered(loopback_config()).await?;

    let (bob_ufrag, bob_pwd) = apply_token(&alice, &bob_token).await?;
    let (alice_ufrag, alice_pwd) = apply_token(&bob, &alice_token).await?;

    // One host candidate on each side makes a single pair
    assert_eq!(alice.candidate_pairs().await.len(), 1);
    assert_eq!(bob.candidate_pairs().await.len(), 1);

    let mut alice_states = alice.subscribe().await;
    let (dialed, accepted) = tokio::join!(
        alice.dial(&bob_ufrag, &bob_pwd),
        bob.accept(&alice_ufrag, &alice_pwd)
    );
    let dialed = dialed?;
    let accepted = accepted?;

    assert_eq!(dialed.local.address, accepted.remote.address);
    assert_eq!(dialed.remote.address, accepted.local.address);
    assert_eq!(dialed.local.candidate_type, CandidateType::Host);
    assert_eq!(alice.state(), IceConnectionState::Connected);
    assert_eq!(bob.state(), IceConnectionState::Connected);

    let pairs = alice.candidate_pairs().await;
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].state, PairState::Succeeded);
    assert_eq!(bob.candidate_pairs().await.len(), 1);

    alice.send(b"hello bob").await?;
    let received = timeout(Duration::from_secs(2), bob.recv()).await??;
    assert_eq!(&received[..], b"hello bob");

    bob.send(b"hello alice").await?;
    let received = timeout(Duration::from_secs(2), alice.recv()).await??;
    assert_eq!(&received[..], b"hello alice");

    alice.close().await;
    bob.close().await;

    let mut seen = Vec::new();
    while let Some(state) = alice_states.next().await {
        seen.push(state);
    }
    assert_eq!(seen.first(), Some(&IceConnectionState::New));
    assert_eq!(seen.last(), Some(&IceConnectionState::Closed));
    assert!(seen.contains(&IceConnectionState::Connected));
    Ok(())
}

#[tokio::test]
async fn test_role_conflict_converges() -> Result<()> {
    let (alice, alice_token) = gathered(loopback_config()).await?;
    let (bob, bob_token) = gathered(loopback_config()).await?;

    let (bob_ufrag, bob_pwd) = apply_token(&alice, &bob_token).await?;
    let (alice_ufrag, alice_pwd) = apply_token(&bob, &alice_token).await?;

    // Both sides believe they are controlling
    let (a, b) = tokio::join!(
        alice.dial(&bob_ufrag, &bob_pwd),
        bob.dial(&alice_ufrag, &alice_pwd)
    );
    let a = a?;
    let b = b?;

    assert_ne!(alice.role(), bob.role());
    assert!([alice.role(), bob.role()].contains(&IceRole::Controlling));
    assert_eq!(a.local.address, b.remote.address);
    assert_eq!(a.remote.address, b.local.address);

    alice.close().await;
    bob.close().await;
    Ok(())
}

#[tokio::test]
async fn test_credentials_token_round_trip() -> Result<()> {
    let (alice, alice_token) = gathered(loopback_config()).await?;
    let short = SessionDescription::decode(&alice_token)?.credentials_token();

    let remote = SessionDescription::credentials_only(&short)?;
    assert_eq!((remote.ufrag, remote.pwd), alice.local_credentials());
    assert!(remote.candidates.is_empty());

    let full = SessionDescription::credentials_only(&alice_token)?;
    assert_eq!(full.candidates, alice.local_candidates().await);

    assert!(SessionDescription::decode("!!not a token!!").is_err());
    alice.close().await;
    Ok(())
}

#[tokio::test]
async fn test_gather_skips_reflexive_equal_to_host() -> Result<()> {
    let stun = StunServer::bind(StunServerConfig {
        listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
    })
    .await?;
    stun.spawn();

    let (agent, _) = gathered(IceAgentConfig {
        stun_server: Some(stun.local_addr()?),
        ..loopback_config()
    })
    .await?;

    // On loopback the mapped address is the host address itself
    let candidates = agent.local_candidates().await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_type, CandidateType::Host);

    agent.close().await;
    stun.close();
    Ok(())
}

#[tokio::test]
async fn test_gather_relayed_candidate_and_release() -> Result<()> {
    let turn = TurnServer::bind(
        TurnServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..TurnServerConfig::default()
        },
        Arc::new(StaticCredentials::new("agent", "relay-secret")),
    )
    .await?;
    turn.spawn();

    let (agent, _) = gathered(IceAgentConfig {
        turn_server: Some(TurnServerAddr {
            addr: turn.local_addr()?,
            username: "agent".to_string(),
            password: "relay-secret".to_string(),
        }),
        ..loopback_config()
    })
    .await?;

    let candidates = agent.local_candidates().await;
    let relayed = candidates
        .iter()
        .find(|c| c.candidate_type == CandidateType::Relayed)
        .context("no relayed candidate")?;
    let host = candidates
        .iter()
        .find(|c| c.candidate_type == CandidateType::Host)
        .context("no host candidate")?;
    assert_eq!(relayed.related_address, Some(host.address));
    assert!(relayed.priority < host.priority);
    assert_eq!(turn.stats().await.active_allocations, 1);

    // Closing the agent gives the allocation back
    agent.close().await;
    let released = timeout(Duration::from_secs(2), async {
        while turn.stats().await.active_allocations > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "allocation still active after close");

    turn.close().await;
    Ok(())
}

#[tokio::test]
async fn test_wrong_turn_password_still_gathers_host() -> Result<()> {
    let turn = TurnServer::bind(
        TurnServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..TurnServerConfig::default()
        },
        Arc::new(StaticCredentials::new("agent", "relay-secret")),
    )
    .await?;
    turn.spawn();

    let (agent, _) = gathered(IceAgentConfig {
        turn_server: Some(TurnServerAddr {
            addr: turn.local_addr()?,
            username: "agent".to_string(),
            password: "guess".to_string(),
        }),
        ..loopback_config()
    })
    .await?;

    let candidates = agent.local_candidates().await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_type, CandidateType::Host);
    assert_eq!(turn.stats().await.active_allocations, 0);

    agent.close().await;
    turn.close().await;
    Ok(())
}

#[tokio::test]
async fn test_agents_connect_through_turn_relay() -> Result<()> {
    let turn = TurnServer::bind(
        TurnServerConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..TurnServerConfig::default()
        },
        Arc::new(StaticCredentials::new("agent", "relay-secret")),
    )
    .await?;
    turn.spawn();

    // Alice offers nothing but her relayed address
    let (alice, alice_token) = gathered(IceAgentConfig {
        turn_server: Some(TurnServerAddr {
            addr: turn.local_addr()?,
            username: "agent".to_string(),
            password: "relay-secret".to_string(),
        }),
        relay_only: true,
        ..loopback_config()
    })
    .await?;
    let (bob, bob_token) = gathered(loopback_config()).await?;

    let offered = SessionDescription::decode(&alice_token)?.candidates;
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].candidate_type, CandidateType::Relayed);
    let relayed = offered[0].address;

    let (bob_ufrag, bob_pwd) = apply_token(&alice, &bob_token).await?;
    let (alice_ufrag, alice_pwd) = apply_token(&bob, &alice_token).await?;

    let (dialed, accepted) = tokio::join!(
        alice.dial(&bob_ufrag, &bob_pwd),
        bob.accept(&alice_ufrag, &alice_pwd)
    );
    let dialed = dialed?;
    let accepted = accepted?;

    assert_eq!(dialed.local.candidate_type, CandidateType::Relayed);
    assert_eq!(dialed.local.address, relayed);
    assert_eq!(accepted.remote.address, relayed);
    assert_eq!(dialed.remote.address, accepted.local.address);
    assert!(turn.stats().await.permissions >= 1);

    alice.send(b"through the relay").await?;
    let received = timeout(Duration::from_secs(2), bob.recv()).await??;
    assert_eq!(&received[..], b"through the relay");

    bob.send(b"and back").await?;
    let received = timeout(Duration::from_secs(2), alice.recv()).await??;
    assert_eq!(&received[..], b"and back");

    alice.close().await;
    bob.close().await;
    assert_eq!(turn.stats().await.active_allocations, 0);
    turn.close().await;
    Ok(())
}

#[tokio::test]
async fn test_lost_consent_disconnects_then_fails() -> Result<()> {
    let (alice, alice_token) = gathered(IceAgentConfig {
        consent_interval: Duration::from_millis(200),
        consent_max_failures: 2,
        retransmit: RetransmitConfig::new(1, 50, 100, 2.0),
        ..loopback_config()
    })
    .await?;
    let (bob, bob_token) = gathered(loopback_config()).await?;

    let (bob_ufrag, bob_pwd) = apply_token(&alice, &bob_token).await?;
    let (alice_ufrag, alice_pwd) = apply_token(&bob, &alice_token).await?;

    let mut alice_states = alice.subscribe().await;
    let (dialed, accepted) = tokio::join!(
        alice.dial(&bob_ufrag, &bob_pwd),
        bob.accept(&alice_ufrag, &alice_pwd)
    );
    dialed?;
    accepted?;

    // Bob goes away and stops answering consent checks
    bob.close().await;

    let mut seen = Vec::new();
    let failed = timeout(Duration::from_secs(10), async {
        while let Some(state) = alice_states.next().await {
            seen.push(state);
            if state == IceConnectionState::Failed {
                break;
            }
        }
    })
    .await;
    assert!(failed.is_ok(), "never failed, states so far: {:?}", seen);

    let connected = seen
        .iter()
        .position(|s| *s == IceConnectionState::Connected)
        .context("never connected")?;
    let after: Vec<IceConnectionState> = seen[connected..].to_vec();
    assert_eq!(
        after,
        vec![
            IceConnectionState::Connected,
            IceConnectionState::Disconnected,
            IceConnectionState::Checking,
            IceConnectionState::Failed,
        ]
    );
    assert!(alice.selected_pair().await.is_none());

    alice.close().await;
    Ok(())
}
