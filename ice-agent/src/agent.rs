//! ICE agent (RFC 8445)
//!
//! Gathers local candidates, runs connectivity checks against the remote
//! candidates learned over signaling, selects a pair and keeps consent on
//! it. One mutex guards the check list; a scheduler task dispatches checks
//! and each check runs as its own task.
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
use crate::checklist::{CandidatePair, CheckList, PairId, PairState};
use crate::error::{IceError, IceResult};
use crate::gather::{gather, GatherContext};
use crate::signaling::SessionDescription;
use crate::transaction::{RetransmitConfig, StunResponse, TransactionMap};
use crate::transport::{HostSocket, Inbound, Route};
use crate::turn_client::{TurnClient, TurnServerAddr};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stun_proto::{
    short_term_key, verify_integrity, Attribute, ErrorCode, Message, MessageClass, Method,
    TransactionId,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;
const RECV_QUEUE: usize = 1024;

/// ICE agent configuration
#[derive(Debug, Clone)]
pub struct IceAgentConfig {
    /// Interface addresses for host candidates; empty means discover
    pub interfaces: Vec<IpAddr>,
    /// STUN server for server reflexive candidates
    pub stun_server: Option<SocketAddr>,
    /// TURN server for a relayed candidate
    pub turn_server: Option<TurnServerAddr>,
    /// Offer and check only the relayed candidate; host sockets just carry
    /// TURN traffic
    pub relay_only: bool,
    /// Component ID of every candidate
    pub component: u16,
    /// Pace of the check scheduler
    pub check_interval: Duration,
    /// Checks allowed in flight at once
    pub max_in_flight: usize,
    /// Overall limit for dial/accept
    pub connect_timeout: Duration,
    /// Consent freshness check interval
    pub consent_interval: Duration,
    /// Unanswered consent checks before Disconnected
    pub consent_max_failures: u32,
    /// Retransmission schedule of every STUN transaction
    pub retransmit: RetransmitConfig,
}

impl Default for IceAgentConfig {
    fn default() -> Self {
        IceAgentConfig {
            interfaces: Vec::new(),
            stun_server: None,
            turn_server: None,
            relay_only: false,
            component: 1,
            check_interval: Duration::from_millis(50),
            max_in_flight: 5,
            connect_timeout: Duration::from_secs(30),
            consent_interval: Duration::from_secs(5),
            consent_max_failures: 3,
            retransmit: RetransmitConfig::default(),
        }
    }
}

/// ICE role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Gathering,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
enum GatherStatus {
    Idle,
    Running,
    Done,
    Failed(String),
}

/// Check list and everything the checks need, under one lock
struct Session {
    role: IceRole,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    checklist: CheckList,
    /// Local candidate address -> how to send from it
    routes: HashMap<SocketAddr, Route>,
    host_sockets: Vec<Arc<HostSocket>>,
    turn: Option<Arc<TurnClient>>,
    in_flight: HashMap<PairId, (JoinHandle<()>, TransactionId)>,
    selected: Option<CandidatePair>,
    checking_started: bool,
}

impl Session {
    fn pair_up(&mut self) {
        self.checklist
            .form_pairs(&self.local_candidates, &self.remote_candidates);
        if self.checking_started {
            self.checklist.initialize_states();
        }
    }
}

struct StateLog {
    history: Vec<IceConnectionState>,
    subscribers: Vec<mpsc::UnboundedSender<IceConnectionState>>,
}

/// A Binding request ready to go out on a pair
struct PreparedCheck {
    pair_id: PairId,
    transaction_id: TransactionId,
    raw: Bytes,
    route: Route,
    remote: SocketAddr,
    key: Vec<u8>,
    role: IceRole,
    nominate: bool,
}

struct AgentInner {
    id: Uuid,
    config: IceAgentConfig,
    local_ufrag: String,
    local_pwd: String,
    tie_breaker: u64,
    controlling: AtomicBool,
    session: Mutex<Session>,
    transactions: Arc<TransactionMap>,
    state_tx: watch::Sender<IceConnectionState>,
    state_log: Mutex<StateLog>,
    gather_tx: watch::Sender<GatherStatus>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    recv_tx: mpsc::Sender<Bytes>,
    recv_rx: Mutex<mpsc::Receiver<Bytes>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    consent_started: AtomicBool,
    cancel: CancellationToken,
}

fn random_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// ICE agent
pub struct IceAgent {
    inner: Arc<AgentInner>,
}

impl IceAgent {
    /// Create an agent with fresh credentials and tie-breaker
    pub fn new(config: IceAgentConfig) -> Self {
        let (state_tx, _) = watch::channel(IceConnectionState::New);
        let (gather_tx, _) = watch::channel(GatherStatus::Idle);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);

        let inner = AgentInner {
            id: Uuid::new_v4(),
            local_ufrag: random_credential(UFRAG_LEN),
            local_pwd: random_credential(PWD_LEN),
            tie_breaker: rand::random(),
            controlling: AtomicBool::new(false),
            session: Mutex::new(Session {
                role: IceRole::Controlled,
                remote_ufrag: None,
                remote_pwd: None,
                local_candidates: Vec::new(),
                remote_candidates: Vec::new(),
                checklist: CheckList::new(false),
                routes: HashMap::new(),
                host_sockets: Vec::new(),
                turn: None,
                in_flight: HashMap::new(),
                selected: None,
                checking_started: false,
            }),
            transactions: Arc::new(TransactionMap::new()),
            state_tx,
            state_log: Mutex::new(StateLog {
                history: vec![IceConnectionState::New],
                subscribers: Vec::new(),
            }),
            gather_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            tasks: Mutex::new(Vec::new()),
            consent_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            config,
        };
        info!(agent_id = %inner.id, ufrag = %inner.local_ufrag, "ICE agent created");
        IceAgent {
            inner: Arc::new(inner),
        }
    }

    pub fn agent_id(&self) -> Uuid {
        self.inner.id
    }

    /// Local (ufrag, pwd)
    pub fn local_credentials(&self) -> (String, String) {
        (self.inner.local_ufrag.clone(), self.inner.local_pwd.clone())
    }

    pub fn state(&self) -> IceConnectionState {
        self.inner.state()
    }

    pub fn role(&self) -> IceRole {
        if self.inner.controlling.load(Ordering::SeqCst) {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        }
    }

    /// Candidates gathered so far
    pub async fn local_candidates(&self) -> Vec<Candidate> {
        self.inner.session.lock().await.local_candidates.clone()
    }

    /// Credentials and candidates to hand to the peer
    pub async fn local_description(&self) -> SessionDescription {
        SessionDescription {
            ufrag: self.inner.local_ufrag.clone(),
            pwd: self.inner.local_pwd.clone(),
            candidates: self.local_candidates().await,
        }
    }

    /// Start gathering in the background
    pub async fn gather_candidates(&self) -> IceResult<()> {
        let inner = &self.inner;
        let state = inner.state();
        if state != IceConnectionState::New {
            return Err(IceError::InvalidState(format!(
                "cannot gather candidates in state {:?}",
                state
            )));
        }
        let Some(inbound_rx) = inner.inbound_rx.lock().await.take() else {
            return Err(IceError::InvalidState("gathering already started".to_string()));
        };

        inner.gather_tx.send_replace(GatherStatus::Running);
        inner.transition(IceConnectionState::Gathering).await;

        let dispatcher = tokio::spawn(Arc::clone(inner).dispatch_inbound(inbound_rx));
        let gatherer = tokio::spawn(Arc::clone(inner).run_gathering());
        inner.tasks.lock().await.extend([dispatcher, gatherer]);
        Ok(())
    }

    /// Wait for gathering to finish and return the local candidates
    pub async fn gathering_complete(&self) -> IceResult<Vec<Candidate>> {
        let mut status_rx = self.inner.gather_tx.subscribe();
        let status = match status_rx
            .wait_for(|status| !matches!(status, GatherStatus::Running))
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => GatherStatus::Failed("agent dropped".to_string()),
        };
        match status {
            GatherStatus::Done => Ok(self.local_candidates().await),
            GatherStatus::Failed(reason) => Err(IceError::Gather(reason)),
            GatherStatus::Idle | GatherStatus::Running => Err(IceError::InvalidState(
                "gathering has not started".to_string(),
            )),
        }
    }

    /// Set the peer's credentials; rejected once checks are running
    pub async fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> IceResult<()> {
        let mut session = self.inner.session.lock().await;
        if session.checking_started {
            return Err(IceError::InvalidState(
                "connectivity checks already started".to_string(),
            ));
        }
        session.remote_ufrag = Some(ufrag.to_string());
        session.remote_pwd = Some(pwd.to_string());
        Ok(())
    }

    /// Add a candidate learned over signaling
    pub async fn add_remote_candidate(&self, candidate: Candidate) -> IceResult<()> {
        if self.state() == IceConnectionState::Closed {
            return Err(IceError::Closed);
        }
        let mut session = self.inner.session.lock().await;
        if session
            .remote_candidates
            .iter()
            .any(|c| c.address == candidate.address)
        {
            return Ok(());
        }
        debug!(agent_id = %self.inner.id, candidate = %candidate, "Remote candidate added");
        session.remote_candidates.push(candidate);
        session.pair_up();
        Ok(())
    }

    /// Connect as the controlling agent
    pub async fn dial(&self, remote_ufrag: &str, remote_pwd: &str) -> IceResult<CandidatePair> {
        self.connect(IceRole::Controlling, remote_ufrag, remote_pwd)
            .await
    }

    /// Connect as the controlled agent
    pub async fn accept(&self, remote_ufrag: &str, remote_pwd: &str) -> IceResult<CandidatePair> {
        self.connect(IceRole::Controlled, remote_ufrag, remote_pwd)
            .await
    }

    pub async fn selected_pair(&self) -> Option<CandidatePair> {
        self.inner.session.lock().await.selected.clone()
    }

    /// Snapshot of the checklist in priority order
    pub async fn candidate_pairs(&self) -> Vec<CandidatePair> {
        self.inner.session.lock().await.checklist.pairs().to_vec()
    }

    /// State transitions: full history first, then live
    pub async fn subscribe(&self) -> UnboundedReceiverStream<IceConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = self.inner.state_log.lock().await;
        for state in &log.history {
            let _ = tx.send(*state);
        }
        if self.inner.state() != IceConnectionState::Closed {
            log.subscribers.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Send a datagram over the selected pair
    pub async fn send(&self, data: &[u8]) -> IceResult<()> {
        let (route, remote) = {
            let session = self.inner.session.lock().await;
            let pair = session
                .selected
                .as_ref()
                .ok_or_else(|| IceError::InvalidState("no selected pair".to_string()))?;
            let route = session
                .routes
                .get(&pair.local.address)
                .cloned()
                .ok_or_else(|| IceError::InvalidState("selected pair has no route".to_string()))?;
            (route, pair.remote.address)
        };
        route.send_to(data, remote).await
    }

    /// Next datagram that is not a STUN message
    pub async fn recv(&self) -> IceResult<Bytes> {
        let mut rx = self.inner.recv_rx.lock().await;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(IceError::Closed),
            data = rx.recv() => data.ok_or(IceError::Closed),
        }
    }

    /// Stop every task, release the TURN allocation and drop the sockets
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state() == IceConnectionState::Closed {
            return;
        }

        let turn = inner.session.lock().await.turn.take();
        if let Some(turn) = turn {
            turn.release().await;
        }

        inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        inner.transactions.fail_all().await;

        {
            let mut session = inner.session.lock().await;
            for (_, (handle, _)) in session.in_flight.drain() {
                handle.abort();
            }
            session.routes.clear();
            session.host_sockets.clear();
            session.selected = None;
        }
        inner.gather_tx.send_modify(|status| {
            if matches!(status, GatherStatus::Running) {
                *status = GatherStatus::Failed("agent closed".to_string());
            }
        });

        inner.transition(IceConnectionState::Closed).await;
        info!(agent_id = %inner.id, "ICE agent closed");
    }

    async fn connect(
        &self,
        role: IceRole,
        remote_ufrag: &str,
        remote_pwd: &str,
    ) -> IceResult<CandidatePair> {
        let inner = &self.inner;
        match inner.state() {
            IceConnectionState::New => {
                return Err(IceError::InvalidState(
                    "gather candidates before connecting".to_string(),
                ))
            }
            IceConnectionState::Closed => return Err(IceError::Closed),
            IceConnectionState::Failed => return Err(IceError::ConnectionFailed),
            _ => {}
        }

        self.set_remote_credentials(remote_ufrag, remote_pwd).await?;
        self.gathering_complete().await?;

        {
            let mut guard = inner.session.lock().await;
            let session = &mut *guard;
            if session.checking_started {
                return Err(IceError::InvalidState(
                    "connectivity checks already started".to_string(),
                ));
            }
            session.checking_started = true;
            inner.set_role(session, role);
            session.pair_up();
            info!(
                agent_id = %inner.id,
                role = ?role,
                pairs = session.checklist.pairs().len(),
                "Starting connectivity checks"
            );
        }

        inner.transition(IceConnectionState::Checking).await;
        let scheduler = tokio::spawn(Arc::clone(inner).run_scheduler());
        inner.tasks.lock().await.push(scheduler);

        let mut states = inner.state_tx.subscribe();
        let outcome = match timeout(
            inner.config.connect_timeout,
            states.wait_for(|state| {
                matches!(
                    state,
                    IceConnectionState::Connected
                        | IceConnectionState::Failed
                        | IceConnectionState::Closed
                )
            }),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => Some(IceConnectionState::Closed),
            Err(_) => None,
        };

        match outcome {
            Some(IceConnectionState::Connected) => self.selected_pair().await.ok_or_else(|| {
                IceError::InvalidState("connected without a selected pair".to_string())
            }),
            Some(IceConnectionState::Closed) => Err(IceError::Closed),
            Some(_) => Err(IceError::ConnectionFailed),
            None => {
                warn!(
                    agent_id = %inner.id,
                    timeout_secs = inner.config.connect_timeout.as_secs(),
                    "Connectivity checks timed out"
                );
                inner.transition(IceConnectionState::Failed).await;
                Err(IceError::Timeout(format!(
                    "not connected after {:?}",
                    inner.config.connect_timeout
                )))
            }
        }
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl AgentInner {
    fn state(&self) -> IceConnectionState {
        *self.state_tx.borrow()
    }

    /// Apply a state change; false if it is a no-op or not allowed
    async fn transition(&self, to: IceConnectionState) -> bool {
        let mut log = self.state_log.lock().await;
        let from = self.state();
        if from == to
            || from == IceConnectionState::Closed
            || (from == IceConnectionState::Failed && to != IceConnectionState::Closed)
        {
            return false;
        }
        log.history.push(to);
        log.subscribers.retain(|tx| tx.send(to).is_ok());
        if to == IceConnectionState::Closed {
            log.subscribers.clear();
        }
        self.state_tx.send_replace(to);
        info!(agent_id = %self.id, from = ?from, to = ?to, "ICE connection state changed");
        true
    }

    fn set_role(&self, session: &mut Session, role: IceRole) {
        if session.role == role {
            return;
        }
        session.role = role;
        self.controlling
            .store(role == IceRole::Controlling, Ordering::SeqCst);
        session.checklist.set_role(role == IceRole::Controlling);
    }

    fn switch_role(&self, session: &mut Session, reason: &str) {
        let role = match session.role {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        };
        info!(agent_id = %self.id, role = ?role, reason, "Switching ICE role");
        self.set_role(session, role);
    }

    async fn run_gathering(self: Arc<Self>) {
        let ctx = GatherContext {
            transactions: Arc::clone(&self.transactions),
            inbound: self.inbound_tx.clone(),
            cancel: self.cancel.clone(),
        };
        match gather(&self.config, &ctx).await {
            Ok(gathered) => {
                self.tasks.lock().await.extend(gathered.tasks);
                {
                    let mut session = self.session.lock().await;
                    if !self.config.relay_only {
                        for host in &gathered.host_sockets {
                            session
                                .routes
                                .insert(host.addr, Route::Direct(Arc::clone(&host.socket)));
                        }
                    }
                    if let Some(turn) = &gathered.turn {
                        session
                            .routes
                            .insert(turn.relayed_addr(), Route::Relayed(Arc::clone(turn)));
                    }
                    session.host_sockets = gathered.host_sockets;
                    session.turn = gathered.turn;
                    session.local_candidates = gathered.candidates;
                    session.pair_up();
                }
                self.gather_tx.send_replace(GatherStatus::Done);
            }
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "Candidate gathering failed");
                self.gather_tx
                    .send_replace(GatherStatus::Failed(e.to_string()));
                self.transition(IceConnectionState::Failed).await;
            }
        }
    }

    async fn dispatch_inbound(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => break,
                packet = inbound.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            match &packet.message {
                Some(message) if message.is(Method::Binding, MessageClass::Request) => {
                    self.handle_binding_request(&packet, message).await;
                }
                Some(message) => {
                    debug!(
                        from = %packet.from,
                        message_type = ?message.message_type,
                        "Ignoring STUN message"
                    );
                }
                None => {
                    if self.recv_tx.try_send(packet.raw).is_err() {
                        debug!(from = %packet.from, "Receive queue full, dropping datagram");
                    }
                }
            }
        }
    }

    async fn route_for(&self, local: SocketAddr) -> Option<Route> {
        self.session.lock().await.routes.get(&local).cloned()
    }

    async fn send_via(&self, route: &Route, dest: SocketAddr, data: &[u8]) {
        if let Err(e) = route.send_to(data, dest).await {
            debug!(dest = %dest, error = %e, "Failed to send check response");
        }
    }

    async fn reject(&self, packet: &Inbound, request: &Message, code: u16) {
        debug!(from = %packet.from, code, "Rejecting connectivity check");
        let response = request
            .error_response(ErrorCode::new(code))
            .encode_with(None, true);
        if let Some(route) = self.route_for(packet.local).await {
            self.send_via(&route, packet.from, &response).await;
        }
    }

    /// Answer an incoming connectivity check
    async fn handle_binding_request(self: &Arc<Self>, packet: &Inbound, request: &Message) {
        let Some(username) = request.username() else {
            self.reject(packet, request, ErrorCode::BAD_REQUEST).await;
            return;
        };
        if !request.has_integrity() {
            self.reject(packet, request, ErrorCode::BAD_REQUEST).await;
            return;
        }
        let target = username.split(':').next().unwrap_or_default();
        let key = short_term_key(&self.local_pwd);
        if target != self.local_ufrag || verify_integrity(&packet.raw, &key).is_err() {
            self.reject(packet, request, ErrorCode::UNAUTHORIZED).await;
            return;
        }

        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        let Some(route) = session.routes.get(&packet.local).cloned() else {
            debug!(local = %packet.local, "Check arrived on an address with no local candidate");
            return;
        };

        // The role is only settled once dial or accept has run
        let role = session.role;
        let conflict = match role {
            _ if !session.checking_started => false,
            IceRole::Controlling => match request.ice_controlling() {
                Some(remote) if self.tie_breaker >= remote => true,
                Some(_) => {
                    self.switch_role(session, "peer is controlling with a higher tie-breaker");
                    false
                }
                None => false,
            },
            IceRole::Controlled => match request.ice_controlled() {
                Some(remote) if self.tie_breaker >= remote => {
                    self.switch_role(session, "peer is controlled with a lower tie-breaker");
                    false
                }
                Some(_) => true,
                None => false,
            },
        };
        if conflict {
            drop(guard);
            debug!(from = %packet.from, "Answering role conflict");
            let response = request
                .error_response(ErrorCode::new(ErrorCode::ROLE_CONFLICT))
                .encode_with(Some(&key), true);
            self.send_via(&route, packet.from, &response).await;
            return;
        }

        if !session
            .remote_candidates
            .iter()
            .any(|c| c.address == packet.from)
        {
            let component = session
                .local_candidates
                .iter()
                .find(|c| c.address == packet.local)
                .map_or(self.config.component, |c| c.component);
            let candidate =
                Candidate::new_peer_reflexive(component, packet.from, request.priority().unwrap_or(0));
            info!(agent_id = %self.id, candidate = %candidate, "Learned peer reflexive candidate");
            session.remote_candidates.push(candidate);
            session.pair_up();
        }

        if let Some(pair_id) = session.checklist.find(packet.local, packet.from) {
            let controlled = session.role == IceRole::Controlled;
            let mut select = false;
            if let Some(pair) = session.checklist.get_mut(pair_id) {
                if matches!(pair.state, PairState::Frozen | PairState::Failed) {
                    pair.state = PairState::Waiting;
                }
                if request.use_candidate() && controlled {
                    pair.nominated = true;
                    select = pair.state == PairState::Succeeded;
                }
            }
            if select {
                self.select_pair(session, pair_id).await;
            }
        }

        let response = request
            .success_response()
            .with(Attribute::XorMappedAddress(packet.from))
            .encode_with(Some(&key), true);
        drop(guard);
        self.send_via(&route, packet.from, &response).await;
    }

    fn prepare_check(
        &self,
        session: &Session,
        pair: &CandidatePair,
        nominate: bool,
    ) -> Option<PreparedCheck> {
        let remote_ufrag = session.remote_ufrag.as_deref()?;
        let remote_pwd = session.remote_pwd.as_deref()?;
        let route = session.routes.get(&pair.local.address)?.clone();

        let mut request = Message::request(Method::Binding)
            .with(Attribute::Username(format!(
                "{}:{}",
                remote_ufrag, self.local_ufrag
            )))
            .with(Attribute::Priority(pair.local.peer_reflexive_priority()));
        request.add(match session.role {
            IceRole::Controlling => Attribute::IceControlling(self.tie_breaker),
            IceRole::Controlled => Attribute::IceControlled(self.tie_breaker),
        });
        if nominate {
            request.add(Attribute::UseCandidate);
        }

        let key = short_term_key(remote_pwd);
        Some(PreparedCheck {
            pair_id: pair.id,
            transaction_id: request.transaction_id,
            raw: request.encode_with(Some(&key), true),
            route,
            remote: pair.remote.address,
            key,
            role: session.role,
            nominate,
        })
    }

    async fn run_scheduler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.schedule_next().await,
            }
        }
    }

    /// Dispatch the next Waiting pair if the in-flight budget allows
    async fn schedule_next(self: &Arc<Self>) {
        if self.state() != IceConnectionState::Checking {
            return;
        }
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        if session.in_flight.len() >= self.config.max_in_flight {
            return;
        }

        let next = session
            .checklist
            .next_waiting()
            .or_else(|| session.checklist.unfreeze_highest());
        let Some(pair_id) = next else {
            let failed = session.in_flight.is_empty() && session.checklist.all_failed();
            drop(guard);
            if failed {
                self.fail_checks().await;
            }
            return;
        };
        let Some(pair) = session.checklist.get(pair_id).cloned() else {
            return;
        };

        let nominate = session.role == IceRole::Controlling;
        let Some(check) = self.prepare_check(session, &pair, nominate) else {
            debug!(pair_id, local = %pair.local.address, "No route or credentials for pair");
            session.checklist.set_state(pair_id, PairState::Failed);
            return;
        };
        session.checklist.set_state(pair_id, PairState::InProgress);
        debug!(
            agent_id = %self.id,
            pair_id,
            local = %pair.local.address,
            remote = %pair.remote.address,
            nominate,
            "Starting connectivity check"
        );

        let transaction_id = check.transaction_id;
        let handle = tokio::spawn(Arc::clone(self).run_check(check));
        session.in_flight.insert(pair_id, (handle, transaction_id));
    }

    async fn run_check(self: Arc<Self>, check: PreparedCheck) {
        let result = self
            .transactions
            .transact(
                &check.route,
                &check.raw,
                check.transaction_id,
                check.remote,
                &self.config.retransmit,
            )
            .await;
        let outcome = check_outcome(&check, result);

        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        session.in_flight.remove(&check.pair_id);

        match outcome {
            Ok(()) => {
                session
                    .checklist
                    .set_state(check.pair_id, PairState::Succeeded);
                session.checklist.unfreeze_foundation(check.pair_id);
                let nominated = match session.checklist.get_mut(check.pair_id) {
                    Some(pair) => {
                        pair.nominated |= check.nominate;
                        pair.nominated
                    }
                    None => false,
                };
                debug!(pair_id = check.pair_id, nominated, "Connectivity check succeeded");
                if nominated {
                    self.select_pair(session, check.pair_id).await;
                }
            }
            Err(IceError::RoleConflict) => {
                if session.role == check.role {
                    self.switch_role(session, "peer answered 487");
                }
                session.checklist.set_state(check.pair_id, PairState::Waiting);
            }
            Err(IceError::Closed) => {}
            Err(e) => {
                debug!(pair_id = check.pair_id, error = %e, "Connectivity check failed");
                session.checklist.set_state(check.pair_id, PairState::Failed);
            }
        }

        let failed = session.selected.is_none()
            && session.in_flight.is_empty()
            && session.checklist.all_failed();
        drop(guard);
        if failed {
            self.fail_checks().await;
        }
    }

    async fn fail_checks(&self) {
        if self.transition(IceConnectionState::Failed).await {
            warn!(agent_id = %self.id, "All candidate pairs failed");
        }
    }

    /// Make `pair_id` the selected pair and cancel the remaining checks
    async fn select_pair(self: &Arc<Self>, session: &mut Session, pair_id: PairId) {
        let Some(pair) = session.checklist.get(pair_id).cloned() else {
            return;
        };
        if let Some(current) = &session.selected {
            if current.id == pair.id || current.priority >= pair.priority {
                return;
            }
        }

        let cancelled: Vec<(PairId, (JoinHandle<()>, TransactionId))> =
            session.in_flight.drain().collect();
        for (id, (handle, transaction_id)) in cancelled {
            handle.abort();
            self.transactions.remove(&transaction_id).await;
            session.checklist.set_state(id, PairState::Waiting);
        }

        info!(
            agent_id = %self.id,
            local = %pair.local,
            remote = %pair.remote,
            "Selected candidate pair"
        );
        session.selected = Some(pair);
        self.transition(IceConnectionState::Connected).await;

        if !self.consent_started.swap(true, Ordering::SeqCst) {
            let consent = tokio::spawn(Arc::clone(self).run_consent());
            self.tasks.lock().await.push(consent);
        }
    }

    /// Check consent on the selected pair; Disconnected after too many misses
    async fn run_consent(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.consent_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut misses = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let state = self.state();
            if !matches!(
                state,
                IceConnectionState::Connected | IceConnectionState::Disconnected
            ) {
                misses = 0;
                continue;
            }

            let check = {
                let session = self.session.lock().await;
                session
                    .selected
                    .as_ref()
                    .and_then(|pair| self.prepare_check(&session, pair, false))
            };
            let Some(check) = check else {
                continue;
            };
            let result = self
                .transactions
                .transact(
                    &check.route,
                    &check.raw,
                    check.transaction_id,
                    check.remote,
                    &self.config.retransmit,
                )
                .await;

            match check_outcome(&check, result) {
                Ok(()) => {
                    misses = 0;
                    if self.state() == IceConnectionState::Disconnected
                        && self.transition(IceConnectionState::Connected).await
                    {
                        info!(agent_id = %self.id, "Consent restored");
                    }
                }
                Err(IceError::Closed) => break,
                Err(e) => {
                    misses += 1;
                    warn!(agent_id = %self.id, misses, error = %e, "Consent check unanswered");
                    if state == IceConnectionState::Disconnected {
                        misses = 0;
                        self.restart_checks().await;
                    } else if misses >= self.config.consent_max_failures {
                        self.transition(IceConnectionState::Disconnected).await;
                    }
                }
            }
        }
    }

    async fn restart_checks(&self) {
        {
            let mut session = self.session.lock().await;
            if let Some(pair) = session.selected.take() {
                session.checklist.set_state(pair.id, PairState::Waiting);
            }
        }
        if self.transition(IceConnectionState::Checking).await {
            info!(agent_id = %self.id, "Consent lost, re-entering connectivity checks");
        }
    }
}

/// Judge the response to a connectivity check
fn check_outcome(check: &PreparedCheck, result: IceResult<StunResponse>) -> IceResult<()> {
    let response = result?;
    if response.from != check.remote {
        return Err(IceError::Protocol(format!(
            "response from {} instead of {}",
            response.from, check.remote
        )));
    }
    match response.message.class() {
        MessageClass::SuccessResponse => verify_integrity(&response.raw, &check.key)
            .map_err(|_| IceError::Unauthorized("check response failed integrity".to_string())),
        _ => match response.message.error_code() {
            Some(error) if error.code == ErrorCode::ROLE_CONFLICT => Err(IceError::RoleConflict),
            Some(error) => Err(IceError::Protocol(format!("check rejected: {}", error))),
            None => Err(IceError::Protocol(
                "error response without ERROR-CODE".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio_stream::StreamExt;

    fn loopback_config() -> IceAgentConfig {
        IceAgentConfig {
            interfaces: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            connect_timeout: Duration::from_secs(10),
            retransmit: RetransmitConfig::new(3, 100, 400, 2.0),
            ..IceAgentConfig::default()
        }
    }

    async fn gathered_pair() -> (IceAgent, IceAgent) {
        let a = IceAgent::new(loopback_config());
        let b = IceAgent::new(loopback_config());
        a.gather_candidates().await.unwrap();
        b.gather_candidates().await.unwrap();
        for candidate in b.gathering_complete().await.unwrap() {
            a.add_remote_candidate(candidate).await.unwrap();
        }
        for candidate in a.gathering_complete().await.unwrap() {
            b.add_remote_candidate(candidate).await.unwrap();
        }
        (a, b)
    }

    #[test]
    fn test_credentials() {
        let agent = IceAgent::new(IceAgentConfig::default());
        let (ufrag, pwd) = agent.local_credentials();
        assert_eq!(ufrag.len(), UFRAG_LEN);
        assert_eq!(pwd.len(), PWD_LEN);
        assert!(ufrag.chars().chain(pwd.chars()).all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(agent.state(), IceConnectionState::New);
        assert_eq!(agent.role(), IceRole::Controlled);
    }

    #[tokio::test]
    async fn test_gather_only_from_new() {
        let agent = IceAgent::new(loopback_config());
        assert!(matches!(
            agent.gathering_complete().await,
            Err(IceError::InvalidState(_))
        ));
        assert!(matches!(
            agent.dial("u", "p").await,
            Err(IceError::InvalidState(_))
        ));

        agent.gather_candidates().await.unwrap();
        assert!(matches!(
            agent.gather_candidates().await,
            Err(IceError::InvalidState(_))
        ));
        let candidates = agent.gathering_complete().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(agent.state(), IceConnectionState::Gathering);
        agent.close().await;
    }

    #[tokio::test]
    async fn test_two_agents_connect() {
        let (a, b) = gathered_pair().await;
        let (a_ufrag, a_pwd) = a.local_credentials();
        let (b_ufrag, b_pwd) = b.local_credentials();

        let (dialed, accepted) = tokio::join!(a.dial(&b_ufrag, &b_pwd), b.accept(&a_ufrag, &a_pwd));
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(dialed.local.address, accepted.remote.address);
        assert_eq!(dialed.remote.address, accepted.local.address);
        assert_eq!(a.role(), IceRole::Controlling);
        assert_eq!(b.role(), IceRole::Controlled);

        a.send(b"ping").await.unwrap();
        let received = timeout(Duration::from_secs(2), b.recv()).await.unwrap().unwrap();
        assert_eq!(&received[..], b"ping");

        assert!(matches!(
            a.set_remote_credentials("x", "y").await,
            Err(IceError::InvalidState(_))
        ));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_replays_history() {
        let (a, b) = gathered_pair().await;
        let (a_ufrag, a_pwd) = a.local_credentials();
        let (b_ufrag, b_pwd) = b.local_credentials();
        let (dialed, accepted) = tokio::join!(a.dial(&b_ufrag, &b_pwd), b.accept(&a_ufrag, &a_pwd));
        dialed.unwrap();
        accepted.unwrap();

        let mut states = a.subscribe().await;
        a.close().await;
        let mut seen = Vec::new();
        while let Some(state) = states.next().await {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                IceConnectionState::New,
                IceConnectionState::Gathering,
                IceConnectionState::Checking,
                IceConnectionState::Connected,
                IceConnectionState::Closed,
            ]
        );
        b.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let agent = IceAgent::new(loopback_config());
        agent.gather_candidates().await.unwrap();
        agent.close().await;
        agent.close().await;
        assert_eq!(agent.state(), IceConnectionState::Closed);
        assert!(matches!(agent.send(b"x").await, Err(IceError::InvalidState(_))));
        assert!(matches!(agent.recv().await, Err(IceError::Closed)));
        assert!(matches!(
            agent.add_remote_candidate(Candidate::new_host(1, "127.0.0.1:9".parse().unwrap(), 1)).await,
            Err(IceError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails() {
        let agent = IceAgent::new(IceAgentConfig {
            retransmit: RetransmitConfig::new(1, 20, 40, 2.0),
            ..loopback_config()
        });
        agent.gather_candidates().await.unwrap();
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        agent
            .add_remote_candidate(Candidate::new_host(
                1,
                silent.local_addr().unwrap(),
                crate::candidate::DEFAULT_LOCAL_PREFERENCE,
            ))
            .await
            .unwrap();

        assert!(matches!(
            agent.dial("peer", "peerpassword").await,
            Err(IceError::ConnectionFailed)
        ));
        assert_eq!(agent.state(), IceConnectionState::Failed);
        agent.close().await;
    }
}
