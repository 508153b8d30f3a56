/**
 * matchmaking/session.rs
 *
 * The matchmaking state machine. One worker task drives
 * INITIALIZING -> MATCHMAKING -> OPPONENT_CONNECTING under an exclusive
 * session lock; `cancel()` takes the same lock, so a concurrent cancel
 * lands before the next handler dispatch. Handlers only ever wait in
 * bounded polls and re-check the cancel flag each step.
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::{self, CoordinatorOutcome};
use super::policy::{host_of, resolve_candidates};
use super::protocol::{
    self, CreateTicketRequest, CreateTicketResponse, GetTicketResponse, CREATE_TICKET_RESP,
    GET_TICKET_RESP,
};
use super::types::{stage_list, GameDescriptor, MatchRequest, TicketAssignment};
use crate::config::MatchmakingConfig;
use crate::error::SearchError;
use crate::transport::{Event, Host, Transport};
use crate::user::CredentialProvider;

/// State machine states. A search is live while in one of the middle three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Initializing,
    Matchmaking,
    OpponentConnecting,
    ConnectionSuccess,
    ErrorEncountered,
}

impl ProcessState {
    pub fn is_searching(self) -> bool {
        matches!(
            self,
            ProcessState::Initializing | ProcessState::Matchmaking | ProcessState::OpponentConnecting
        )
    }
}

/// Delivered exactly once per `start()`, through the returned receiver.
pub type SearchOutcome<H> = Result<MatchResult<H>, SearchError>;

/// Everything the caller needs to hand off to the in-match transport layer.
#[derive(Debug)]
pub struct MatchResult<H: Host> {
    pub game: GameDescriptor,
    pub is_decider: bool,
    pub remote_connect_code: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub session: MatchSession<H>,
}

/// Opaque connected-session handle: the punched host plus the verified
/// peer per remote slot.
#[derive(Debug)]
pub struct MatchSession<H: Host> {
    host: H,
    peers: Vec<SocketAddr>,
    pub assignment: TicketAssignment,
}

impl<H: Host> MatchSession<H> {
    pub fn local_port(&self) -> u16 {
        self.host.local_port()
    }

    /// Verified peer addresses in remote-slot order.
    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// Graceful teardown: disconnect every peer, wait out the handshakes
    /// within the configured bound, reset whatever is left.
    pub async fn close(mut self, wait: Duration) {
        for peer in self.peers.clone() {
            self.host.disconnect(peer);
        }
        let mut remaining = self.peers.clone();
        let deadline = tokio::time::Instant::now() + wait;
        while !remaining.is_empty() {
            let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
            if budget.is_zero() {
                break;
            }
            match self.host.service(budget).await {
                Ok(Some(Event::Disconnect { peer })) => remaining.retain(|p| *p != peer),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
        for peer in remaining {
            self.host.reset(peer);
        }
    }
}

/// Mutable search state, owned by the worker and guarded by the session
/// lock. Torn down wholesale when a new search starts.
struct SessionState<H: Host> {
    state: ProcessState,
    error_msg: String,
    local_port: u16,
    directory: Option<H>,
    directory_peer: Option<SocketAddr>,
    assignment: Option<TicketAssignment>,
    failed_slots: Vec<usize>,
    outcome_tx: Option<oneshot::Sender<SearchOutcome<H>>>,
}

impl<H: Host> SessionState<H> {
    fn idle() -> Self {
        Self {
            state: ProcessState::Idle,
            error_msg: String::new(),
            local_port: 0,
            directory: None,
            directory_peer: None,
            assignment: None,
            failed_slots: Vec::new(),
            outcome_tx: None,
        }
    }

    fn fresh(outcome_tx: oneshot::Sender<SearchOutcome<H>>) -> Self {
        Self {
            state: ProcessState::Initializing,
            outcome_tx: Some(outcome_tx),
            ..Self::idle()
        }
    }
}

struct Shared<H: Host> {
    session: Mutex<SessionState<H>>,
    cancel: AtomicBool,
    state_tx: watch::Sender<ProcessState>,
}

impl<H: Host> Shared<H> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// A matchmaking client with explicit lifecycle: construct, `start`,
/// optionally `cancel`, `close`. One search at a time; starting a new one
/// tears the old one down first.
pub struct Matchmaker<T: Transport> {
    config: Arc<MatchmakingConfig>,
    transport: T,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<Shared<T::Host>>,
    state_rx: watch::Receiver<ProcessState>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Transport> Matchmaker<T> {
    pub fn new(
        config: MatchmakingConfig,
        transport: T,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ProcessState::Idle);
        Self {
            config: Arc::new(config),
            transport,
            credentials,
            shared: Arc::new(Shared {
                session: Mutex::new(SessionState::idle()),
                cancel: AtomicBool::new(false),
                state_tx,
            }),
            state_rx,
            worker: None,
        }
    }

    /// Begin a search. The returned receiver resolves exactly once, with
    /// the connected match or the terminal error.
    pub async fn start(
        &mut self,
        request: MatchRequest,
    ) -> Result<oneshot::Receiver<SearchOutcome<T::Host>>, SearchError> {
        // Only one active search; tear down a running worker first.
        if let Some(worker) = self.worker.take() {
            self.cancel().await;
            let _ = worker.await;
        }
        if self.credentials.current_user().is_none() {
            return Err(SearchError::NotLoggedIn);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.shared.session.lock().await;
            *session = SessionState::fresh(tx);
        }
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.state_tx.send_replace(ProcessState::Initializing);

        let shared = Arc::clone(&self.shared);
        let transport = self.transport.clone();
        let credentials = Arc::clone(&self.credentials);
        let config = Arc::clone(&self.config);
        self.worker = Some(tokio::spawn(async move {
            run_worker(shared, transport, credentials, config, request).await;
        }));
        Ok(rx)
    }

    /// Abort the running search. Safe from any task; the failure outcome
    /// is delivered under the session lock, so it fires at most once.
    pub async fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        let mut session = self.shared.session.lock().await;
        if !session.state.is_searching() {
            return;
        }
        session.state = ProcessState::ErrorEncountered;
        session.error_msg = SearchError::Cancelled.to_string();
        deliver(&mut session, Err(SearchError::Cancelled));
        self.shared.state_tx.send_replace(session.state);
    }

    pub fn is_searching(&self) -> bool {
        self.state_rx.borrow().is_searching()
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions; useful for UIs that show search progress.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Human-readable reason for the last failure; empty while healthy.
    pub async fn error_message(&self) -> String {
        self.shared.session.lock().await.error_msg.clone()
    }

    /// Remote slots the last connection attempt could not reach.
    pub async fn failed_slots(&self) -> Vec<usize> {
        self.shared.session.lock().await.failed_slots.clone()
    }

    /// Cancel any running search and wait for the worker to finish its
    /// teardown, releasing all transport resources.
    pub async fn close(&mut self) {
        self.cancel().await;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

fn deliver<H: Host>(session: &mut SessionState<H>, outcome: SearchOutcome<H>) {
    if let Some(tx) = session.outcome_tx.take() {
        let _ = tx.send(outcome);
    }
}

fn fail<H: Host>(session: &mut SessionState<H>, error: SearchError) {
    warn!(%error, "search failed");
    session.state = ProcessState::ErrorEncountered;
    session.error_msg = error.to_string();
    deliver(session, Err(error));
}

async fn run_worker<T: Transport>(
    shared: Arc<Shared<T::Host>>,
    transport: T,
    credentials: Arc<dyn CredentialProvider>,
    config: Arc<MatchmakingConfig>,
    request: MatchRequest,
) {
    debug!("matchmaking worker starting");
    loop {
        let mut session = shared.session.lock().await;
        match session.state {
            ProcessState::Initializing => {
                handle_initializing(&mut session, &shared, &transport, &*credentials, &config, &request)
                    .await;
            }
            ProcessState::Matchmaking => {
                handle_matchmaking(&mut session, &shared, &*credentials, &config).await;
            }
            ProcessState::OpponentConnecting => {
                handle_connecting(&mut session, &shared, &transport, &config, &request).await;
            }
            _ => {
                drop(session);
                break;
            }
        }
        shared.state_tx.send_replace(session.state);
    }

    // Release whatever directory endpoint is still held.
    let mut session = shared.session.lock().await;
    if let Some(host) = session.directory.take() {
        let peer = session.directory_peer.take();
        drop(session);
        release_directory(host, peer, &config).await;
    }
    debug!("matchmaking worker finished");
}

/// INITIALIZING: bind a control port, reach the directory server, create
/// a ticket.
async fn handle_initializing<T: Transport>(
    session: &mut SessionState<T::Host>,
    shared: &Shared<T::Host>,
    transport: &T,
    credentials: &dyn CredentialProvider,
    config: &MatchmakingConfig,
    request: &MatchRequest,
) {
    let Some(user) = credentials.current_user() else {
        fail(session, SearchError::NotLoggedIn);
        return;
    };

    // Random port in range, retried on bind conflicts. This port doubles
    // as the p2p listen port later.
    let mut host = None;
    for attempt in 0..config.bind_attempts {
        let port = rand::thread_rng().gen_range(config.port_range.clone());
        match transport.bind(port, 1) {
            Ok(h) => {
                host = Some(h);
                break;
            }
            Err(e) => debug!(attempt, port, error = %e, "bind attempt failed"),
        }
    }
    let Some(mut host) = host else {
        fail(session, SearchError::ClientBindFailed);
        return;
    };
    session.local_port = host.local_port();
    info!(port = session.local_port, "control port bound");

    let server_addr = match transport.resolve(&config.directory_addr()) {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "directory address resolution failed");
            fail(session, SearchError::DirectoryUnreachable);
            return;
        }
    };
    if host.connect(server_addr).is_err() {
        fail(session, SearchError::DirectoryUnreachable);
        return;
    }

    // Ticket creation needs an established control connection first.
    let mut connected = false;
    for _ in 0..config.connect_poll_steps {
        if shared.cancelled() {
            return;
        }
        if let Ok(Some(Event::Connect { .. })) = host.service(config.connect_poll).await {
            connected = true;
            break;
        }
    }
    if !connected {
        fail(session, SearchError::DirectoryUnreachable);
        return;
    }
    info!("connected to directory server");

    // Best effort; an empty LAN address only disables the LAN shortcut.
    let lan_address = local_lan_address(session.local_port).unwrap_or_default();

    let ticket = CreateTicketRequest::build(&user, request, &config.app_version, &lan_address);
    let _ = host.send(server_addr, &ticket.encode());

    match receive_control(&mut host, config.create_ticket_timeout, config.service_step, shared)
        .await
    {
        ControlRecv::Cancelled => {}
        ControlRecv::Disconnected => fail(session, SearchError::LostDirectoryConnection),
        ControlRecv::SoftTimeout => {
            fail(
                session,
                SearchError::DirectoryProtocolError("no response to create-ticket".into()),
            );
        }
        ControlRecv::Message(payload) => {
            let response: CreateTicketResponse = match protocol::decode(&payload, CREATE_TICKET_RESP)
            {
                Ok(r) => r,
                Err(e) => {
                    fail(session, e);
                    return;
                }
            };
            if let Some(error) = protocol::server_error(&response.error) {
                fail(session, SearchError::DirectoryRejected(error.to_string()));
                return;
            }
            info!("ticket created");
            session.directory = Some(host);
            session.directory_peer = Some(server_addr);
            session.state = ProcessState::Matchmaking;
        }
    }
}

/// MATCHMAKING: poll for the opponent assignment. A quiet poll self-loops.
async fn handle_matchmaking<H: Host>(
    session: &mut SessionState<H>,
    shared: &Shared<H>,
    credentials: &dyn CredentialProvider,
    config: &MatchmakingConfig,
) {
    let Some(mut host) = session.directory.take() else {
        fail(
            session,
            SearchError::DirectoryProtocolError("matchmaking without control connection".into()),
        );
        return;
    };

    match receive_control(&mut host, config.get_ticket_timeout, config.service_step, shared).await
    {
        ControlRecv::SoftTimeout | ControlRecv::Cancelled => {
            // No assignment yet; keep the endpoint and come back around.
            session.directory = Some(host);
        }
        ControlRecv::Disconnected => fail(session, SearchError::LostDirectoryConnection),
        ControlRecv::Message(payload) => {
            let response: GetTicketResponse = match protocol::decode(&payload, GET_TICKET_RESP) {
                Ok(r) => r,
                Err(e) => {
                    fail(session, e);
                    return;
                }
            };
            if let Some(error) = protocol::server_error(&response.error) {
                // An outdated client learns the current version here.
                if let Some(latest) = response.latest_version.as_deref() {
                    if !latest.is_empty() {
                        credentials.note_latest_version(latest);
                    }
                }
                fail(session, SearchError::DirectoryRejected(error.to_string()));
                return;
            }

            let assignment = match build_assignment(response) {
                Ok(a) => a,
                Err(e) => {
                    fail(session, e);
                    return;
                }
            };
            info!(
                remote_players = assignment.remote_count(),
                is_decider = assignment.is_decider,
                "opponent found"
            );
            session.assignment = Some(assignment);

            // The control connection has served its purpose; the port must
            // be free for the punch host.
            let peer = session.directory_peer.take();
            release_directory(host, peer, config).await;
            session.state = ProcessState::OpponentConnecting;
        }
    }
}

/// OPPONENT_CONNECTING: run the coordinator and wait for a terminal
/// status. Failure discards this assignment and requests a fresh ticket.
async fn handle_connecting<T: Transport>(
    session: &mut SessionState<T::Host>,
    shared: &Shared<T::Host>,
    transport: &T,
    config: &MatchmakingConfig,
    request: &MatchRequest,
) {
    let Some(assignment) = session.assignment.clone() else {
        fail(
            session,
            SearchError::DirectoryProtocolError("connecting without an assignment".into()),
        );
        return;
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let relay = Arc::clone(&cancel);
    // The coordinator watches the session's cancel state through its own
    // flag; mirror it here so it stops within one poll step.
    let handle = coordinator::spawn(
        transport.clone(),
        Arc::new(config.clone()),
        session.local_port,
        assignment.candidates.clone(),
        relay,
    );

    let outcome = {
        let waiter = handle.outcome();
        tokio::pin!(waiter);
        loop {
            if shared.cancelled() {
                cancel.store(true, Ordering::SeqCst);
            }
            match tokio::time::timeout(config.punch_poll, &mut waiter).await {
                Ok(outcome) => break outcome,
                Err(_) => continue,
            }
        }
    };

    match outcome {
        CoordinatorOutcome::Connected { host, peers } => {
            if shared.cancelled() {
                // Cancelled between coordinator success and delivery.
                MatchSession {
                    host,
                    peers,
                    assignment,
                }
                .close(config.disconnect_wait)
                .await;
                return;
            }
            let remote = assignment.first_remote();
            let result = MatchResult {
                game: request.game.clone(),
                is_decider: assignment.is_decider,
                remote_connect_code: remote.map(|r| r.connect_code.clone()).unwrap_or_default(),
                remote_port: assignment
                    .candidates
                    .first()
                    .map(|c| c.addr.port())
                    .unwrap_or_default(),
                local_port: session.local_port,
                session: MatchSession {
                    host,
                    peers,
                    assignment,
                },
            };
            info!("connection success");
            session.state = ProcessState::ConnectionSuccess;
            deliver(session, Ok(result));
        }
        CoordinatorOutcome::Failed { failed_slots } => {
            session.failed_slots = failed_slots;
            if shared.cancelled() {
                return;
            }
            // Look for someone else we can hopefully connect with.
            warn!(failed_slots = ?session.failed_slots, "connection attempt failed, retrying with a fresh ticket");
            session.assignment = None;
            session.state = ProcessState::Initializing;
        }
    }
}

/// Turn a valid get-ticket response into an assignment, enforcing the
/// data-model invariants.
fn build_assignment(response: GetTicketResponse) -> Result<TicketAssignment, SearchError> {
    let mut players = Vec::with_capacity(response.players.len());
    for wire in response.players {
        players.push(wire.into_descriptor()?);
    }

    let mut locals = players.iter().filter(|p| p.is_local);
    let local = locals
        .next()
        .ok_or_else(|| SearchError::DirectoryProtocolError("no local player in assignment".into()))?;
    if locals.next().is_some() {
        return Err(SearchError::DirectoryProtocolError(
            "multiple local players in assignment".into(),
        ));
    }
    let local_slot = local.slot;
    let local_external_ip = host_of(&local.external)
        .unwrap_or(&local.external)
        .to_string();

    let candidates = resolve_candidates(&players, local_slot, &local_external_ip)?;
    let mut slots: Vec<usize> = candidates.iter().map(|c| c.slot).collect();
    slots.sort_unstable();
    slots.dedup();
    if slots.len() != candidates.len() {
        return Err(SearchError::DirectoryProtocolError(
            "duplicate slots in assignment".into(),
        ));
    }

    let stages = stage_list(response.stages, players.len());
    Ok(TicketAssignment {
        local_slot,
        is_decider: response.is_host,
        stages,
        candidates,
        players,
    })
}

enum ControlRecv {
    Message(Vec<u8>),
    SoftTimeout,
    Disconnected,
    Cancelled,
}

/// Poll the control connection for one message within `budget`, stepping
/// so cancellation is observed promptly. Transient transport errors are
/// ignored; timeouts carry the protocol.
async fn receive_control<H: Host>(
    host: &mut H,
    budget: Duration,
    step: Duration,
    shared: &Shared<H>,
) -> ControlRecv {
    let step = step.max(Duration::from_millis(1));
    let attempts = (budget.as_millis() / step.as_millis()).max(1);
    for _ in 0..attempts {
        if shared.cancelled() {
            return ControlRecv::Cancelled;
        }
        match host.service(step).await {
            Ok(Some(Event::Receive { payload, .. })) => return ControlRecv::Message(payload),
            Ok(Some(Event::Disconnect { .. })) => return ControlRecv::Disconnected,
            Ok(_) => {}
            Err(e) => debug!(error = %e, "transient transport error"),
        }
    }
    ControlRecv::SoftTimeout
}

/// Graceful control-connection teardown: disconnect, wait bounded for the
/// acknowledgement, force reset otherwise, then drop the endpoint.
async fn release_directory<H: Host>(
    mut host: H,
    peer: Option<SocketAddr>,
    config: &MatchmakingConfig,
) {
    let Some(peer) = peer else {
        return;
    };
    host.disconnect(peer);
    let deadline = tokio::time::Instant::now() + config.disconnect_wait;
    loop {
        let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
        if budget.is_zero() {
            host.reset(peer);
            break;
        }
        match host.service(budget.min(config.service_step)).await {
            Ok(Some(Event::Disconnect { .. })) => break,
            Ok(_) => {}
            Err(_) => {
                host.reset(peer);
                break;
            }
        }
    }
    debug!("directory endpoint released");
}

/// LAN-visible "ip:port" for the ticket request. Best effort: routes a
/// dummy datagram socket to learn the preferred outbound interface.
fn local_lan_address(port: u16) -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    Some(format!("{ip}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::protocol::WirePlayer;

    fn wire_player(port: u32, local: bool, ip: &str) -> WirePlayer {
        WirePlayer {
            uid: format!("uid-{port}"),
            display_name: format!("player {port}"),
            connect_code: format!("P{port}#00{port}"),
            port,
            is_local_player: local,
            ip_address: ip.to_string(),
            ip_address_lan: None,
        }
    }

    fn response(players: Vec<WirePlayer>) -> GetTicketResponse {
        GetTicketResponse {
            error: None,
            latest_version: None,
            players,
            is_host: true,
            stages: None,
        }
    }

    #[test]
    fn assignment_for_singles_has_one_candidate_and_six_stages() {
        let assignment = build_assignment(response(vec![
            wire_player(1, true, "1.2.3.4:41000"),
            wire_player(2, false, "5.6.7.8:41100"),
        ]))
        .unwrap();
        assert_eq!(assignment.local_slot, 0);
        assert!(assignment.is_decider);
        assert_eq!(assignment.candidates.len(), 1);
        assert_eq!(assignment.stages.len(), 6);
        assert_eq!(
            assignment.first_remote().unwrap().connect_code,
            "P2#002"
        );
    }

    #[test]
    fn assignment_without_local_player_is_rejected() {
        let err = build_assignment(response(vec![wire_player(1, false, "1.2.3.4:41000")]))
            .unwrap_err();
        assert!(matches!(err, SearchError::DirectoryProtocolError(_)));
    }

    #[test]
    fn assignment_with_two_local_players_is_rejected() {
        let err = build_assignment(response(vec![
            wire_player(1, true, "1.2.3.4:41000"),
            wire_player(2, true, "5.6.7.8:41100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SearchError::DirectoryProtocolError(_)));
    }

    #[test]
    fn four_player_assignment_keeps_five_stages() {
        let assignment = build_assignment(response(vec![
            wire_player(1, true, "1.2.3.4:41000"),
            wire_player(2, false, "5.6.7.8:41100"),
            wire_player(3, false, "9.10.11.12:41200"),
            wire_player(4, false, "13.14.15.16:41300"),
        ]))
        .unwrap();
        assert_eq!(assignment.remote_count(), 3);
        assert_eq!(assignment.stages.len(), 5);
    }
}
