//! MCP session state machine
//!
//! A [`Session`] binds one connected peer to a snapshot of a
//! [`CapabilityRegistry`]. It moves through five phases, never going back:
//!
//! ```text
//! Connecting -> Negotiating -> Active -> Closing -> Closed
//! ```
//!
//! - `connect` attaches the connection, starts the inbound reader and waits
//!   (polling, a bounded number of times) for the peer's capabilities, which
//!   arrive with its `initialize` request. Missing capabilities are not fatal.
//! - Once `Active`, a heartbeat pings the peer at a fixed interval. A failed
//!   ping is reported as a [`SessionEvent::Error`] and nothing more.
//! - `close` (or the peer hanging up) cancels the heartbeat, closes the
//!   outbound side and fails requests still waiting on the peer.
//!
//! Inbound requests run concurrently, one task each, and their responses are
//! correlated by id. Work that finishes after the session started closing is
//! dropped.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::context::{AuthPayload, ToolContext};
use crate::error::{Error, JsonRpcError, Result};
use crate::jsonrpc::JsonRpcService;
use crate::peer::{PeerLink, PeerRequester};
use crate::protocol::{
    ClientCapabilities, CreateMessageParams, CreateMessageResult, Implementation, IncomingMessage,
    JsonRpcNotification, JsonRpcResponse, JsonRpcResponseMessage, LogLevel,
    McpNotification, ProgressToken, RequestId, Root,
};
use crate::registry::CapabilityRegistry;
use crate::router::SessionRouter;
use crate::transport::Connection;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPhase {
    /// Created, no connection yet
    Connecting,
    /// Connected, waiting for the peer's capabilities
    Negotiating,
    /// Normal operation
    Active,
    /// Shutting down; new requests are rejected
    Closing,
    /// Done
    Closed,
}

/// Something a session wants its owner to know about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The peer's roots were re-fetched after a change notification
    RootsChanged { roots: Vec<Root> },
    /// A non-fatal session error, such as a failed heartbeat
    Error { message: String },
}

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server name and version reported in the initialize result
    pub server_info: Implementation,
    /// Usage hints for the peer, reported in the initialize result
    pub instructions: Option<String>,
    /// Ping interval once active, also the deadline for each ping.
    /// `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// How many times to look for the peer's capabilities
    pub negotiation_attempts: u32,
    /// Delay between two looks
    pub negotiation_delay: Duration,
    /// How long to wait for the peer to answer one of our requests
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation {
                name: "toolbox-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
            heartbeat_interval: Some(Duration::from_millis(1000)),
            negotiation_attempts: 10,
            negotiation_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Name and version reported to the peer
    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Usage hints sent with the initialize result
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Ping the peer every `interval` once active.
    ///
    /// A ping not answered within the same interval counts as failed.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Never ping the peer
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Look for the peer's capabilities up to `attempts` times, `delay` apart
    pub fn negotiation(mut self, attempts: u32, delay: Duration) -> Self {
        self.negotiation_attempts = attempts;
        self.negotiation_delay = delay;
        self
    }

    /// Deadline for roots and sampling requests sent to the peer
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Default)]
struct SessionTasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// State shared by a session, its reader, its heartbeat and its router
pub(crate) struct SessionState {
    pub(crate) id: String,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) config: SessionConfig,
    pub(crate) peer: Arc<PeerLink>,
    pub(crate) peer_capabilities: RwLock<Option<ClientCapabilities>>,
    pub(crate) peer_info: RwLock<Option<Implementation>>,
    pub(crate) log_level: Arc<RwLock<LogLevel>>,
    pub(crate) roots: RwLock<Vec<Root>>,
    pub(crate) auth: Option<AuthPayload>,
    phase: watch::Sender<SessionPhase>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<SessionTasks>,
}

impl SessionState {
    pub(crate) fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub(crate) fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Move from exactly `from` to `to`
    fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        let moved = self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(session_id = %self.id, from = ?from, to = ?to, "Session phase changed");
        }
        moved
    }

    /// Move forward to `to` from any earlier phase
    fn advance(&self, to: SessionPhase) -> bool {
        let moved = self.phase.send_if_modified(|phase| {
            if *phase < to {
                *phase = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(session_id = %self.id, to = ?to, "Session phase changed");
        }
        moved
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn peer_capabilities(&self) -> Option<ClientCapabilities> {
        self.peer_capabilities.read().ok().and_then(|c| c.clone())
    }

    pub(crate) fn record_peer(&self, capabilities: ClientCapabilities, info: Implementation) {
        tracing::info!(
            session_id = %self.id,
            peer = %info.name,
            peer_version = %info.version,
            "Peer initialized"
        );
        if let Ok(mut caps) = self.peer_capabilities.write() {
            *caps = Some(capabilities);
        }
        if let Ok(mut peer_info) = self.peer_info.write() {
            *peer_info = Some(info);
        }
    }

    pub(crate) fn set_log_level(&self, level: LogLevel) {
        if let Ok(mut current) = self.log_level.write() {
            *current = level;
        }
    }

    /// Context for one tool call made through this session
    pub(crate) fn tool_context(
        &self,
        request_id: RequestId,
        progress_token: Option<ProgressToken>,
    ) -> ToolContext {
        ToolContext::new(request_id)
            .with_progress_token(progress_token)
            .with_peer(self.peer.clone())
            .with_requester(self.peer.clone())
            .with_min_log_level(self.log_level.clone())
            .with_auth(self.auth.clone())
    }

    fn replace_roots(&self, roots: Vec<Root>) {
        if let Ok(mut cached) = self.roots.write() {
            *cached = roots;
        }
    }

    async fn refresh_roots(&self) -> Result<Vec<Root>> {
        let roots = self.peer.list_roots().await?;
        self.replace_roots(roots.clone());
        Ok(roots)
    }

    fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let notification = match McpNotification::from_jsonrpc(&notification) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Malformed notification");
                return;
            }
        };

        match notification {
            McpNotification::RootsListChanged => {
                let state = self.clone();
                tokio::spawn(async move {
                    match state.refresh_roots().await {
                        Ok(roots) => state.emit(SessionEvent::RootsChanged { roots }),
                        Err(e) => {
                            tracing::warn!(session_id = %state.id, error = %e, "Failed to refresh roots");
                        }
                    }
                });
            }
            McpNotification::Initialized => {
                tracing::debug!(session_id = %self.id, "Peer sent initialized");
            }
            McpNotification::Cancelled(params) => {
                // in-flight work is never aborted, its result is just late
                tracing::debug!(
                    session_id = %self.id,
                    request_id = %params.request_id,
                    reason = ?params.reason,
                    "Peer cancelled request"
                );
            }
            McpNotification::Progress(params) => {
                tracing::trace!(session_id = %self.id, progress = params.progress, "Peer progress");
            }
            McpNotification::Unknown { method, .. } => {
                tracing::debug!(session_id = %self.id, method = %method, "Unknown notification");
            }
        }
    }

    /// Send a response unless the session is already going away
    async fn deliver(&self, response: JsonRpcResponseMessage) {
        if self.phase() >= SessionPhase::Closing {
            tracing::debug!(session_id = %self.id, "Discarding response, session closing");
            return;
        }
        if let Err(e) = self.peer.send(&response).await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to send response");
        }
    }

    fn shutdown(&self, from_reader: bool) {
        if !self.advance(SessionPhase::Closing) {
            return;
        }
        tracing::info!(session_id = %self.id, "Closing session");

        let (reader, heartbeat) = match self.tasks.lock() {
            Ok(mut tasks) => (tasks.reader.take(), tasks.heartbeat.take()),
            Err(_) => (None, None),
        };
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        if let Some(reader) = reader
            && !from_reader
        {
            reader.abort();
        }

        match self.peer.detach() {
            Ok(sender) => drop(sender),
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Error closing connection"),
        }
        self.peer.fail_pending();

        self.advance(SessionPhase::Closed);
        tracing::info!(session_id = %self.id, "Session closed");
    }
}

/// One negotiated, stateful connection to a single peer
#[derive(Clone)]
pub struct Session {
    state: Arc<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.state.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an unconnected session over a registry snapshot
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        config: SessionConfig,
        auth: Option<AuthPayload>,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Connecting);
        let (events, _) = broadcast::channel(32);
        let peer = Arc::new(PeerLink::new(config.request_timeout));

        Self {
            state: Arc::new(SessionState {
                id: uuid::Uuid::new_v4().to_string(),
                registry,
                config,
                peer,
                peer_capabilities: RwLock::new(None),
                peer_info: RwLock::new(None),
                log_level: Arc::new(RwLock::new(LogLevel::default())),
                roots: RwLock::new(Vec::new()),
                auth,
                phase,
                events,
                tasks: Mutex::new(SessionTasks::default()),
            }),
        }
    }

    /// Attach a connection and negotiate with the peer.
    ///
    /// Returns once the session is `Active` (or was closed while
    /// negotiating). Fails if the session was connected before.
    pub async fn connect(&self, connection: Connection) -> Result<()> {
        let state = &self.state;
        if !state.transition(SessionPhase::Connecting, SessionPhase::Negotiating) {
            return Err(Error::unexpected_state("Session is already connected"));
        }

        let Connection { inbound, outbound } = connection;
        state.peer.attach(outbound);
        let reader = tokio::spawn(run_reader(state.clone(), inbound));
        if let Ok(mut tasks) = state.tasks.lock() {
            tasks.reader = Some(reader);
        }
        tracing::info!(session_id = %state.id, "Session connected, negotiating");

        let capabilities = self.negotiate().await;
        if let Some(caps) = capabilities
            && caps.roots.is_some()
        {
            match state.refresh_roots().await {
                Ok(roots) => {
                    tracing::debug!(session_id = %state.id, count = roots.len(), "Fetched peer roots");
                }
                Err(e) => {
                    tracing::warn!(session_id = %state.id, error = %e, "Failed to list peer roots");
                }
            }
        }

        if !state.transition(SessionPhase::Negotiating, SessionPhase::Active) {
            tracing::debug!(session_id = %state.id, "Session closed during negotiation");
            return Ok(());
        }
        tracing::info!(session_id = %state.id, "Session active");

        if let Some(interval) = state.config.heartbeat_interval {
            let heartbeat = tokio::spawn(run_heartbeat(Arc::downgrade(state), interval));
            if let Ok(mut tasks) = state.tasks.lock() {
                tasks.heartbeat = Some(heartbeat);
            }
            // close may have raced us
            if state.phase() >= SessionPhase::Closing
                && let Ok(mut tasks) = state.tasks.lock()
                && let Some(heartbeat) = tasks.heartbeat.take()
            {
                heartbeat.abort();
            }
        }
        Ok(())
    }

    async fn negotiate(&self) -> Option<ClientCapabilities> {
        let state = &self.state;
        for attempt in 0..state.config.negotiation_attempts {
            if let Some(caps) = state.peer_capabilities() {
                return Some(caps);
            }
            if state.phase() >= SessionPhase::Closing {
                return None;
            }
            tracing::trace!(session_id = %state.id, attempt, "Waiting for peer capabilities");
            tokio::time::sleep(state.config.negotiation_delay).await;
        }

        let caps = state.peer_capabilities();
        if caps.is_none() {
            tracing::warn!(session_id = %state.id, "Peer capabilities not received, continuing without them");
        }
        caps
    }

    /// Shut the session down. Safe to call more than once.
    pub fn close(&self) {
        self.state.shutdown(false);
    }

    /// Wait until the session is fully closed
    pub async fn closed(&self) {
        let mut phase = self.state.watch_phase();
        let _ = phase.wait_for(|p| *p == SessionPhase::Closed).await;
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Observe phase changes
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.state.watch_phase()
    }

    /// Listen for session events. Each subscriber sees every later event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.events.subscribe()
    }

    pub fn peer_capabilities(&self) -> Option<ClientCapabilities> {
        self.state.peer_capabilities()
    }

    pub fn peer_info(&self) -> Option<Implementation> {
        self.state.peer_info.read().ok().and_then(|i| i.clone())
    }

    /// Roots cached from the peer
    pub fn roots(&self) -> Vec<Root> {
        self.state
            .roots
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn logging_level(&self) -> LogLevel {
        self.state
            .log_level
            .read()
            .map(|l| *l)
            .unwrap_or_default()
    }

    pub fn auth(&self) -> Option<&AuthPayload> {
        self.state.auth.as_ref()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.state.registry
    }

    /// Ask the peer to run an LLM completion
    pub async fn request_sampling(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        if self.phase() != SessionPhase::Active {
            return Err(Error::unexpected_state(format!(
                "Cannot request sampling while session is {:?}",
                self.phase()
            )));
        }
        self.state.peer.sample(params).await
    }

    /// The request router of this session, for in-process dispatch
    pub fn router(&self) -> SessionRouter {
        SessionRouter::new(self.state.clone())
    }
}

async fn run_reader(state: Arc<SessionState>, mut inbound: mpsc::Receiver<String>) {
    let service = JsonRpcService::new(SessionRouter::new(state.clone()));

    while let Some(line) = inbound.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(session_id = %state.id, input = %line, "Received message");

        match IncomingMessage::parse(line) {
            Ok(IncomingMessage::Response(response)) => state.peer.complete(response),
            Ok(IncomingMessage::Notification(notification)) => {
                state.handle_notification(notification)
            }
            Ok(IncomingMessage::Request(message)) => {
                let service = service.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let response = service.call_message(message).await;
                    state.deliver(response).await;
                });
            }
            Err(e) => {
                tracing::warn!(session_id = %state.id, error = %e, "Unparseable message");
                let response = JsonRpcResponseMessage::Single(JsonRpcResponse::error(
                    None,
                    JsonRpcError::parse_error(e.to_string()),
                ));
                state.deliver(response).await;
            }
        }
    }

    tracing::info!(session_id = %state.id, "Peer disconnected");
    state.shutdown(true);
}

async fn run_heartbeat(state: Weak<SessionState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        if state.phase() != SessionPhase::Active {
            break;
        }
        // a silent peer is reported within one interval
        if let Err(e) = state.peer.ping_within(interval).await {
            tracing::warn!(session_id = %state.id, error = %e, "Heartbeat ping failed");
            state.emit(SessionEvent::Error {
                message: format!("Heartbeat failed: {}", e),
            });
        }
    }
}
