//! The orchestrator: one registry, many sessions
//!
//! A [`ToolBox`] is configured once with tools, resources, templates and
//! prompts, then started on a transport. Every connection gets its own
//! [`Session`] over a snapshot of the registry taken when the connection
//! arrives. Session lifecycle is published as [`ToolBoxEvent`]s.
//!
//! ```rust,no_run
//! use toolbox_mcp::error::BoxError;
//! use toolbox_mcp::toolbox::{ToolBox, ToolBoxOptions, TransportKind};
//! use toolbox_mcp::tool::ToolBuilder;
//! use serde_json::Value;
//!
//! # async fn run() -> Result<(), toolbox_mcp::error::Error> {
//! let mut toolbox = ToolBox::new(ToolBoxOptions::new("demo", "1.0.0"));
//! toolbox.add_tool(
//!     ToolBuilder::new("hello")
//!         .raw_handler(|_args: Value| async { Ok::<_, BoxError>("hi") })
//!         .build()?,
//! )?;
//! toolbox.start(TransportKind::Stdio).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderMap;
use tokio::sync::{broadcast, watch};

use crate::context::AuthPayload;
use crate::error::{Error, Result};
use crate::prompt::Prompt;
use crate::registry::CapabilityRegistry;
use crate::resource::{Resource, ResourceTemplate};
use crate::session::{Session, SessionConfig};
use crate::tool::{BoxFuture, Tool};
use crate::transport::sse::ConnectionAcceptor;
use crate::transport::{Connection, SseServer, SseServerHandle, spawn_stdio};

/// Hook that vets a new SSE connection from its request headers.
///
/// The returned payload is visible to tools through
/// [`ToolContext::auth`](crate::context::ToolContext::auth). An error
/// rejects the connection.
pub type AuthenticateFn =
    Arc<dyn Fn(HeaderMap) -> BoxFuture<'static, Result<AuthPayload>> + Send + Sync>;

/// Orchestrator configuration
#[derive(Clone)]
pub struct ToolBoxOptions {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    pub authenticate: Option<AuthenticateFn>,
    /// Settings every session starts from; server info and instructions
    /// are overridden by the fields above
    pub session: SessionConfig,
}

impl std::fmt::Debug for ToolBoxOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBoxOptions")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("instructions", &self.instructions)
            .field("authenticate", &self.authenticate.is_some())
            .field("session", &self.session)
            .finish()
    }
}

impl ToolBoxOptions {
    /// Options for a server called `name` at `version`, with default session settings
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            instructions: None,
            authenticate: None,
            session: SessionConfig::default(),
        }
    }

    /// Usage hints every session reports to its peer
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Vet each SSE connection with `hook` before its session starts
    pub fn authenticate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HeaderMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AuthPayload>> + Send + 'static,
    {
        self.authenticate = Some(Arc::new(move |headers| Box::pin(hook(headers))));
        self
    }

    /// Heartbeat, negotiation and timeout settings for every session
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    fn session_settings(&self) -> SessionConfig {
        let mut config = self
            .session
            .clone()
            .server_info(self.name.clone(), self.version.clone());
        config.instructions = self.instructions.clone();
        config
    }
}

/// Where a [`ToolBox`] takes connections from
#[derive(Debug)]
pub enum TransportKind {
    /// Process stdin/stdout, one session
    Stdio,
    /// HTTP server with one session per SSE stream
    Sse { endpoint: String, port: u16 },
    /// A caller-provided connection, one session
    Channel(Connection),
}

impl TransportKind {
    fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse { .. } => "sse",
            TransportKind::Channel(_) => "channel",
        }
    }
}

/// Session lifecycle notifications
#[derive(Debug, Clone)]
pub enum ToolBoxEvent {
    Connect { session: Session },
    Disconnect { session: Session },
}

/// State shared with session watchers and the SSE acceptor
struct Shared {
    sessions: Mutex<Vec<Session>>,
    events: broadcast::Sender<ToolBoxEvent>,
}

impl Shared {
    fn emit(&self, event: ToolBoxEvent) {
        let _ = self.events.send(event);
    }

    fn remove(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().ok()?;
        let index = sessions.iter().position(|s| s.id() == id)?;
        Some(sessions.remove(index))
    }

    /// Connect a new session and keep it until it closes
    async fn open(
        self: &Arc<Self>,
        registry: Arc<CapabilityRegistry>,
        config: SessionConfig,
        connection: Connection,
        auth: Option<AuthPayload>,
    ) -> Result<Session> {
        let session = Session::new(registry, config, auth);
        session.connect(connection).await?;

        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session.clone());
        }
        tracing::info!(session_id = %session.id(), "Session connected");
        self.emit(ToolBoxEvent::Connect {
            session: session.clone(),
        });

        let shared = self.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            // stop() may have removed it already
            if let Some(session) = shared.remove(watched.id()) {
                tracing::info!(session_id = %session.id(), "Session disconnected");
                shared.emit(ToolBoxEvent::Disconnect { session });
            }
        });

        Ok(session)
    }
}

/// Accepts SSE connections on behalf of a [`ToolBox`]
struct SseAcceptor {
    shared: Arc<Shared>,
    /// Latest registry; read once per connection
    registry: watch::Receiver<Arc<CapabilityRegistry>>,
    config: SessionConfig,
    authenticate: Option<AuthenticateFn>,
}

#[async_trait]
impl ConnectionAcceptor for SseAcceptor {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<AuthPayload>> {
        match &self.authenticate {
            Some(hook) => hook(headers.clone()).await.map(Some),
            None => Ok(None),
        }
    }

    fn accept(&self, connection: Connection, auth: Option<AuthPayload>) {
        let shared = self.shared.clone();
        let registry = self.registry.borrow().clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.open(registry, config, connection, auth).await {
                tracing::warn!(error = %e, "Failed to open SSE session");
            }
        });
    }
}

/// Owns the registry and the live sessions
pub struct ToolBox {
    options: ToolBoxOptions,
    registry: CapabilityRegistry,
    published: watch::Sender<Arc<CapabilityRegistry>>,
    shared: Arc<Shared>,
    sse: Option<SseServerHandle>,
}

impl std::fmt::Debug for ToolBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBox")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .field("sessions", &self.sessions().len())
            .finish_non_exhaustive()
    }
}

impl ToolBox {
    /// An orchestrator with an empty registry and no sessions
    pub fn new(options: ToolBoxOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        let (published, _) = watch::channel(Arc::new(CapabilityRegistry::new()));
        Self {
            options,
            registry: CapabilityRegistry::new(),
            published,
            shared: Arc::new(Shared {
                sessions: Mutex::new(Vec::new()),
                events,
            }),
            sse: None,
        }
    }

    pub fn options(&self) -> &ToolBoxOptions {
        &self.options
    }

    /// Everything registered so far
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Register a tool for sessions created from now on
    pub fn add_tool(&mut self, tool: Tool) -> Result<()> {
        self.registry.add_tool(tool)?;
        self.publish();
        Ok(())
    }

    /// Register a fixed resource for sessions created from now on
    pub fn add_resource(&mut self, resource: Resource) -> Result<()> {
        self.registry.add_resource(resource)?;
        self.publish();
        Ok(())
    }

    /// Register a resource template for sessions created from now on
    pub fn add_resource_template(&mut self, template: ResourceTemplate) -> Result<()> {
        self.registry.add_resource_template(template)?;
        self.publish();
        Ok(())
    }

    /// Register a prompt for sessions created from now on
    pub fn add_prompt(&mut self, prompt: Prompt) -> Result<()> {
        self.registry.add_prompt(prompt)?;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.published.send_replace(Arc::new(self.registry.clone()));
    }

    fn acceptor(&self) -> SseAcceptor {
        SseAcceptor {
            shared: self.shared.clone(),
            registry: self.published.subscribe(),
            config: self.options.session_settings(),
            authenticate: self.options.authenticate.clone(),
        }
    }

    /// Start taking connections from `transport`.
    ///
    /// For one-session transports this returns once the session is active.
    /// For SSE it returns once the server is listening.
    pub async fn start(&mut self, transport: TransportKind) -> Result<()> {
        match transport {
            TransportKind::Stdio => {
                let (connection, _tasks) = spawn_stdio();
                self.open(connection).await?;
            }
            TransportKind::Channel(connection) => {
                self.open(connection).await?;
            }
            TransportKind::Sse { endpoint, port } => {
                if self.sse.is_some() {
                    return Err(Error::UnsupportedTransport(
                        "SSE server is already running".to_string(),
                    ));
                }
                let acceptor = Arc::new(self.acceptor());
                let handle = SseServer::new(endpoint, acceptor).serve(port).await?;
                self.sse = Some(handle);
            }
        }
        Ok(())
    }

    async fn open(&self, connection: Connection) -> Result<Session> {
        let registry = self.published.borrow().clone();
        self.shared
            .open(registry, self.options.session_settings(), connection, None)
            .await
    }

    /// [`start`](Self::start), then announce where the server runs
    pub async fn activate(&mut self, transport: TransportKind) -> Result<()> {
        let label = transport.label();
        self.start(transport).await?;
        match &self.sse {
            Some(handle) if label == "sse" => {
                tracing::info!(name = %self.options.name, addr = %handle.local_addr(), "Server is running on sse");
            }
            _ => tracing::info!(name = %self.options.name, "Server is running on {}", label),
        }
        Ok(())
    }

    /// Address of the running SSE server, if any
    pub fn sse_addr(&self) -> Option<std::net::SocketAddr> {
        self.sse.as_ref().map(SseServerHandle::local_addr)
    }

    /// Close every live session, then shut the SSE server down
    pub async fn stop(&mut self) {
        let sessions: Vec<Session> = match self.shared.sessions.lock() {
            Ok(mut sessions) => sessions.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for session in sessions {
            session.close();
            tracing::info!(session_id = %session.id(), "Session disconnected");
            self.shared.emit(ToolBoxEvent::Disconnect { session });
        }

        if let Some(handle) = self.sse.take() {
            handle.shutdown().await;
        }
    }

    /// Sessions currently connected
    pub fn sessions(&self) -> Vec<Session> {
        self.shared
            .sessions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Listen for connects and disconnects
    pub fn subscribe(&self) -> broadcast::Receiver<ToolBoxEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::session::SessionPhase;
    use crate::testing::{TestPeer, TestPeerOptions};
    use crate::tool::ToolBuilder;
    use serde_json::Value;
    use std::time::Duration;

    fn toolbox() -> ToolBox {
        let options = ToolBoxOptions::new("test-box", "2.0.0")
            .instructions("Be nice")
            .session_config(
                SessionConfig::default()
                    .without_heartbeat()
                    .negotiation(5, Duration::from_millis(10)),
            );
        let mut toolbox = ToolBox::new(options);
        toolbox
            .add_tool(
                ToolBuilder::new("hello")
                    .raw_handler(|_args: Value| async { Ok::<_, BoxError>("hi") })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        toolbox
    }

    async fn start_channel(toolbox: &mut ToolBox) -> TestPeer {
        let (server, client) = Connection::pair();
        let peer = TestPeer::new(client, TestPeerOptions::default());
        let (started, initialized) =
            tokio::join!(toolbox.start(TransportKind::Channel(server)), peer.initialize());
        started.unwrap();
        let init = initialized.unwrap();
        assert_eq!(init.server_info.name, "test-box");
        assert_eq!(init.server_info.version, "2.0.0");
        assert_eq!(init.instructions.as_deref(), Some("Be nice"));
        peer
    }

    #[tokio::test]
    async fn test_start_emits_connect() {
        let mut toolbox = toolbox();
        let mut events = toolbox.subscribe();

        let peer = start_channel(&mut toolbox).await;
        assert_eq!(toolbox.sessions().len(), 1);

        match events.recv().await.unwrap() {
            ToolBoxEvent::Connect { session } => {
                assert_eq!(session.phase(), SessionPhase::Active)
            }
            other => panic!("Expected Connect, got {:?}", other),
        }

        let result = peer.call_tool("hello", serde_json::json!({})).await;
        assert_eq!(result.all_text(), "hi");
    }

    #[tokio::test]
    async fn test_peer_hangup_emits_disconnect() {
        let mut toolbox = toolbox();
        let mut events = toolbox.subscribe();
        let mut peer = start_channel(&mut toolbox).await;
        let _ = events.recv().await.unwrap();

        peer.close();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ToolBoxEvent::Disconnect { .. }));
        assert!(toolbox.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_once() {
        let mut toolbox = toolbox();
        let _peer = start_channel(&mut toolbox).await;
        let mut events = toolbox.subscribe();
        let session = toolbox.sessions().pop().unwrap();

        toolbox.stop().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(toolbox.sessions().is_empty());

        assert!(matches!(
            events.recv().await.unwrap(),
            ToolBoxEvent::Disconnect { .. }
        ));
        // the watcher does not announce it a second time
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_changes_do_not_reach_live_sessions() {
        let mut toolbox = toolbox();
        let peer = start_channel(&mut toolbox).await;

        toolbox
            .add_tool(
                ToolBuilder::new("late")
                    .raw_handler(|_args: Value| async { Ok::<_, BoxError>("late") })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let tools = peer.send_request("tools/list", None).await;
        assert_eq!(tools["tools"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sse_connections_see_registry_at_connect_time() {
        let mut toolbox = toolbox();
        let acceptor = toolbox.acceptor();

        toolbox
            .add_tool(
                ToolBuilder::new("late")
                    .raw_handler(|_args: Value| async { Ok::<_, BoxError>("late") })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let (server, client) = Connection::pair();
        let peer = TestPeer::new(client, TestPeerOptions::default());
        acceptor.accept(server, None);
        peer.initialize().await.unwrap();

        let tools = peer.send_request("tools/list", None).await;
        let names: Vec<_> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["hello", "late"]);
    }

    #[tokio::test]
    async fn test_second_sse_server_is_rejected() {
        let mut toolbox = toolbox();
        toolbox
            .start(TransportKind::Sse {
                endpoint: "/sse".to_string(),
                port: 0,
            })
            .await
            .unwrap();
        assert!(toolbox.sse_addr().is_some());

        let err = toolbox
            .start(TransportKind::Sse {
                endpoint: "/sse".to_string(),
                port: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransport(_)));

        toolbox.stop().await;
        assert!(toolbox.sse_addr().is_none());
    }
}
