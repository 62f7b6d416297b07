//! Test utilities for MCP sessions.
//!
//! [`TestPeer`] plays the client side of a [`Connection`]: it sends requests
//! and notifications as JSON lines, correlates the session's responses by id,
//! and answers the requests a session makes of its peer (`ping`,
//! `roots/list`, `sampling/createMessage`) from canned options.
//!
//! ```rust
//! use std::sync::Arc;
//! use toolbox_mcp::error::BoxError;
//! use toolbox_mcp::registry::CapabilityRegistry;
//! use toolbox_mcp::session::{Session, SessionConfig};
//! use toolbox_mcp::testing::{TestPeer, TestPeerOptions};
//! use toolbox_mcp::tool::ToolBuilder;
//! use serde_json::{Value, json};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut registry = CapabilityRegistry::new();
//! registry
//!     .add_tool(
//!         ToolBuilder::new("echo")
//!             .raw_handler(|args: Value| async move {
//!                 Ok::<_, BoxError>(args["message"].as_str().unwrap_or_default().to_string())
//!             })
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let session = Session::new(Arc::new(registry), SessionConfig::default().without_heartbeat(), None);
//! let peer = TestPeer::connect_session(&session, TestPeerOptions::default())
//!     .await
//!     .unwrap();
//!
//! let result = peer.call_tool("echo", json!({"message": "hello"})).await;
//! assert_eq!(result.all_text(), "hello");
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{
    CallToolResult, ClientCapabilities, CreateMessageResult, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, LATEST_PROTOCOL_VERSION, RequestId, Root, RootsCapability,
    SamplingCapability, methods, notifications,
};
use crate::session::Session;
use crate::transport::Connection;

/// How a [`TestPeer`] presents itself and answers the session
#[derive(Debug, Clone)]
pub struct TestPeerOptions {
    pub capabilities: ClientCapabilities,
    pub roots: Vec<Root>,
    pub sampling_reply: Option<CreateMessageResult>,
    pub fail_pings: bool,
    /// Leave pings unanswered, like a peer that stopped reading
    pub ignore_pings: bool,
    /// How long to wait for any single response
    pub timeout: Duration,
}

impl Default for TestPeerOptions {
    fn default() -> Self {
        Self {
            capabilities: ClientCapabilities::default(),
            roots: Vec::new(),
            sampling_reply: None,
            fail_pings: false,
            ignore_pings: false,
            timeout: Duration::from_secs(5),
        }
    }
}

impl TestPeerOptions {
    /// Declare the roots capability and serve `roots`
    pub fn with_roots(mut self, roots: Vec<Root>) -> Self {
        self.capabilities.roots = Some(RootsCapability { list_changed: true });
        self.roots = roots;
        self
    }

    /// Declare the sampling capability and answer every request with `reply`
    pub fn with_sampling(mut self, reply: CreateMessageResult) -> Self {
        self.capabilities.sampling = Some(SamplingCapability {});
        self.sampling_reply = Some(reply);
        self
    }

    /// Answer pings with an error
    pub fn failing_pings(mut self) -> Self {
        self.fail_pings = true;
        self
    }

    /// Never answer pings
    pub fn silent_pings(mut self) -> Self {
        self.ignore_pings = true;
        self
    }
}

struct Shared {
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    waiting: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    received: Mutex<Vec<String>>,
    roots: Mutex<Vec<Root>>,
    fail_pings: AtomicBool,
    ignore_pings: bool,
    sampling_reply: Option<CreateMessageResult>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound.lock().ok().and_then(|o| o.clone())
    }

    async fn send_line(&self, line: String) -> Result<()> {
        let sender = self
            .sender()
            .ok_or_else(|| Error::Transport("Test peer closed".to_string()))?;
        sender
            .send(line)
            .await
            .map_err(|_| Error::Transport("Session hung up".to_string()))
    }

    fn answer(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let response = match request.method.as_str() {
            methods::PING if self.ignore_pings => return None,
            methods::PING if self.fail_pings.load(Ordering::SeqCst) => {
                JsonRpcResponse::error(Some(id), JsonRpcError::internal_error("ping refused"))
            }
            methods::PING => JsonRpcResponse::result(id, json!({})),
            methods::ROOTS_LIST => {
                let roots = self.roots.lock().map(|r| r.clone()).unwrap_or_default();
                JsonRpcResponse::result(id, json!({ "roots": roots }))
            }
            methods::SAMPLING_CREATE_MESSAGE => match &self.sampling_reply {
                Some(reply) => match serde_json::to_value(reply) {
                    Ok(value) => JsonRpcResponse::result(id, value),
                    Err(e) => JsonRpcResponse::error(
                        Some(id),
                        JsonRpcError::internal_error(e.to_string()),
                    ),
                },
                None => JsonRpcResponse::error(
                    Some(id),
                    JsonRpcError::method_not_found(&request.method),
                ),
            },
            other => JsonRpcResponse::error(Some(id), JsonRpcError::method_not_found(other)),
        };
        Some(response)
    }
}

/// The client half of an in-memory MCP connection
pub struct TestPeer {
    shared: Arc<Shared>,
    notifications: mpsc::UnboundedReceiver<JsonRpcNotification>,
    stray: mpsc::UnboundedReceiver<JsonRpcResponse>,
    capabilities: ClientCapabilities,
    next_id: AtomicI64,
    timeout: Duration,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for TestPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPeer")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl TestPeer {
    /// Drive the peer end of a connection
    pub fn new(connection: Connection, options: TestPeerOptions) -> Self {
        let Connection { inbound, outbound } = connection;
        let shared = Arc::new(Shared {
            outbound: Mutex::new(Some(outbound)),
            waiting: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            roots: Mutex::new(options.roots),
            fail_pings: AtomicBool::new(options.fail_pings),
            ignore_pings: options.ignore_pings,
            sampling_reply: options.sampling_reply,
        });

        let (notif_tx, notifications) = mpsc::unbounded_channel();
        let (stray_tx, stray) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(shared.clone(), inbound, notif_tx, stray_tx));

        Self {
            shared,
            notifications,
            stray,
            capabilities: options.capabilities,
            next_id: AtomicI64::new(1),
            timeout: options.timeout,
            pump,
        }
    }

    /// Connect `session` to a fresh peer and run the handshake
    pub async fn connect_session(session: &Session, options: TestPeerOptions) -> Result<TestPeer> {
        let (server, client) = Connection::pair();
        let peer = TestPeer::new(client, options);
        let (connected, initialized) = tokio::join!(session.connect(server), peer.initialize());
        connected?;
        initialized?;
        Ok(peer)
    }

    /// Send `initialize` and then `notifications/initialized`
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let result = self
            .call(
                "initialize",
                Some(json!({
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": self.capabilities,
                    "clientInfo": { "name": "test-peer", "version": "1.0.0" }
                })),
            )
            .await?;
        self.notify(notifications::INITIALIZED, None).await?;
        Ok(serde_json::from_value(result)?)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, id: RequestId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiting) = self.shared.waiting.lock() {
            waiting.insert(id, tx);
        }
        rx
    }

    async fn wait(&self, method: &str, rx: oneshot::Receiver<JsonRpcResponse>) -> Result<JsonRpcResponse> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "Session hung up before answering {}",
                method
            ))),
            Err(_) => Err(Error::Transport(format!("Timed out waiting for {}", method))),
        }
    }

    /// Send a request and return the raw response
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        let rx = self.register(id);
        self.shared.send_line(serde_json::to_string(&request)?).await?;
        self.wait(method, rx).await
    }

    /// Send a request; a JSON-RPC error becomes `Err(Error::JsonRpc)`
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match self.request(method, params).await? {
            JsonRpcResponse::Result(r) => Ok(r.result),
            JsonRpcResponse::Error(e) => Err(Error::JsonRpc(e.error)),
        }
    }

    /// Send several requests as one batch line and wait for every response
    pub async fn batch(&self, requests: Vec<(&str, Option<Value>)>) -> Result<Vec<JsonRpcResponse>> {
        let mut lines = Vec::new();
        let mut waiters = Vec::new();
        for (method, params) in requests {
            let id = self.next_id();
            let mut request = JsonRpcRequest::new(id.clone(), method);
            if let Some(params) = params {
                request = request.with_params(params);
            }
            waiters.push((method.to_string(), self.register(id)));
            lines.push(request);
        }

        self.shared.send_line(serde_json::to_string(&lines)?).await?;

        let mut responses = Vec::with_capacity(waiters.len());
        for (method, rx) in waiters {
            responses.push(self.wait(&method, rx).await?);
        }
        Ok(responses)
    }

    /// Send a request and return its result. Panics on any error.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Value {
        match self.call(method, params).await {
            Ok(result) => result,
            Err(e) => panic!("{} failed: {}", method, e),
        }
    }

    /// Send a request that must fail with a JSON-RPC error. Panics otherwise.
    pub async fn send_request_expect_error(&self, method: &str, params: Option<Value>) -> JsonRpcError {
        match self.call(method, params).await {
            Err(Error::JsonRpc(err)) => err,
            Ok(result) => panic!("expected {} to fail, but it returned {}", method, result),
            Err(e) => panic!("{} failed without a JSON-RPC error: {}", method, e),
        }
    }

    /// Call a tool. Panics on JSON-RPC errors.
    pub async fn call_tool(&self, name: &str, args: Value) -> CallToolResult {
        let raw = self
            .send_request("tools/call", Some(json!({ "name": name, "arguments": args })))
            .await;
        match serde_json::from_value(raw) {
            Ok(result) => result,
            Err(e) => panic!("failed to deserialize CallToolResult: {}", e),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notification = JsonRpcNotification::new(method);
        if let Some(params) = params {
            notification = notification.with_params(params);
        }
        self.shared
            .send_line(serde_json::to_string(&notification)?)
            .await
    }

    /// Send an arbitrary line, valid JSON or not
    pub async fn send_raw(&self, line: impl Into<String>) -> Result<()> {
        self.shared.send_line(line.into()).await
    }

    /// Next notification from the session, or `None` after the timeout
    pub async fn next_notification(&mut self) -> Option<JsonRpcNotification> {
        tokio::time::timeout(self.timeout, self.notifications.recv())
            .await
            .ok()
            .flatten()
    }

    /// Notifications already received, without waiting
    pub fn drain_notifications(&mut self) -> Vec<JsonRpcNotification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }

    /// Next response that matched none of our requests (e.g. a parse error)
    pub async fn next_stray_response(&mut self) -> Option<JsonRpcResponse> {
        tokio::time::timeout(self.timeout, self.stray.recv())
            .await
            .ok()
            .flatten()
    }

    /// Change the roots served to later `roots/list` requests
    pub fn set_roots(&self, roots: Vec<Root>) {
        if let Ok(mut current) = self.shared.roots.lock() {
            *current = roots;
        }
    }

    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Methods of every request the session sent us, in order
    pub fn received_methods(&self) -> Vec<String> {
        self.shared
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Hang up. The session sees end of input.
    pub fn close(&mut self) {
        if let Ok(mut outbound) = self.shared.outbound.lock() {
            outbound.take();
        }
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_pump(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<String>,
    notifications: mpsc::UnboundedSender<JsonRpcNotification>,
    stray: mpsc::UnboundedSender<JsonRpcResponse>,
) {
    while let Some(line) = inbound.recv().await {
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            tracing::warn!(line = %line, "Test peer received invalid JSON");
            continue;
        };
        let items = match value {
            Value::Array(items) => items,
            single => vec![single],
        };

        for item in items {
            if item.get("method").is_none() {
                let Ok(response) = serde_json::from_value::<JsonRpcResponse>(item) else {
                    continue;
                };
                let waiter = response
                    .id()
                    .and_then(|id| shared.waiting.lock().ok()?.remove(id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => {
                        let _ = stray.send(response);
                    }
                }
            } else if item.get("id").is_none() {
                if let Ok(notification) = serde_json::from_value(item) {
                    let _ = notifications.send(notification);
                }
            } else if let Ok(request) = serde_json::from_value::<JsonRpcRequest>(item) {
                if let Ok(mut received) = shared.received.lock() {
                    received.push(request.method.clone());
                }
                let Some(answer) = shared.answer(&request) else {
                    continue;
                };
                match serde_json::to_string(&answer) {
                    Ok(line) => {
                        if shared.send_line(line).await.is_err() {
                            tracing::debug!("Test peer could not answer, session gone");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Test peer failed to encode answer"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_answers_session_requests() {
        let (mut server, client) = Connection::pair();
        let root = Root {
            uri: "file:///work".to_string(),
            name: None,
        };
        let peer = TestPeer::new(client, TestPeerOptions::default().with_roots(vec![root.clone()]));

        let ping = JsonRpcRequest::new(7, "ping");
        server
            .outbound
            .send(serde_json::to_string(&ping).unwrap())
            .await
            .unwrap();
        let answer: JsonRpcResponse =
            serde_json::from_str(&server.inbound.recv().await.unwrap()).unwrap();
        assert_eq!(answer.id(), Some(&RequestId::Number(7)));
        assert!(matches!(answer, JsonRpcResponse::Result(_)));

        peer.fail_pings(true);
        let ping = JsonRpcRequest::new(8, "ping");
        server
            .outbound
            .send(serde_json::to_string(&ping).unwrap())
            .await
            .unwrap();
        let answer: JsonRpcResponse =
            serde_json::from_str(&server.inbound.recv().await.unwrap()).unwrap();
        assert!(matches!(answer, JsonRpcResponse::Error(_)));

        let list = JsonRpcRequest::new(9, "roots/list");
        server
            .outbound
            .send(serde_json::to_string(&list).unwrap())
            .await
            .unwrap();
        let answer: JsonRpcResponse =
            serde_json::from_str(&server.inbound.recv().await.unwrap()).unwrap();
        match answer {
            JsonRpcResponse::Result(r) => assert_eq!(r.result["roots"][0]["uri"], "file:///work"),
            other => panic!("Expected roots, got {:?}", other),
        }

        assert_eq!(peer.received_methods(), vec!["ping", "ping", "roots/list"]);
    }
}
