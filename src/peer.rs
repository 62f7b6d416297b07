//! Requests and notifications sent from a session to its peer
//!
//! Both ends of an MCP connection may issue requests. [`PeerLink`] owns the
//! outbound half of the connection and correlates the peer's responses with
//! the requests we sent, by id, through a table of pending oneshot channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::context::ServerNotification;
use crate::error::{Error, Result};
use crate::protocol::{
    CreateMessageParams, CreateMessageResult, EmptyResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListRootsResult, RequestId, Root, methods,
};

/// Requests a session can send to its peer
#[async_trait]
pub trait PeerRequester: Send + Sync {
    /// Liveness check
    async fn ping(&self) -> Result<()>;

    /// Ask the peer for its current roots
    async fn list_roots(&self) -> Result<Vec<Root>>;

    /// Ask the peer to run an LLM completion
    async fn sample(&self, params: CreateMessageParams) -> Result<CreateMessageResult>;
}

/// A clonable handle to a peer requester
pub type PeerRequesterHandle = Arc<dyn PeerRequester>;

type PendingMap = HashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// The outbound half of one connection
pub struct PeerLink {
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("attached", &self.is_attached())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            request_timeout,
        }
    }

    /// Start sending through `sender`
    pub fn attach(&self, sender: mpsc::Sender<String>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(sender);
        }
    }

    /// Stop sending. Dropping the returned sender closes the outbound stream.
    pub fn detach(&self) -> Result<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .ok()
            .and_then(|mut outbound| outbound.take())
            .ok_or_else(|| Error::Transport("Connection already closed".to_string()))
    }

    pub fn is_attached(&self) -> bool {
        self.outbound
            .lock()
            .map(|outbound| outbound.is_some())
            .unwrap_or(false)
    }

    fn sender(&self) -> Result<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .ok()
            .and_then(|outbound| outbound.clone())
            .ok_or_else(|| Error::Transport("Connection closed".to_string()))
    }

    /// Serialize and send one message
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.sender()?
            .send(line)
            .await
            .map_err(|_| Error::Transport("Connection closed".to_string()))
    }

    /// Send a notification to the peer
    pub async fn notify(&self, notification: ServerNotification) -> Result<()> {
        self.send(&notification.into_jsonrpc()?).await
    }

    /// Queue a notification without waiting; dropped if the queue is full
    pub fn try_notify(&self, notification: ServerNotification) {
        let Ok(sender) = self.sender() else {
            return;
        };
        let Ok(message) = notification.into_jsonrpc() else {
            return;
        };
        if let Ok(line) = serde_json::to_string(&message)
            && sender.try_send(line).is_err()
        {
            tracing::debug!("Dropping notification, outbound queue unavailable");
        }
    }

    /// Send a request and wait for the correlated response
    pub async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        self.request_within(method, params, self.request_timeout).await
    }

    /// [`request`](Self::request) with its own deadline
    pub async fn request_within<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<R> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.insert_pending(id.clone(), tx);

        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }

        if let Err(e) = self.send(&request).await {
            self.remove_pending(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response?,
            Ok(Err(_)) => {
                return Err(Error::Transport(format!(
                    "Connection closed before {} completed",
                    method
                )));
            }
            Err(_) => {
                self.remove_pending(&id);
                return Err(Error::Transport(format!("Request {} timed out", method)));
            }
        };

        serde_json::from_value(response).map_err(Error::from)
    }

    /// Ping that gives up after `timeout` instead of the request timeout
    pub async fn ping_within(&self, timeout: Duration) -> Result<()> {
        let _: EmptyResult = self.request_within(methods::PING, None, timeout).await?;
        Ok(())
    }

    /// Deliver a response from the peer to whoever is waiting for it
    pub fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id().cloned() else {
            tracing::warn!("Peer sent an error without a request id");
            return;
        };

        let Some(waiter) = self.remove_pending(&id) else {
            tracing::debug!(id = %id, "Response for unknown request");
            return;
        };

        let outcome = match response {
            JsonRpcResponse::Result(r) => Ok(r.result),
            JsonRpcResponse::Error(e) => Err(Error::JsonRpc(e.error)),
        };
        // the requester may have timed out already
        let _ = waiter.send(outcome);
    }

    /// Fail every request still waiting for the peer
    pub fn fail_pending(&self) {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        for (_, waiter) in drained {
            let _ = waiter.send(Err(Error::Transport("Session closed".to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn insert_pending(&self, id: RequestId, tx: oneshot::Sender<Result<Value>>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
    }

    fn remove_pending(&self, id: &RequestId) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.lock().ok().and_then(|mut p| p.remove(id))
    }
}

#[async_trait]
impl PeerRequester for PeerLink {
    async fn ping(&self) -> Result<()> {
        let _: EmptyResult = self.request(methods::PING, None).await?;
        Ok(())
    }

    async fn list_roots(&self) -> Result<Vec<Root>> {
        let result: ListRootsResult = self.request(methods::ROOTS_LIST, None).await?;
        Ok(result.roots)
    }

    async fn sample(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        let params = serde_json::to_value(&params)?;
        self.request(methods::SAMPLING_CREATE_MESSAGE, Some(params))
            .await
    }
}

impl ServerNotification {
    /// Render as a JSON-RPC notification
    pub fn into_jsonrpc(self) -> Result<JsonRpcNotification> {
        let (method, params) = match self {
            ServerNotification::Progress(params) => (
                crate::protocol::notifications::PROGRESS,
                serde_json::to_value(params)?,
            ),
            ServerNotification::LogMessage(params) => (
                crate::protocol::notifications::MESSAGE,
                serde_json::to_value(params)?,
            ),
        };
        Ok(JsonRpcNotification::new(method).with_params(params))
    }
}
