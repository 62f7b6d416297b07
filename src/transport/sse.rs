//! Server-sent events transport for MCP
//!
//! Each peer opens an SSE stream with `GET {endpoint}`. The first event,
//! `endpoint`, tells it where to POST its messages:
//! `/messages?sessionId=<id>`. Every JSON-RPC line the session sends after
//! that arrives as a `message` event. POSTed bodies are fed to the session's
//! inbound side and acknowledged with `202 Accepted`.
//!
//! Closing the stream hangs up the session, and a session that closes ends
//! its stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{CHANNEL_CAPACITY, Connection};
use crate::context::AuthPayload;
use crate::error::{Error, Result};

/// Path peers POST their messages to
pub const MESSAGES_PATH: &str = "/messages";

const SSE_ENDPOINT_EVENT: &str = "endpoint";
const SSE_MESSAGE_EVENT: &str = "message";

/// Receives the connections an SSE server accepts
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    /// Vet a new stream from its request headers. An error answers 401.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<AuthPayload>>;

    /// Take ownership of a newly opened connection
    fn accept(&self, connection: Connection, auth: Option<AuthPayload>);
}

type Inboxes = Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>;

struct AppState {
    endpoint: String,
    acceptor: Arc<dyn ConnectionAcceptor>,
    inboxes: Inboxes,
}

/// Removes a stream's inbox when the stream goes away, which hangs up the
/// session behind it
struct InboxGuard {
    id: String,
    inboxes: Inboxes,
}

impl Drop for InboxGuard {
    fn drop(&mut self) {
        if let Ok(mut inboxes) = self.inboxes.lock()
            && inboxes.remove(&self.id).is_some()
        {
            tracing::debug!(connection_id = %self.id, "SSE stream closed");
        }
    }
}

/// SSE server builder
pub struct SseServer {
    endpoint: String,
    acceptor: Arc<dyn ConnectionAcceptor>,
}

impl SseServer {
    /// Serve streams at `endpoint` (e.g. `/sse`)
    pub fn new(endpoint: impl Into<String>, acceptor: Arc<dyn ConnectionAcceptor>) -> Self {
        let mut endpoint = endpoint.into();
        if !endpoint.starts_with('/') {
            endpoint.insert(0, '/');
        }
        Self { endpoint, acceptor }
    }

    /// The axum router, for embedding or in-process tests
    pub fn into_router(self) -> Router {
        let state = Arc::new(AppState {
            endpoint: self.endpoint.clone(),
            acceptor: self.acceptor,
            inboxes: Arc::new(Mutex::new(HashMap::new())),
        });

        Router::new()
            .route(&self.endpoint, get(handle_stream))
            .route(MESSAGES_PATH, post(handle_message))
            .with_state(state)
    }

    /// Bind `0.0.0.0:{port}` and serve in the background
    pub async fn serve(self, port: u16) -> Result<SseServerHandle> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to read local address: {}", e)))?;

        tracing::info!(addr = %local_addr, endpoint = %self.endpoint, "MCP SSE transport listening");

        let router = self.into_router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "SSE server error");
            }
        });

        Ok(SseServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// A running SSE server
#[derive(Debug)]
pub struct SseServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SseServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, give open requests a moment to finish, then stop
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!("SSE server did not drain in time, aborting");
            self.task.abort();
        }
        tracing::info!("MCP SSE transport stopped");
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: String,
}

/// GET {endpoint}: open a stream and hand its connection to the acceptor
async fn handle_stream(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let auth = match state.acceptor.authenticate(&headers).await {
        Ok(auth) => auth,
        Err(e) => {
            tracing::info!(error = %e, "SSE connection rejected");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

    if let Ok(mut inboxes) = state.inboxes.lock() {
        inboxes.insert(id.clone(), in_tx);
    }
    tracing::info!(connection_id = %id, endpoint = %state.endpoint, "SSE stream opened");

    state.acceptor.accept(Connection::new(in_rx, out_tx), auth);

    let guard = InboxGuard {
        id: id.clone(),
        inboxes: state.inboxes.clone(),
    };
    let endpoint = Event::default()
        .event(SSE_ENDPOINT_EVENT)
        .data(format!("{}?sessionId={}", MESSAGES_PATH, id));
    let messages = ReceiverStream::new(out_rx).map(move |line| {
        let _guard = &guard;
        Ok::<_, Infallible>(Event::default().event(SSE_MESSAGE_EVENT).data(line))
    });
    let stream = tokio_stream::once(Ok::<_, Infallible>(endpoint)).chain(messages);

    Sse::new(stream)
        .keep_alive(
            axum::response::sse::KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("ping"),
        )
        .into_response()
}

/// POST /messages?sessionId=...: feed one message to the session
async fn handle_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let inbox = state
        .inboxes
        .lock()
        .ok()
        .and_then(|inboxes| inboxes.get(&query.session_id).cloned());

    let Some(inbox) = inbox else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    if inbox.send(body).await.is_err() {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Collecting {
        allow: bool,
        accepted: Mutex<Vec<Connection>>,
    }

    #[async_trait]
    impl ConnectionAcceptor for Collecting {
        async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<AuthPayload>> {
            if self.allow {
                Ok(None)
            } else {
                Err(Error::Internal("no token".to_string()))
            }
        }

        fn accept(&self, connection: Connection, _auth: Option<AuthPayload>) {
            self.accepted.lock().unwrap().push(connection);
        }
    }

    fn acceptor(allow: bool) -> Arc<Collecting> {
        Arc::new(Collecting {
            allow,
            accepted: Mutex::new(Vec::new()),
        })
    }

    fn get_stream() -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri("/sse")
            .header("Accept", "text/event-stream")
            .body(Body::empty())
            .unwrap()
    }

    fn post_message(session_id: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/messages?sessionId={}", session_id))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_announces_endpoint_and_accepts_posts() {
        let acceptor = acceptor(true);
        let app = SseServer::new("/sse", acceptor.clone()).into_router();

        let response = app.clone().oneshot(get_stream()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.contains("event: endpoint"));

        let data = first
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap()
            .to_string();
        let session_id = data.strip_prefix("/messages?sessionId=").unwrap();

        let response = app
            .clone()
            .oneshot(post_message(session_id, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut connection = acceptor.accepted.lock().unwrap().pop().unwrap();
        assert_eq!(
            connection.inbound.recv().await.unwrap(),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#
        );

        connection
            .outbound
            .send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string())
            .await
            .unwrap();
        let next = body.next().await.unwrap().unwrap();
        let next = String::from_utf8(next.to_vec()).unwrap();
        assert!(next.contains("event: message"));
        assert!(next.contains(r#"data: {"jsonrpc":"2.0","id":1,"result":{}}"#));
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = SseServer::new("/sse", acceptor(true)).into_router();
        let response = app.oneshot(post_message("nope", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rejected_authentication_is_401() {
        let acceptor = acceptor(false);
        let app = SseServer::new("sse", acceptor.clone()).into_router();
        let response = app.oneshot(get_stream()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(acceptor.accepted.lock().unwrap().is_empty());
    }
}
