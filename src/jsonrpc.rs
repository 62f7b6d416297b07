//! JSON-RPC 2.0 service layer
//!
//! [`JsonRpcService`] turns raw JSON-RPC requests (single or batch) into
//! [`RouterRequest`]s for an inner MCP service and renders the results back
//! into JSON-RPC responses. It never fails at the tower level: malformed
//! requests become error responses.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower_service::Service;

use crate::error::JsonRpcError;
use crate::protocol::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseMessage, McpRequest,
};
use crate::router::{RouterRequest, RouterResponse};

/// Service that handles JSON-RPC framing
#[derive(Debug, Clone)]
pub struct JsonRpcService<S> {
    inner: S,
}

impl<S> JsonRpcService<S>
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Process a single JSON-RPC request
    pub async fn call_single(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        process_single_request(self.inner.clone(), req).await
    }

    /// Process a JSON-RPC message (single or batch)
    pub async fn call_message(&self, msg: JsonRpcMessage) -> JsonRpcResponseMessage {
        match msg {
            JsonRpcMessage::Single(req) => {
                JsonRpcResponseMessage::Single(self.call_single(req).await)
            }
            JsonRpcMessage::Batch(requests) if requests.is_empty() => {
                JsonRpcResponseMessage::Single(JsonRpcResponse::error(
                    None,
                    JsonRpcError::invalid_request("Empty batch request"),
                ))
            }
            JsonRpcMessage::Batch(requests) => {
                // batch members run concurrently
                let futures = requests
                    .into_iter()
                    .map(|req| process_single_request(self.inner.clone(), req));
                JsonRpcResponseMessage::Batch(futures::future::join_all(futures).await)
            }
        }
    }
}

impl<S> Service<JsonRpcMessage> for JsonRpcService<S>
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    type Response = JsonRpcResponseMessage;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, msg: JsonRpcMessage) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.call_message(msg).await) })
    }
}

async fn process_single_request<S>(mut inner: S, req: JsonRpcRequest) -> JsonRpcResponse
where
    S: Service<RouterRequest, Response = RouterResponse, Error = Infallible> + Send + 'static,
    S::Future: Send,
{
    if let Err(e) = req.validate() {
        return JsonRpcResponse::error(Some(req.id), e);
    }

    let mcp_request = match McpRequest::from_jsonrpc(&req) {
        Ok(r) => r,
        Err(e) => {
            return JsonRpcResponse::error(
                Some(req.id),
                JsonRpcError::invalid_params(e.to_string()),
            );
        }
    };

    let router_req = RouterRequest {
        id: req.id,
        inner: mcp_request,
    };

    let Ok(response) = inner.call(router_req).await;
    response.into_jsonrpc()
}
