//! Request dispatch for one session
//!
//! [`SessionRouter`] implements `Service<RouterRequest>` and answers every
//! MCP request kind from the session's registry snapshot. Structural problems
//! (unknown names, bad arguments) come back as JSON-RPC errors; failures
//! inside tool code come back as error-flagged call results.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::json;
use tower_service::Service;

use crate::completion::{self, CompletionSource};
use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{
    CallToolParams, CompleteParams, CompleteResult, CompletionReference, EmptyResult,
    GetPromptParams, InitializeParams, InitializeResult, JsonRpcResponse,
    LATEST_PROTOCOL_VERSION, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, McpRequest, McpResponse, ReadResourceParams, ReadResourceResult, RequestId,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::session::{SessionPhase, SessionState};

/// Request type for the tower Service implementation
#[derive(Debug)]
pub struct RouterRequest {
    pub id: RequestId,
    pub inner: McpRequest,
}

/// Response type for the tower Service implementation
#[derive(Debug)]
pub struct RouterResponse {
    pub id: RequestId,
    pub inner: std::result::Result<McpResponse, JsonRpcError>,
}

impl RouterResponse {
    /// Convert to JSON-RPC response
    pub fn into_jsonrpc(self) -> JsonRpcResponse {
        match self.inner {
            Ok(response) => match serde_json::to_value(response) {
                Ok(result) => JsonRpcResponse::result(self.id, result),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize response");
                    JsonRpcResponse::error(
                        Some(self.id),
                        JsonRpcError::internal_error(format!("Serialization error: {}", e)),
                    )
                }
            },
            Err(error) => JsonRpcResponse::error(Some(self.id), error),
        }
    }
}

/// Answers MCP requests on behalf of one session
#[derive(Clone)]
pub struct SessionRouter {
    state: Arc<SessionState>,
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("session_id", &self.state.id)
            .finish_non_exhaustive()
    }
}

impl SessionRouter {
    pub(crate) fn new(state: Arc<SessionState>) -> Self {
        Self { state }
    }

    /// Hold requests until the session is active; refuse them once it closes.
    async fn admit(&self, request: &McpRequest) -> Result<()> {
        let phase = match request {
            McpRequest::Initialize(_) | McpRequest::Ping => self.state.phase(),
            _ => {
                let mut phases = self.state.watch_phase();
                phases
                    .wait_for(|p| *p >= SessionPhase::Active)
                    .await
                    .map(|p| *p)
                    .unwrap_or(SessionPhase::Closed)
            }
        };

        if phase >= SessionPhase::Closing {
            tracing::debug!(
                session_id = %self.state.id,
                method = %request.method_name(),
                "Request rejected: session closing"
            );
            return Err(JsonRpcError::invalid_request("Session is closing").into());
        }
        Ok(())
    }

    async fn handle(&self, request_id: RequestId, request: McpRequest) -> Result<McpResponse> {
        self.admit(&request).await?;

        let registry = &self.state.registry;
        match request {
            McpRequest::Initialize(params) => Ok(McpResponse::Initialize(self.initialize(params))),

            McpRequest::Ping => Ok(McpResponse::Pong(EmptyResult {})),

            McpRequest::ListTools(_) => Ok(McpResponse::ListTools(ListToolsResult {
                tools: registry.tools().iter().map(|t| t.definition()).collect(),
                next_cursor: None,
            })),

            McpRequest::CallTool(params) => self.call_tool(request_id, params).await,

            McpRequest::ListResources(_) => Ok(McpResponse::ListResources(ListResourcesResult {
                resources: registry.resources().iter().map(|r| r.definition()).collect(),
                next_cursor: None,
            })),

            McpRequest::ListResourceTemplates(_) => Ok(McpResponse::ListResourceTemplates(
                ListResourceTemplatesResult {
                    resource_templates: registry
                        .templates()
                        .iter()
                        .map(|t| t.definition())
                        .collect(),
                    next_cursor: None,
                },
            )),

            McpRequest::ReadResource(params) => self.read_resource(params).await,

            McpRequest::ListPrompts(_) => Ok(McpResponse::ListPrompts(ListPromptsResult {
                prompts: registry.prompts().iter().map(|p| p.definition()).collect(),
                next_cursor: None,
            })),

            McpRequest::GetPrompt(params) => self.get_prompt(params).await,

            McpRequest::SetLoggingLevel(params) => {
                tracing::debug!(session_id = %self.state.id, level = %params.level, "Logging level set");
                self.state.set_log_level(params.level);
                Ok(McpResponse::SetLoggingLevel(EmptyResult {}))
            }

            McpRequest::Complete(params) => self.complete(params).await,

            McpRequest::Unknown { method, .. } => {
                Err(JsonRpcError::method_not_found(&method).into())
            }
        }
    }

    fn initialize(&self, params: InitializeParams) -> InitializeResult {
        // echo the peer's version when we speak it, else offer our latest
        let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str())
        {
            params.protocol_version
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        };

        self.state.record_peer(params.capabilities, params.client_info);

        InitializeResult {
            protocol_version,
            capabilities: self.state.registry.capabilities(),
            server_info: self.state.config.server_info.clone(),
            instructions: self.state.config.instructions.clone(),
        }
    }

    async fn call_tool(&self, request_id: RequestId, params: CallToolParams) -> Result<McpResponse> {
        let tool = self
            .state
            .registry
            .tool(&params.name)
            .ok_or_else(|| JsonRpcError::unknown_tool(&params.name))?;

        let arguments = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };

        if let Err(errors) = tool.validate(&arguments) {
            tracing::debug!(tool = %params.name, ?errors, "Tool arguments rejected");
            return Err(JsonRpcError::invalid_params(format!("Invalid {} parameters", params.name))
                .with_data(json!(errors))
                .into());
        }

        let progress_token = params.meta.and_then(|m| m.progress_token);
        let ctx = self.state.tool_context(request_id, progress_token);

        tracing::debug!(session_id = %self.state.id, tool = %params.name, "Calling tool");
        let result = tool.call_with_context(ctx, arguments).await;
        Ok(McpResponse::CallTool(result))
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<McpResponse> {
        let registry = &self.state.registry;
        let uri = params.uri;

        let contents = if let Some(resource) = registry.resource(&uri) {
            resource.read().await
        } else if let Some((template, variables)) = registry.match_template(&uri) {
            template.read(&uri, variables).await.map(|c| vec![c])
        } else {
            return Err(JsonRpcError::resource_not_found(&uri).into());
        };

        let contents = contents.map_err(|e| {
            JsonRpcError::internal_error(format!("Error reading resource: {}", e))
                .with_data(json!({ "uri": uri }))
        })?;
        Ok(McpResponse::ReadResource(ReadResourceResult { contents }))
    }

    async fn get_prompt(&self, params: GetPromptParams) -> Result<McpResponse> {
        let prompt = self
            .state
            .registry
            .prompt(&params.name)
            .ok_or_else(|| JsonRpcError::unknown_prompt(&params.name))?;

        if let Some(missing) = prompt.missing_required(&params.arguments) {
            return Err(JsonRpcError::invalid_request(format!(
                "Missing required argument: {}",
                missing
            ))
            .into());
        }

        let result = prompt.get(params.arguments).await.map_err(|e| {
            JsonRpcError::internal_error(format!("Error loading prompt: {}", e))
                .with_data(json!({ "name": params.name }))
        })?;
        Ok(McpResponse::GetPrompt(result))
    }

    async fn complete(&self, params: CompleteParams) -> Result<McpResponse> {
        let registry = &self.state.registry;
        let argument = &params.argument;

        let source: Option<CompletionSource> = match &params.reference {
            CompletionReference::Prompt { name } => {
                let prompt = registry.prompt(name).ok_or_else(|| {
                    Error::unexpected_state_with("Unknown prompt", json!({ "ref": params.reference }))
                })?;
                if !prompt.can_complete() {
                    return Err(Error::unexpected_state_with(
                        "Prompt does not support completion",
                        json!({ "ref": params.reference }),
                    ));
                }
                prompt.completion_source(&argument.name)
            }
            CompletionReference::Resource { uri } => {
                if let Some(template) = registry.template(uri) {
                    if !template.can_complete() {
                        return Err(Error::unexpected_state_with(
                            "Resource template does not support completion",
                            json!({ "ref": params.reference }),
                        ));
                    }
                    template.completion_source(&argument.name)
                } else if let Some(resource) = registry.resource(uri) {
                    if !resource.can_complete() {
                        return Err(Error::unexpected_state_with(
                            "Resource does not support completion",
                            json!({ "ref": params.reference }),
                        ));
                    }
                    resource.completion_source(&argument.name)
                } else {
                    return Err(Error::unexpected_state_with(
                        "Unknown resource",
                        json!({ "ref": params.reference }),
                    ));
                }
            }
        };

        let completion = completion::resolve(&source.unwrap_or_default(), &argument.value).await?;
        Ok(McpResponse::Complete(CompleteResult { completion }))
    }
}

impl Service<RouterRequest> for SessionRouter {
    type Response = RouterResponse;
    type Error = Infallible; // errors travel inside the response
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RouterRequest) -> Self::Future {
        let router = self.clone();
        Box::pin(async move {
            let result = router.handle(req.id.clone(), req.inner).await;
            Ok(RouterResponse {
                id: req.id,
                inner: result.map_err(Error::into_jsonrpc),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BoxError, ErrorCode, UserError};
    use crate::prompt::{PromptArgument, PromptBuilder};
    use crate::protocol::{
        CompletionArgument, Content, GetPromptParams, ListToolsParams, RequestMeta,
    };
    use crate::registry::CapabilityRegistry;
    use crate::resource::{ResourceBody, ResourceBuilder, ResourceTemplateBuilder};
    use crate::session::{Session, SessionConfig};
    use crate::testing::{TestPeer, TestPeerOptions};
    use crate::tool::ToolBuilder;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    fn registry(calls: Arc<AtomicUsize>) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();

        let counter = calls.clone();
        registry
            .add_tool(
                ToolBuilder::new("add")
                    .description("Add two numbers")
                    .handler(move |input: AddInput| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, BoxError>(format!("{}", input.a + input.b))
                        }
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        registry
            .add_tool(
                ToolBuilder::new("refuse")
                    .raw_handler(|_args: serde_json::Value| async {
                        Err::<String, BoxError>(UserError::new("Not today").into())
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        registry
            .add_resource(
                ResourceBuilder::new("items://all")
                    .name("All items")
                    .mime_type("application/json")
                    .text("[]"),
            )
            .unwrap();

        registry
            .add_resource_template(
                ResourceTemplateBuilder::new("items/{id}")
                    .name("Item")
                    .handler(|vars: HashMap<String, String>| async move {
                        if vars["id"] == "0" {
                            return Err::<ResourceBody, BoxError>("no such item".into());
                        }
                        Ok(ResourceBody::Text(format!("item {}", vars["id"])))
                    })
                    .unwrap(),
            )
            .unwrap();

        let counter = calls;
        registry
            .add_prompt(
                PromptBuilder::new("greet")
                    .required_arg("name", "Who to greet")
                    .argument(PromptArgument::new("language").enum_values(["english", "french"]))
                    .handler(move |args: HashMap<String, String>| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, BoxError>(format!("Hello, {}!", args["name"]))
                        }
                    }),
            )
            .unwrap();

        registry
    }

    async fn active_session() -> (Session, TestPeer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let session = Session::new(
            Arc::new(registry(calls.clone())),
            SessionConfig::default()
                .without_heartbeat()
                .negotiation(5, Duration::from_millis(10)),
            None,
        );
        let peer = TestPeer::connect_session(&session, TestPeerOptions::default())
            .await
            .unwrap();
        (session, peer, calls)
    }

    async fn call(router: &mut SessionRouter, inner: McpRequest) -> RouterResponse {
        let req = RouterRequest {
            id: RequestId::Number(1),
            inner,
        };
        router.ready().await.unwrap().call(req).await.unwrap()
    }

    #[tokio::test]
    async fn test_list_tools_in_registration_order() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        match call(&mut router, McpRequest::ListTools(ListToolsParams::default()))
            .await
            .inner
        {
            Ok(McpResponse::ListTools(result)) => {
                let names: Vec<_> = result.tools.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["add", "refuse"]);
                assert_eq!(result.tools[0].input_schema["type"], "object");
            }
            other => panic!("Expected ListTools response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_tool() {
        let (session, _peer, calls) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::CallTool(CallToolParams {
                name: "add".to_string(),
                arguments: json!({"a": 2, "b": 3}),
                meta: Some(RequestMeta::default()),
            }),
        )
        .await;

        match resp.inner {
            Ok(McpResponse::CallTool(result)) => {
                assert!(!result.is_error);
                assert_eq!(result.content, vec![Content::text("5")]);
            }
            other => panic!("Expected CallTool response, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_reach_the_tool() {
        let (session, _peer, calls) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::CallTool(CallToolParams {
                name: "add".to_string(),
                arguments: json!({"a": "two"}),
                meta: None,
            }),
        )
        .await;

        let err = resp.inner.unwrap_err();
        assert!(err.is(ErrorCode::InvalidParams));
        assert_eq!(err.message, "Invalid add parameters");
        assert!(err.data.as_ref().unwrap().as_array().unwrap().len() >= 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::CallTool(CallToolParams {
                name: "nope".to_string(),
                arguments: json!({}),
                meta: None,
            }),
        )
        .await;
        let err = resp.inner.unwrap_err();
        assert!(err.is(ErrorCode::MethodNotFound));
        assert_eq!(err.message, "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_user_error_is_verbatim() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::CallTool(CallToolParams {
                name: "refuse".to_string(),
                arguments: serde_json::Value::Null,
                meta: None,
            }),
        )
        .await;
        match resp.inner {
            Ok(McpResponse::CallTool(result)) => {
                assert!(result.is_error);
                assert_eq!(result.content, vec![Content::text("Not today")]);
            }
            other => panic!("Expected CallTool response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_resources() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let read = |uri: &str| {
            McpRequest::ReadResource(ReadResourceParams {
                uri: uri.to_string(),
            })
        };

        match call(&mut router, read("items://all")).await.inner {
            Ok(McpResponse::ReadResource(result)) => {
                assert_eq!(result.contents.len(), 1);
                assert_eq!(result.contents[0].text.as_deref(), Some("[]"));
                assert_eq!(result.contents[0].mime_type.as_deref(), Some("application/json"));
            }
            other => panic!("Expected ReadResource response, got {:?}", other),
        }

        match call(&mut router, read("items/42")).await.inner {
            Ok(McpResponse::ReadResource(result)) => {
                assert_eq!(result.contents[0].uri, "items/42");
                assert_eq!(result.contents[0].text.as_deref(), Some("item 42"));
            }
            other => panic!("Expected ReadResource response, got {:?}", other),
        }

        let err = call(&mut router, read("nothing://here")).await.inner.unwrap_err();
        assert_eq!(err.message, "Unknown resource: nothing://here");

        let err = call(&mut router, read("items/0")).await.inner.unwrap_err();
        assert!(err.is(ErrorCode::InternalError));
        assert_eq!(err.message, "Error reading resource: no such item");
        assert_eq!(err.data, Some(json!({"uri": "items/0"})));
    }

    #[tokio::test]
    async fn test_missing_prompt_argument_skips_loader() {
        let (session, _peer, calls) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::GetPrompt(GetPromptParams {
                name: "greet".to_string(),
                arguments: HashMap::new(),
            }),
        )
        .await;
        let err = resp.inner.unwrap_err();
        assert!(err.is(ErrorCode::InvalidRequest));
        assert_eq!(err.message, "Missing required argument: name");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let resp = call(
            &mut router,
            McpRequest::GetPrompt(GetPromptParams {
                name: "greet".to_string(),
                arguments: HashMap::from([("name".to_string(), "Ada".to_string())]),
            }),
        )
        .await;
        match resp.inner {
            Ok(McpResponse::GetPrompt(result)) => {
                assert_eq!(result.messages[0].content, Content::text("Hello, Ada!"));
            }
            other => panic!("Expected GetPrompt response, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_dispatch() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let complete = |reference: CompletionReference, name: &str, value: &str| {
            McpRequest::Complete(CompleteParams {
                reference,
                argument: CompletionArgument {
                    name: name.to_string(),
                    value: value.to_string(),
                },
            })
        };

        let resp = call(
            &mut router,
            complete(
                CompletionReference::Prompt {
                    name: "greet".to_string(),
                },
                "language",
                "fre",
            ),
        )
        .await;
        match resp.inner {
            Ok(McpResponse::Complete(result)) => {
                assert_eq!(result.completion.values, vec!["french"]);
                assert_eq!(result.completion.total, Some(1));
            }
            other => panic!("Expected Complete response, got {:?}", other),
        }

        // an argument without a source completes to nothing
        let resp = call(
            &mut router,
            complete(
                CompletionReference::Prompt {
                    name: "greet".to_string(),
                },
                "name",
                "A",
            ),
        )
        .await;
        match resp.inner {
            Ok(McpResponse::Complete(result)) => assert!(result.completion.values.is_empty()),
            other => panic!("Expected Complete response, got {:?}", other),
        }

        let err = call(
            &mut router,
            complete(
                CompletionReference::Prompt {
                    name: "unknown".to_string(),
                },
                "x",
                "",
            ),
        )
        .await
        .inner
        .unwrap_err();
        assert_eq!(err.message, "Unknown prompt");

        // the template declares no completers
        let err = call(
            &mut router,
            complete(
                CompletionReference::Resource {
                    uri: "items/{id}".to_string(),
                },
                "id",
                "4",
            ),
        )
        .await
        .inner
        .unwrap_err();
        assert_eq!(err.message, "Resource template does not support completion");
    }

    #[tokio::test]
    async fn test_set_logging_level() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let resp = call(
            &mut router,
            McpRequest::SetLoggingLevel(crate::protocol::SetLogLevelParams {
                level: crate::protocol::LogLevel::Error,
            }),
        )
        .await;
        assert!(resp.inner.is_ok());
        assert_eq!(session.logging_level(), crate::protocol::LogLevel::Error);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();

        let err = call(
            &mut router,
            McpRequest::Unknown {
                method: "tools/explode".to_string(),
                params: None,
            },
        )
        .await
        .inner
        .unwrap_err();
        assert!(err.is(ErrorCode::MethodNotFound));
    }

    #[tokio::test]
    async fn test_requests_rejected_after_close() {
        let (session, _peer, _) = active_session().await;
        let mut router = session.router();
        session.close();

        let err = call(&mut router, McpRequest::ListTools(ListToolsParams::default()))
            .await
            .inner
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidRequest));
        assert_eq!(err.message, "Session is closing");
    }
}
