//! Tool definition and builder API
//!
//! Tools are built with [`ToolBuilder`] from either a typed handler (input
//! deserialized from the arguments, schema derived with `schemars`) or a raw
//! JSON handler with an optional explicit schema. When a tool has a schema,
//! incoming arguments are validated against it before the handler runs.
//!
//! Tools are tower services internally. The handler service is wrapped in
//! [`ToolCatchError`], so a failing handler produces an error-flagged
//! [`CallToolResult`] rather than a protocol error:
//!
//! ```rust
//! use toolbox_mcp::ToolBuilder;
//! use toolbox_mcp::error::BoxError;
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct GreetInput { name: String }
//!
//! let tool = ToolBuilder::new("greet")
//!     .description("Greet someone by name")
//!     .handler(|input: GreetInput| async move {
//!         Ok::<_, BoxError>(format!("Hello, {}!", input.name))
//!     })
//!     .build()
//!     .expect("valid tool");
//!
//! assert_eq!(tool.name, "greet");
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::util::BoxCloneSyncService;
use tower::{Layer, ServiceExt};
use tower_service::Service;

use crate::context::ToolContext;
use crate::error::{BoxError, Error, Result, UserError};
use crate::protocol::{CallToolResult, Content, RequestId, ToolDefinition};

/// A boxed future for tool handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Results
// =============================================================================

/// What a tool executable may return
#[derive(Debug, Clone, PartialEq)]
pub enum ToolExecutionResult {
    /// A bare string, sent as one text block
    Text(String),
    /// One content block, wrapped into a one-element list
    SingleContent(Content),
    /// A complete result, sent as-is
    FullResult(CallToolResult),
}

impl ToolExecutionResult {
    pub fn into_call_result(self) -> CallToolResult {
        match self {
            ToolExecutionResult::Text(text) => CallToolResult::text(text),
            ToolExecutionResult::SingleContent(content) => CallToolResult {
                content: vec![content],
                is_error: false,
            },
            ToolExecutionResult::FullResult(result) => result,
        }
    }
}

impl From<String> for ToolExecutionResult {
    fn from(text: String) -> Self {
        ToolExecutionResult::Text(text)
    }
}

impl From<&str> for ToolExecutionResult {
    fn from(text: &str) -> Self {
        ToolExecutionResult::Text(text.to_string())
    }
}

impl From<Content> for ToolExecutionResult {
    fn from(content: Content) -> Self {
        ToolExecutionResult::SingleContent(content)
    }
}

impl From<CallToolResult> for ToolExecutionResult {
    fn from(result: CallToolResult) -> Self {
        ToolExecutionResult::FullResult(result)
    }
}

/// Render a failed execution the way the peer sees it.
///
/// A [`UserError`] keeps its message verbatim; anything else is prefixed.
pub fn error_result(err: &BoxError) -> CallToolResult {
    match err.downcast_ref::<UserError>() {
        Some(user) => CallToolResult::error(user.message.clone()),
        None => CallToolResult::error(format!("Error: {}", err)),
    }
}

// =============================================================================
// Service Types
// =============================================================================

/// Request type for tool services
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub ctx: ToolContext,
    pub args: Value,
}

impl ToolRequest {
    pub fn new(ctx: ToolContext, args: Value) -> Self {
        Self { ctx, args }
    }
}

/// A boxed, cloneable, shareable tool service with `Error = Infallible`.
pub type BoxToolService = BoxCloneSyncService<ToolRequest, CallToolResult, Infallible>;

/// Catches errors from the inner service and converts them to error-flagged results.
pub struct ToolCatchError<S> {
    inner: S,
}

impl<S> ToolCatchError<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: Clone> Clone for ToolCatchError<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ToolCatchError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCatchError")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<S> Service<ToolRequest> for ToolCatchError<S>
where
    S: Service<ToolRequest, Response = CallToolResult> + Clone + Send + 'static,
    S::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    type Response = CallToolResult;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<CallToolResult, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        // readiness errors surface again from call
        match self.inner.poll_ready(cx) {
            Poll::Ready(_) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let fut = self.inner.call(req);

        Box::pin(async move {
            match fut.await {
                Ok(result) => Ok(result),
                Err(err) => Ok(error_result(&err.into())),
            }
        })
    }
}

/// Validates a tool name
///
/// Tool names must be 1-128 characters of alphanumerics, underscores,
/// hyphens, and dots.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidDefinition(
            "Tool name cannot be empty".to_string(),
        ));
    }
    if name.len() > 128 {
        return Err(Error::InvalidDefinition(format!(
            "Tool name '{}' exceeds maximum length of 128 characters (got {})",
            name,
            name.len()
        )));
    }
    if let Some(invalid_char) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-' && *c != '.')
    {
        return Err(Error::InvalidDefinition(format!(
            "Tool name '{}' contains invalid character '{}'",
            name, invalid_char
        )));
    }
    Ok(())
}

/// Tool handler trait - the core abstraction for tool execution
pub trait ToolHandler: Send + Sync {
    fn call(
        &self,
        ctx: ToolContext,
        args: Value,
    ) -> BoxFuture<'_, std::result::Result<ToolExecutionResult, BoxError>>;

    /// Declared parameter schema, if any
    fn input_schema(&self) -> Option<Value>;
}

/// Adapts a `ToolHandler` to a tower `Service<ToolRequest>`.
pub struct ToolHandlerService<H> {
    handler: Arc<H>,
}

impl<H> ToolHandlerService<H> {
    fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for ToolHandlerService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<H> Service<ToolRequest> for ToolHandlerService<H>
where
    H: ToolHandler + 'static,
{
    type Response = CallToolResult;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<CallToolResult, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolRequest) -> Self::Future {
        let handler = self.handler.clone();
        Box::pin(async move {
            let result = handler.call(req.ctx, req.args).await?;
            Ok(result.into_call_result())
        })
    }
}

// =============================================================================
// Tool
// =============================================================================

/// A registered tool
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    input_schema: Value,
    validator: Option<Arc<jsonschema::Validator>>,
    service: BoxToolService,
}

impl Clone for Tool {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            validator: self.validator.clone(),
            service: self.service.clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("validated", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl Tool {
    pub fn builder(name: impl Into<String>) -> ToolBuilder {
        ToolBuilder::new(name)
    }

    /// Get the tool definition for tools/list
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Check arguments against the declared schema.
    ///
    /// Returns the validation messages on failure. Tools without a schema
    /// accept anything.
    pub fn validate(&self, args: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Call the tool outside of any session
    pub fn call(&self, args: Value) -> BoxFuture<'static, CallToolResult> {
        self.call_with_context(ToolContext::new(RequestId::Number(0)), args)
    }

    /// Call the tool with a context. Never fails: errors come back flagged.
    pub fn call_with_context(
        &self,
        ctx: ToolContext,
        args: Value,
    ) -> BoxFuture<'static, CallToolResult> {
        let service = self.service.clone();
        Box::pin(async move {
            let Ok(result) = service.oneshot(ToolRequest::new(ctx, args)).await;
            result
        })
    }

    fn from_service<S>(
        name: String,
        description: Option<String>,
        schema: Option<Value>,
        service: S,
    ) -> Result<Self>
    where
        S: Service<ToolRequest, Response = CallToolResult> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError> + Send,
        S::Future: Send,
    {
        validate_tool_name(&name)?;

        let validator = match &schema {
            Some(schema) => Some(Arc::new(jsonschema::validator_for(schema).map_err(|e| {
                Error::InvalidDefinition(format!("Invalid schema for tool '{}': {}", name, e))
            })?)),
            None => None,
        };
        let input_schema = schema.unwrap_or_else(|| serde_json::json!({ "type": "object" }));

        Ok(Self {
            name,
            description,
            input_schema,
            validator,
            service: BoxCloneSyncService::new(ToolCatchError::new(service)),
        })
    }
}

// =============================================================================
// Builder API
// =============================================================================

/// Builder for creating tools with a fluent API
pub struct ToolBuilder {
    name: String,
    description: Option<String>,
    schema: Option<Value>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare a parameter schema for a raw handler
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Typed handler; the input schema is derived from `I`
    pub fn handler<I, F, Fut, R>(
        self,
        handler: F,
    ) -> ToolBuilderWithHandler<TypedHandler<I, impl Fn(ToolContext, I) -> Fut + Send + Sync + 'static>>
    where
        I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
        R: Into<ToolExecutionResult> + 'static,
    {
        self.handler_with_context(move |_ctx: ToolContext, input: I| handler(input))
    }

    /// Typed handler that also receives the [`ToolContext`]
    pub fn handler_with_context<I, F, Fut, R>(
        self,
        handler: F,
    ) -> ToolBuilderWithHandler<TypedHandler<I, F>>
    where
        I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
        F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
        R: Into<ToolExecutionResult> + 'static,
    {
        ToolBuilderWithHandler {
            name: self.name,
            description: self.description,
            handler: TypedHandler {
                handler,
                _phantom: std::marker::PhantomData,
            },
        }
    }

    /// Raw JSON handler; validated only if [`schema`](Self::schema) was set
    pub fn raw_handler<F, Fut, R>(
        self,
        handler: F,
    ) -> ToolBuilderWithHandler<RawHandler<impl Fn(ToolContext, Value) -> Fut + Send + Sync + 'static>>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
        R: Into<ToolExecutionResult> + 'static,
    {
        self.raw_handler_with_context(move |_ctx: ToolContext, args: Value| handler(args))
    }

    /// Raw JSON handler that also receives the [`ToolContext`]
    pub fn raw_handler_with_context<F, Fut, R>(
        self,
        handler: F,
    ) -> ToolBuilderWithHandler<RawHandler<F>>
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
        R: Into<ToolExecutionResult> + 'static,
    {
        ToolBuilderWithHandler {
            name: self.name,
            description: self.description,
            handler: RawHandler {
                handler,
                schema: self.schema,
            },
        }
    }
}

/// Builder state after a handler has been chosen
pub struct ToolBuilderWithHandler<H> {
    name: String,
    description: Option<String>,
    handler: H,
}

impl<H: ToolHandler + 'static> ToolBuilderWithHandler<H> {
    pub fn build(self) -> Result<Tool> {
        let schema = self.handler.input_schema();
        Tool::from_service(
            self.name,
            self.description,
            schema,
            ToolHandlerService::new(self.handler),
        )
    }

    /// Wrap the handler service in a tower layer (timeouts, concurrency limits, ...)
    ///
    /// Errors raised by the layer are reported like handler errors.
    pub fn layer<L>(self, layer: L) -> Result<Tool>
    where
        L: Layer<ToolHandlerService<H>>,
        L::Service: Service<ToolRequest, Response = CallToolResult> + Clone + Send + Sync + 'static,
        <L::Service as Service<ToolRequest>>::Error: Into<BoxError> + Send,
        <L::Service as Service<ToolRequest>>::Future: Send,
    {
        let schema = self.handler.input_schema();
        let service = layer.layer(ToolHandlerService::new(self.handler));
        Tool::from_service(self.name, self.description, schema, service)
    }
}

// =============================================================================
// Handler implementations
// =============================================================================

/// Handler that deserializes input to a specific type
pub struct TypedHandler<I, F> {
    handler: F,
    _phantom: std::marker::PhantomData<fn() -> I>,
}

impl<I, F, Fut, R> ToolHandler for TypedHandler<I, F>
where
    I: JsonSchema + DeserializeOwned + Send + Sync + 'static,
    F: Fn(ToolContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    R: Into<ToolExecutionResult> + 'static,
{
    fn call(
        &self,
        ctx: ToolContext,
        args: Value,
    ) -> BoxFuture<'_, std::result::Result<ToolExecutionResult, BoxError>> {
        Box::pin(async move {
            let input: I = serde_json::from_value(args)
                .map_err(|e| format!("Invalid input: {}", e))?;
            Ok((self.handler)(ctx, input).await?.into())
        })
    }

    fn input_schema(&self) -> Option<Value> {
        serde_json::to_value(schemars::schema_for!(I)).ok()
    }
}

/// Handler that works with raw JSON
pub struct RawHandler<F> {
    handler: F,
    schema: Option<Value>,
}

impl<F, Fut, R> ToolHandler for RawHandler<F>
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
    R: Into<ToolExecutionResult> + 'static,
{
    fn call(
        &self,
        ctx: ToolContext,
        args: Value,
    ) -> BoxFuture<'_, std::result::Result<ToolExecutionResult, BoxError>> {
        Box::pin(async move { Ok((self.handler)(ctx, args).await?.into()) })
    }

    fn input_schema(&self) -> Option<Value> {
        self.schema.clone()
    }
}
