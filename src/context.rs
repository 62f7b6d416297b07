//! Context handed to tool executables
//!
//! Provides the session's auth payload, progress reporting, leveled logging
//! forwarded to the peer, and sampling requests.
//!
//! # Example
//!
//! ```rust,ignore
//! use toolbox_mcp::context::ToolContext;
//!
//! async fn index(ctx: ToolContext, input: IndexInput) -> Result<String, BoxError> {
//!     for (i, file) in input.files.iter().enumerate() {
//!         ctx.report_progress(i as f64, Some(input.files.len() as f64)).await;
//!         ctx.log().debug("Indexing file", Some(json!({ "file": file })));
//!     }
//!     Ok("Indexed".to_string())
//! }
//! ```

use std::any::Any;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::peer::{PeerLink, PeerRequesterHandle};
use crate::protocol::{
    CreateMessageParams, CreateMessageResult, LogLevel, LoggingMessageParams, ProgressParams,
    ProgressToken, RequestId,
};

/// Opaque value produced by the authenticate hook for a connection
pub type AuthPayload = Arc<dyn Any + Send + Sync>;

/// A notification to be sent to the peer
#[derive(Debug, Clone)]
pub enum ServerNotification {
    /// Progress update for a request
    Progress(ProgressParams),
    /// Log message notification
    LogMessage(LoggingMessageParams),
}

/// Context for one tool call
#[derive(Clone)]
pub struct ToolContext {
    request_id: RequestId,
    progress_token: Option<ProgressToken>,
    peer: Option<Arc<PeerLink>>,
    requester: Option<PeerRequesterHandle>,
    min_log_level: Option<Arc<RwLock<LogLevel>>>,
    auth: Option<AuthPayload>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("request_id", &self.request_id)
            .field("progress_token", &self.progress_token)
            .field("authenticated", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            progress_token: None,
            peer: None,
            requester: None,
            min_log_level: None,
            auth: None,
        }
    }

    pub fn with_progress_token(mut self, token: Option<ProgressToken>) -> Self {
        self.progress_token = token;
        self
    }

    /// Route notifications through the given peer link
    pub fn with_peer(mut self, peer: Arc<PeerLink>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_requester(mut self, requester: PeerRequesterHandle) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Share the session's minimum log level
    pub fn with_min_log_level(mut self, level: Arc<RwLock<LogLevel>>) -> Self {
        self.min_log_level = Some(level);
        self
    }

    pub fn with_auth(mut self, auth: Option<AuthPayload>) -> Self {
        self.auth = auth;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn progress_token(&self) -> Option<&ProgressToken> {
        self.progress_token.as_ref()
    }

    /// The auth payload, if the session was authenticated with a `T`
    pub fn auth<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.auth.as_ref().and_then(|a| a.downcast_ref::<T>())
    }

    pub fn auth_payload(&self) -> Option<&AuthPayload> {
        self.auth.as_ref()
    }

    /// Report progress to the peer
    ///
    /// This is a no-op if the request carried no progress token.
    pub async fn report_progress(&self, progress: f64, total: Option<f64>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let Some(peer) = &self.peer else {
            return;
        };

        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
        };

        if let Err(e) = peer.notify(ServerNotification::Progress(params)).await {
            tracing::debug!(error = %e, "Failed to send progress notification");
        }
    }

    /// Send a log message notification to the peer
    ///
    /// Messages less severe than the level set via `logging/setLevel` are
    /// dropped.
    pub fn send_log(&self, params: LoggingMessageParams) {
        let Some(peer) = &self.peer else {
            return;
        };

        if let Some(min_level) = &self.min_log_level
            && let Ok(min) = min_level.read()
            && params.level > *min
        {
            return;
        }

        peer.try_notify(ServerNotification::LogMessage(params));
    }

    /// Leveled logger forwarding to the peer
    pub fn log(&self) -> ToolLogger<'_> {
        ToolLogger { ctx: self }
    }

    /// Request an LLM completion from the peer
    pub async fn sample(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        let requester = self.requester.as_ref().ok_or_else(|| {
            Error::Internal("Sampling not available: no peer connection".to_string())
        })?;
        requester.sample(params).await
    }
}

/// `debug`/`info`/`warn`/`error` logging for tools
pub struct ToolLogger<'a> {
    ctx: &'a ToolContext,
}

impl ToolLogger<'_> {
    pub fn debug(&self, message: impl Into<String>, context: Option<Value>) {
        self.emit(LogLevel::Debug, message.into(), context);
    }

    pub fn info(&self, message: impl Into<String>, context: Option<Value>) {
        self.emit(LogLevel::Info, message.into(), context);
    }

    pub fn warn(&self, message: impl Into<String>, context: Option<Value>) {
        self.emit(LogLevel::Warning, message.into(), context);
    }

    pub fn error(&self, message: impl Into<String>, context: Option<Value>) {
        self.emit(LogLevel::Error, message.into(), context);
    }

    fn emit(&self, level: LogLevel, message: String, context: Option<Value>) {
        let data = json!({ "message": message, "context": context });
        self.ctx
            .send_log(LoggingMessageParams::new(level).with_data(data));
    }
}
