//! # toolbox-mcp
//!
//! Tower-based Model Context Protocol (MCP) toolbox, plus a small items CRUD
//! REST API.
//!
//! The MCP side is built in layers:
//!
//! - [`CapabilityRegistry`] holds tools, resources, resource templates and
//!   prompts, keyed by name or uri.
//! - [`completion`] resolves argument completions from enum lists or custom
//!   completers.
//! - [`Session`] is one negotiated connection to a peer. It walks a
//!   forward-only [`SessionPhase`] machine, serves requests through a tower
//!   [`SessionRouter`], and talks back to the peer (pings, roots, sampling).
//! - [`ToolBox`] is the orchestrator: it owns the registry, starts sessions
//!   on a transport, and publishes [`ToolBoxEvent`]s.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use toolbox_mcp::{BoxError, ToolBox, ToolBoxOptions, ToolBuilder, TransportKind};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize, JsonSchema)]
//! struct GreetInput {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     let greet = ToolBuilder::new("greet")
//!         .description("Greet someone by name")
//!         .handler(|input: GreetInput| async move {
//!             Ok::<_, BoxError>(format!("Hello, {}!", input.name))
//!         })
//!         .build()?;
//!
//!     let mut toolbox = ToolBox::new(ToolBoxOptions::new("my-server", "1.0.0"));
//!     toolbox.add_tool(greet)?;
//!     toolbox.activate(TransportKind::Stdio).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! [`testing::TestPeer`] plays the other end of a [`transport::Connection`],
//! answering the server's pings, roots and sampling requests automatically:
//!
//! ```rust
//! use std::sync::Arc;
//! use toolbox_mcp::{CapabilityRegistry, Session, SessionConfig};
//! use toolbox_mcp::testing::{TestPeer, TestPeerOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let session = Session::new(Arc::new(CapabilityRegistry::new()), SessionConfig::default(), None);
//! let peer = TestPeer::connect_session(&session, TestPeerOptions::default()).await.unwrap();
//! let tools = peer.send_request("tools/list", None).await;
//! assert!(tools["tools"].as_array().unwrap().is_empty());
//! # }
//! ```
//!
//! ## Items API
//!
//! [`crud`] serves the items REST API with axum and can expose the same store
//! as MCP tools, resources and a prompt ([`crud::mcp::register`]).

pub mod completion;
pub mod content;
pub mod context;
pub mod crud;
pub mod error;
pub mod jsonrpc;
pub mod peer;
pub mod prompt;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod router;
pub mod session;
pub mod testing;
pub mod tool;
pub mod toolbox;
pub mod transport;

// Re-exports
pub use completion::{Completer, CompleterHandle, CompletionSource, completer_fn};
pub use context::{AuthPayload, ToolContext};
pub use error::{BoxError, Error, JsonRpcError, Result, UserError};
pub use jsonrpc::JsonRpcService;
pub use prompt::{Prompt, PromptArgument, PromptBuilder};
pub use protocol::{
    CallToolResult, ClientCapabilities, Completion, Content, CreateMessageParams,
    CreateMessageResult, GetPromptResult, Implementation, InitializeResult, LogLevel, McpRequest,
    McpResponse, ReadResourceResult, RequestId, Root, ServerCapabilities,
};
pub use registry::CapabilityRegistry;
pub use resource::{
    Resource, ResourceBody, ResourceBuilder, ResourceTemplate, ResourceTemplateBuilder,
    TemplateArgument,
};
pub use router::{RouterRequest, RouterResponse, SessionRouter};
pub use session::{Session, SessionConfig, SessionEvent, SessionPhase};
pub use tool::{Tool, ToolBuilder};
pub use toolbox::{ToolBox, ToolBoxEvent, ToolBoxOptions, TransportKind};
pub use transport::{Connection, SseServer, SseServerHandle};
