//! Items CRUD REST API
//!
//! A small axum application over an in-memory [`ItemStore`]:
//!
//! | Method   | Path              | |
//! |----------|-------------------|-|
//! | `GET`    | `/`               | API info |
//! | `GET`    | `/api/items`      | List, filtered by `category`, `minPrice`, `maxPrice`, `search` |
//! | `GET`    | `/api/items/{id}` | One item |
//! | `POST`   | `/api/items`      | Create |
//! | `PUT`    | `/api/items/{id}` | Replace |
//! | `DELETE` | `/api/items/{id}` | Delete |
//!
//! Every body is JSON with a `success` flag.
//!
//! ```rust,no_run
//! use toolbox_mcp::crud::{CrudConfig, serve};
//!
//! # async fn run() -> Result<(), toolbox_mcp::error::Error> {
//! serve(CrudConfig::from_env()).await?;
//! # Ok(())
//! # }
//! ```

pub mod mcp;
mod routes;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::{Error, Result};

pub use routes::router;
pub use store::{Item, ItemFilter, ItemInput, ItemStore};

pub(crate) const DEFAULT_PORT: u16 = 3000;

/// Settings for the CRUD server
#[derive(Debug, Clone)]
pub struct CrudConfig {
    pub port: u16,
    /// Include failure detail in 500 responses
    pub development: bool,
}

impl Default for CrudConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            development: false,
        }
    }
}

impl CrudConfig {
    /// Read `PORT` and `APP_ENV` (`development` enables error detail)
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let development = std::env::var("APP_ENV").is_ok_and(|env| env == "development");
        Self { port, development }
    }
}

/// Shared handler state
#[derive(Debug, Clone)]
pub struct CrudState {
    pub store: Arc<ItemStore>,
    pub development: bool,
}

impl CrudState {
    pub fn new(store: Arc<ItemStore>, development: bool) -> Self {
        Self { store, development }
    }

    pub(crate) fn internal(&self, err: Error) -> CrudError {
        tracing::error!(error = %err, "Request failed");
        CrudError::Internal {
            detail: self.development.then(|| err.to_string()),
        }
    }
}

/// Failures a handler answers with
#[derive(Debug, Clone, PartialEq)]
pub enum CrudError {
    ItemNotFound,
    RouteNotFound,
    Validation(Vec<String>),
    Internal { detail: Option<String> },
}

impl IntoResponse for CrudError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            CrudError::ItemNotFound => (
                StatusCode::NOT_FOUND,
                json!({"success": false, "message": "Item not found"}),
            ),
            CrudError::RouteNotFound => (
                StatusCode::NOT_FOUND,
                json!({"success": false, "message": "Route not found"}),
            ),
            CrudError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({"success": false, "message": "Validation failed", "errors": errors}),
            ),
            CrudError::Internal { detail } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "success": false,
                    "message": "Something went wrong!",
                    "error": detail.unwrap_or_else(|| "Internal server error".to_string()),
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Serve the API on `0.0.0.0:{port}` until the process is interrupted
pub async fn serve(config: CrudConfig) -> Result<()> {
    let state = CrudState::new(Arc::new(ItemStore::seeded()), config.development);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!(port = config.port, "Server is running");
    tracing::info!("API documentation available at http://localhost:{}", config.port);
    tracing::info!("API base URL: http://localhost:{}/api", config.port);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| Error::Transport(format!("Server error: {}", e)))
}
