use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};

use super::store::{Item, ItemFilter, ItemInput};
use super::{CrudError, CrudState};
use crate::error::Error;

type Handled = std::result::Result<Response, CrudError>;

/// Build the API router over `state`
pub fn router(state: CrudState) -> Router {
    Router::new()
        .route("/", get(api_info))
        .route("/api/items", get(list_items).post(create_item))
        .route(
            "/api/items/{id}",
            get(get_item).put(update_item).delete(delete_item),
        )
        .fallback(route_not_found)
        .method_not_allowed_fallback(route_not_found)
        .layer(middleware::from_fn(log_request))
        .with_state(Arc::new(state))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(%method, %path, status = response.status().as_u16(), "HTTP request");
    response
}

async fn route_not_found() -> CrudError {
    CrudError::RouteNotFound
}

/// Ids that do not parse name no item
fn parse_id(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

/// Malformed JSON is a server failure; well-formed but invalid input is a 400
fn parse_body(state: &CrudState, body: &str) -> std::result::Result<ItemInput, CrudError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| state.internal(Error::Serialization(e)))?;
    ItemInput::validate(&value).map_err(CrudError::Validation)
}

fn found(message: Option<&str>, item: Item) -> Response {
    let mut body = json!({"success": true, "data": item});
    if let Some(message) = message {
        body["message"] = json!(message);
    }
    Json(body).into_response()
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the CRUD API",
        "version": "1.0.0",
        "endpoints": {
            "GET /api/items": "Get all items",
            "GET /api/items/:id": "Get item by ID",
            "POST /api/items": "Create new item",
            "PUT /api/items/:id": "Update item by ID",
            "DELETE /api/items/:id": "Delete item by ID"
        }
    }))
}

async fn list_items(
    State(state): State<Arc<CrudState>>,
    Query(filter): Query<ItemFilter>,
) -> Handled {
    let items = state.store.list(&filter).map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "success": true,
        "count": items.len(),
        "data": items,
    }))
    .into_response())
}

async fn get_item(State(state): State<Arc<CrudState>>, Path(id): Path<String>) -> Handled {
    let id = parse_id(&id).ok_or(CrudError::ItemNotFound)?;
    let item = state
        .store
        .get(id)
        .map_err(|e| state.internal(e))?
        .ok_or(CrudError::ItemNotFound)?;
    Ok(found(None, item))
}

async fn create_item(State(state): State<Arc<CrudState>>, body: String) -> Handled {
    let input = parse_body(&state, &body)?;
    let item = state.store.create(input).map_err(|e| state.internal(e))?;
    let mut response = found(Some("Item created successfully"), item);
    *response.status_mut() = axum::http::StatusCode::CREATED;
    Ok(response)
}

async fn update_item(
    State(state): State<Arc<CrudState>>,
    Path(id): Path<String>,
    body: String,
) -> Handled {
    let id = parse_id(&id).ok_or(CrudError::ItemNotFound)?;
    // missing items win over bad input
    if state
        .store
        .get(id)
        .map_err(|e| state.internal(e))?
        .is_none()
    {
        return Err(CrudError::ItemNotFound);
    }
    let input = parse_body(&state, &body)?;
    let item = state
        .store
        .update(id, input)
        .map_err(|e| state.internal(e))?
        .ok_or(CrudError::ItemNotFound)?;
    Ok(found(Some("Item updated successfully"), item))
}

async fn delete_item(State(state): State<Arc<CrudState>>, Path(id): Path<String>) -> Handled {
    let id = parse_id(&id).ok_or(CrudError::ItemNotFound)?;
    let item = state
        .store
        .delete(id)
        .map_err(|e| state.internal(e))?
        .ok_or(CrudError::ItemNotFound)?;
    Ok(found(Some("Item deleted successfully"), item))
}
