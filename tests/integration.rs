//! Integration tests for toolbox-mcp
//!
//! Drives whole sessions through a [`TestPeer`] over in-memory connections,
//! and the items API through its axum router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tower::ServiceExt;

use toolbox_mcp::crud::{self, CrudState, ItemStore};
use toolbox_mcp::error::ErrorCode;
use toolbox_mcp::protocol::{JsonRpcResponse, PromptRole, notifications};
use toolbox_mcp::testing::{TestPeer, TestPeerOptions};
use toolbox_mcp::{
    BoxError, CapabilityRegistry, CompletionSource, Connection, Content, CreateMessageParams,
    CreateMessageResult, Prompt, PromptArgument, Resource, ResourceBody, ResourceTemplate, Root,
    Session, SessionConfig, SessionEvent, SessionPhase, ToolBox, ToolBoxOptions, ToolBuilder,
    TransportKind, UserError,
};

// =============================================================================
// Test fixtures
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
struct AddInput {
    a: i64,
    b: i64,
}

#[derive(Default)]
struct Tally {
    add_calls: AtomicUsize,
    prompt_calls: AtomicUsize,
    template_vars: Mutex<Vec<HashMap<String, String>>>,
    slow_started: Notify,
    slow_release: Notify,
    slow_finished: AtomicUsize,
}

fn registry(tally: Arc<Tally>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();

    let p = tally.clone();
    registry
        .add_tool(
            ToolBuilder::new("add")
                .description("Add two numbers")
                .handler(move |input: AddInput| {
                    let tally = p.clone();
                    async move {
                        tally.add_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(format!("{}", input.a + input.b))
                    }
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    registry
        .add_tool(
            ToolBuilder::new("refuse")
                .raw_handler(|_args: Value| async {
                    Err::<String, BoxError>(UserError::new("Not allowed here").into())
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    registry
        .add_tool(
            ToolBuilder::new("crash")
                .raw_handler(|_args: Value| async {
                    Err::<String, BoxError>("disk on fire".into())
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    registry
        .add_tool(
            ToolBuilder::new("chatty")
                .raw_handler_with_context(|ctx, _args: Value| async move {
                    ctx.report_progress(1.0, Some(2.0)).await;
                    ctx.log().info("halfway", None);
                    ctx.log().debug("too quiet to send", None);
                    ctx.report_progress(2.0, Some(2.0)).await;
                    Ok::<_, BoxError>("done")
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    registry
        .add_tool(
            ToolBuilder::new("ask_model")
                .raw_handler_with_context(|ctx, _args: Value| async move {
                    let reply = ctx
                        .sample(CreateMessageParams::new(
                            vec![toolbox_mcp::protocol::SamplingMessage::user("Hi?")],
                            16,
                        ))
                        .await?;
                    Ok::<_, BoxError>(reply.content)
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    let p = tally.clone();
    registry
        .add_tool(
            ToolBuilder::new("slow")
                .raw_handler(move |_args: Value| {
                    let tally = p.clone();
                    async move {
                        tally.slow_started.notify_one();
                        tally.slow_release.notified().await;
                        tally.slow_finished.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>("finally")
                    }
                })
                .build()
                .expect("valid tool"),
        )
        .unwrap();

    registry
        .add_resource(Resource::builder("notes").name("Notes").text("remember"))
        .unwrap();

    let p = tally.clone();
    registry
        .add_resource_template(
            ResourceTemplate::builder("items/{id}")
                .handler(move |vars: HashMap<String, String>| {
                    let tally = p.clone();
                    async move {
                        let id = vars.get("id").cloned().unwrap_or_default();
                        tally.template_vars.lock().unwrap().push(vars);
                        Ok::<_, BoxError>(ResourceBody::Text(format!("item {}", id)))
                    }
                })
                .expect("valid template"),
        )
        .unwrap();

    let p = tally.clone();
    registry
        .add_prompt(
            Prompt::builder("review")
                .required_arg("topic", "What to review")
                .argument(
                    PromptArgument::new("code")
                        .enum_values((0..250).map(|n| format!("code-{:03}", n))),
                )
                .handler(move |args: HashMap<String, String>| {
                    let tally = p.clone();
                    async move {
                        tally.prompt_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(format!("Review {}", args["topic"]))
                    }
                }),
        )
        .unwrap();

    registry
}

fn config() -> SessionConfig {
    SessionConfig::default()
        .server_info("integration", "0.1.0")
        .without_heartbeat()
        .negotiation(5, Duration::from_millis(10))
}

async fn connect(options: TestPeerOptions) -> (Session, TestPeer, Arc<Tally>) {
    connect_with(config(), options).await
}

async fn connect_with(
    config: SessionConfig,
    options: TestPeerOptions,
) -> (Session, TestPeer, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    let session = Session::new(Arc::new(registry(tally.clone())), config, None);
    let peer = TestPeer::connect_session(&session, options)
        .await
        .expect("handshake");
    (session, peer, tally)
}

// =============================================================================
// Tools
// =============================================================================

#[tokio::test]
async fn test_schema_failure_is_invalid_params_and_skips_tool() {
    let (_session, peer, tally) = connect(TestPeerOptions::default()).await;

    let err = peer
        .send_request_expect_error(
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": "one", "b": 2}})),
        )
        .await;
    assert!(err.is(ErrorCode::InvalidParams));
    assert_eq!(err.message, "Invalid add parameters");
    assert_eq!(tally.add_calls.load(Ordering::SeqCst), 0);

    let result = peer.call_tool("add", json!({"a": 1, "b": 2})).await;
    assert_eq!(result.all_text(), "3");
    assert_eq!(tally.add_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_user_error_is_passed_through_verbatim() {
    let (_session, peer, _) = connect(TestPeerOptions::default()).await;

    let raw = peer
        .send_request("tools/call", Some(json!({"name": "refuse", "arguments": {}})))
        .await;
    assert_eq!(
        raw,
        json!({"content": [{"type": "text", "text": "Not allowed here"}], "isError": true})
    );

    // other failures are still results, not protocol errors
    let result = peer.call_tool("crash", json!({})).await;
    assert!(result.is_error);
    assert!(result.all_text().contains("disk on fire"));
}

#[tokio::test]
async fn test_unknown_tool() {
    let (_session, peer, _) = connect(TestPeerOptions::default()).await;
    let err = peer
        .send_request_expect_error("tools/call", Some(json!({"name": "nope"})))
        .await;
    assert_eq!(err.message, "Unknown tool: nope");
}

#[tokio::test]
async fn test_progress_and_log_notifications_precede_the_result() {
    let (_session, mut peer, _) = connect(TestPeerOptions::default()).await;

    let result = peer
        .send_request(
            "tools/call",
            Some(json!({"name": "chatty", "arguments": {}, "_meta": {"progressToken": "job-1"}})),
        )
        .await;
    assert_eq!(result["content"][0]["text"], "done");

    let methods: Vec<String> = peer
        .drain_notifications()
        .into_iter()
        .map(|n| n.method)
        .collect();
    assert_eq!(
        methods,
        vec![
            notifications::PROGRESS,
            notifications::MESSAGE,
            notifications::PROGRESS
        ]
    );
}

#[tokio::test]
async fn test_log_level_filters_messages() {
    let (session, mut peer, _) = connect(TestPeerOptions::default()).await;

    peer.send_request("logging/setLevel", Some(json!({"level": "error"})))
        .await;
    assert_eq!(session.logging_level(), toolbox_mcp::LogLevel::Error);

    peer.call_tool("chatty", json!({})).await;
    assert!(peer.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_tool_can_sample_from_peer() {
    let reply = CreateMessageResult {
        role: PromptRole::Assistant,
        content: Content::text("Hello from the model"),
        model: "test-model".to_string(),
        stop_reason: None,
    };
    let (_session, peer, _) = connect(TestPeerOptions::default().with_sampling(reply)).await;

    let result = peer.call_tool("ask_model", json!({})).await;
    assert!(!result.is_error);
    assert_eq!(result.all_text(), "Hello from the model");
    assert!(
        peer.received_methods()
            .contains(&"sampling/createMessage".to_string())
    );
}

// =============================================================================
// Resources and prompts
// =============================================================================

#[tokio::test]
async fn test_resource_reads() {
    let (_session, peer, tally) = connect(TestPeerOptions::default()).await;

    let notes = peer
        .send_request("resources/read", Some(json!({"uri": "notes"})))
        .await;
    assert_eq!(notes["contents"][0]["text"], "remember");

    let item = peer
        .send_request("resources/read", Some(json!({"uri": "items/42"})))
        .await;
    assert_eq!(item["contents"][0]["text"], "item 42");
    assert_eq!(item["contents"][0]["uri"], "items/42");
    assert_eq!(
        *tally.template_vars.lock().unwrap(),
        vec![HashMap::from([("id".to_string(), "42".to_string())])]
    );

    let err = peer
        .send_request_expect_error("resources/read", Some(json!({"uri": "elsewhere/1"})))
        .await;
    assert!(err.is(ErrorCode::MethodNotFound));
    assert_eq!(err.message, "Unknown resource: elsewhere/1");
}

#[tokio::test]
async fn test_listings() {
    let (_session, peer, _) = connect(TestPeerOptions::default()).await;

    let tools = peer.send_request("tools/list", None).await;
    let names: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["add", "refuse", "crash", "chatty", "ask_model", "slow"]);

    let templates = peer.send_request("resources/templates/list", None).await;
    assert_eq!(
        templates["resourceTemplates"][0]["uriTemplate"],
        "items/{id}"
    );

    let prompts = peer.send_request("prompts/list", None).await;
    assert_eq!(prompts["prompts"][0]["name"], "review");
}

#[tokio::test]
async fn test_missing_required_prompt_argument_skips_loader() {
    let (_session, peer, tally) = connect(TestPeerOptions::default()).await;

    let err = peer
        .send_request_expect_error("prompts/get", Some(json!({"name": "review"})))
        .await;
    assert_eq!(err.message, "Missing required argument: topic");
    assert_eq!(tally.prompt_calls.load(Ordering::SeqCst), 0);

    let prompt = peer
        .send_request(
            "prompts/get",
            Some(json!({"name": "review", "arguments": {"topic": "parser"}})),
        )
        .await;
    assert_eq!(prompt["messages"][0]["content"]["text"], "Review parser");
    assert_eq!(tally.prompt_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_completion_never_exceeds_limit() {
    let (_session, peer, _) = connect(TestPeerOptions::default()).await;

    let result = peer
        .send_request(
            "completion/complete",
            Some(json!({
                "ref": {"type": "ref/prompt", "name": "review"},
                "argument": {"name": "code", "value": ""}
            })),
        )
        .await;
    let completion = &result["completion"];
    assert_eq!(completion["values"].as_array().unwrap().len(), 100);
    assert_eq!(completion["values"][0], "code-000");
    assert_eq!(completion["total"], 250);
    assert_eq!(completion["hasMore"], true);
}

#[test]
fn test_completion_source_defaults_to_nothing() {
    assert!(!CompletionSource::default().can_complete());
}

// =============================================================================
// Session behavior
// =============================================================================

#[tokio::test]
async fn test_heartbeat_failure_keeps_session_active() {
    let config = config().heartbeat_interval(Duration::from_millis(30));
    let (session, _peer, _) =
        connect_with(config, TestPeerOptions::default().failing_pings()).await;
    let mut events = session.subscribe();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("heartbeat event")
        .unwrap();
    match event {
        SessionEvent::Error { message } => assert!(message.starts_with("Heartbeat failed")),
        other => panic!("Expected Error event, got {:?}", other),
    }
    assert_eq!(session.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_silent_peer_is_reported_within_heartbeat_interval() {
    let config = config()
        .heartbeat_interval(Duration::from_millis(30))
        .request_timeout(Duration::from_secs(60));
    let (session, _peer, _) =
        connect_with(config, TestPeerOptions::default().silent_pings()).await;
    let mut events = session.subscribe();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("heartbeat event well before the request timeout")
        .unwrap();
    match event {
        SessionEvent::Error { message } => {
            assert!(message.starts_with("Heartbeat failed"));
            assert!(message.contains("timed out"));
        }
        other => panic!("Expected Error event, got {:?}", other),
    }
    assert_eq!(session.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_roots_fetched_and_refreshed() {
    let root = |uri: &str| Root {
        uri: uri.to_string(),
        name: None,
    };
    let (session, peer, _) =
        connect(TestPeerOptions::default().with_roots(vec![root("file:///a")])).await;
    assert_eq!(session.roots(), vec![root("file:///a")]);

    let mut events = session.subscribe();
    peer.set_roots(vec![root("file:///b"), root("file:///c")]);
    peer.notify(notifications::ROOTS_LIST_CHANGED, None)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("roots event")
        .unwrap();
    assert_eq!(
        event,
        SessionEvent::RootsChanged {
            roots: vec![root("file:///b"), root("file:///c")]
        }
    );
    assert_eq!(session.roots().len(), 2);
}

#[tokio::test]
async fn test_batch_request() {
    let (_session, peer, _) = connect(TestPeerOptions::default()).await;

    let responses = peer
        .batch(vec![
            ("ping", None),
            ("tools/call", Some(json!({"name": "add", "arguments": {"a": 2, "b": 3}}))),
            ("no/such/method", None),
        ])
        .await
        .unwrap();
    assert_eq!(responses.len(), 3);
    assert!(matches!(responses[0], JsonRpcResponse::Result(_)));
    match &responses[1] {
        JsonRpcResponse::Result(r) => assert_eq!(r.result["content"][0]["text"], "5"),
        other => panic!("Expected result, got {:?}", other),
    }
    match &responses[2] {
        JsonRpcResponse::Error(e) => assert!(e.error.is(ErrorCode::MethodNotFound)),
        other => panic!("Expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_line_gets_parse_error() {
    let (session, mut peer, _) = connect(TestPeerOptions::default()).await;

    peer.send_raw("{this is not json").await.unwrap();
    match peer.next_stray_response().await {
        Some(JsonRpcResponse::Error(e)) => assert!(e.error.is(ErrorCode::ParseError)),
        other => panic!("Expected parse error, got {:?}", other),
    }

    // the session carries on
    assert_eq!(session.phase(), SessionPhase::Active);
    peer.send_request("ping", None).await;
}

#[tokio::test]
async fn test_in_flight_result_is_dropped_after_close() {
    let options = TestPeerOptions {
        timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let (session, mut peer, tally) = connect(options).await;

    peer.send_raw(r#"{"jsonrpc":"2.0","id":"late","method":"tools/call","params":{"name":"slow"}}"#)
        .await
        .unwrap();
    tally.slow_started.notified().await;

    session.close();
    assert_eq!(session.phase(), SessionPhase::Closed);
    tally.slow_release.notify_one();

    // the tool runs to completion, but nothing is sent
    tokio::time::timeout(Duration::from_secs(1), async {
        while tally.slow_finished.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("slow tool finished");
    assert!(peer.next_stray_response().await.is_none());
}

#[tokio::test]
async fn test_requests_wait_for_negotiation() {
    let tally = Arc::new(Tally::default());
    let session = Session::new(Arc::new(registry(tally)), config(), None);
    let (server, client) = Connection::pair();
    let peer = TestPeer::new(client, TestPeerOptions::default());

    // a request racing the handshake is held until the session is active
    let (connected, tools, initialized) = tokio::join!(
        session.connect(server),
        peer.send_request("tools/list", None),
        peer.initialize()
    );
    connected.unwrap();
    initialized.unwrap();
    assert_eq!(tools["tools"].as_array().unwrap().len(), 6);
    assert_eq!(session.phase(), SessionPhase::Active);
}

// =============================================================================
// Orchestrator with the item store
// =============================================================================

#[tokio::test]
async fn test_toolbox_serves_item_store() {
    let options = ToolBoxOptions::new("items", "1.0.0").session_config(
        SessionConfig::default()
            .without_heartbeat()
            .negotiation(5, Duration::from_millis(10)),
    );
    let mut toolbox = ToolBox::new(options);
    let store = Arc::new(ItemStore::seeded());
    crud::mcp::register(&mut toolbox, store.clone()).unwrap();

    let (server, client) = Connection::pair();
    let peer = TestPeer::new(client, TestPeerOptions::default());
    let (started, initialized) =
        tokio::join!(toolbox.start(TransportKind::Channel(server)), peer.initialize());
    started.unwrap();
    initialized.unwrap();

    let item = peer
        .send_request("resources/read", Some(json!({"uri": "items/2"})))
        .await;
    let item: Value = serde_json::from_str(item["contents"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(item["name"], "Sample Item 2");

    let completion = peer
        .send_request(
            "completion/complete",
            Some(json!({
                "ref": {"type": "ref/prompt", "name": "shop_for"},
                "argument": {"name": "category", "value": "e"}
            })),
        )
        .await;
    assert_eq!(completion["completion"]["values"], json!(["electronics"]));

    let result = peer
        .call_tool("delete_item", json!({"id": 1}))
        .await;
    assert!(!result.is_error);
    assert!(store.get(1).unwrap().is_none());

    toolbox.stop().await;
    assert!(toolbox.sessions().is_empty());
}

// =============================================================================
// Items REST API
// =============================================================================

fn items_app() -> axum::Router {
    crud::router(CrudState::new(Arc::new(ItemStore::seeded()), false))
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn is_iso_timestamp(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
}

#[tokio::test]
async fn test_create_item() {
    let app = items_app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/items",
        Some(json!({"name": "Pen", "description": "Blue pen", "category": "office", "price": 2.5})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Item created successfully");
    assert_eq!(body["data"]["id"], 4);
    assert_eq!(body["data"]["price"], 2.5);
    assert!(is_iso_timestamp(&body["data"]["createdAt"]));
    assert!(is_iso_timestamp(&body["data"]["updatedAt"]));

    let (status, body) = send(&app, "GET", "/api/items/4", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Pen");
}

#[tokio::test]
async fn test_filter_by_category() {
    let (status, body) = send(&items_app(), "GET", "/api/items?category=electronics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["category"], "electronics");
}

#[tokio::test]
async fn test_update_missing_item() {
    let (status, body) = send(
        &items_app(),
        "PUT",
        "/api/items/999",
        Some(json!({"name": "x", "description": "y", "category": "z", "price": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_update_item() {
    let app = items_app();
    let (_, before) = send(&app, "GET", "/api/items/3", None).await;
    let (status, body) = send(
        &app,
        "PUT",
        "/api/items/3",
        Some(json!({"name": " Coat ", "description": "Warm", "category": "clothing", "price": "80"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Item updated successfully");
    assert_eq!(body["data"]["name"], "Coat");
    assert_eq!(body["data"]["price"], 80.0);
    assert_eq!(body["data"]["createdAt"], before["data"]["createdAt"]);
    assert!(is_iso_timestamp(&body["data"]["updatedAt"]));
}

#[tokio::test]
async fn test_delete_then_get() {
    let app = items_app();
    let (status, body) = send(&app, "DELETE", "/api/items/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Item deleted successfully");
    assert_eq!(body["data"]["id"], 1);

    let (status, body) = send(&app, "GET", "/api/items/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Item not found");

    let (status, _) = send(&app, "DELETE", "/api/items/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_validation_errors() {
    let (status, body) = send(
        &items_app(),
        "POST",
        "/api/items",
        Some(json!({"name": "Pen", "price": -3})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Validation failed");
    assert_eq!(
        body["errors"],
        json!([
            "Description is required",
            "Category is required",
            "Price must be a valid positive number"
        ])
    );
}
