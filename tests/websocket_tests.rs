//! WebSocket integration tests

use delegate_dispatch::config::DispatchConfig;
use delegate_dispatch::dispatch::{CapabilityDescriptor, TaskStatus, TaskSubmission};
use delegate_dispatch::store::Store;
use delegate_dispatch::AppState;
use futures::{SinkExt, StreamExt};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn setup_server() -> (SocketAddr, Arc<AppState>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    Store::new(pool.clone())
        .ensure_schema()
        .await
        .expect("Failed to create schema");

    let state = AppState::new(pool, DispatchConfig::new(1, Duration::from_secs(60)));
    let app = delegate_dispatch::router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    (addr, state)
}

async fn connect(addr: SocketAddr) -> Socket {
    let url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws_stream
}

async fn send(ws: &mut Socket, msg: serde_json::Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Next message of the given type, skipping pushes of other types
async fn expect(ws: &mut Socket, kind: &str) -> serde_json::Value {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if json["type"] == kind {
                        return json;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("Socket ended while waiting for {}: {:?}", kind, other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {}", kind))
}

/// Collect one message of each type, in whatever order they arrive
async fn expect_all(ws: &mut Socket, kinds: &[&str]) -> Vec<serde_json::Value> {
    let wait = async {
        let mut found: Vec<Option<serde_json::Value>> = vec![None; kinds.len()];
        while found.iter().any(Option::is_none) {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if let Some(i) = kinds.iter().position(|k| json["type"] == *k) {
                        found[i].get_or_insert(json);
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("Socket ended while waiting for {:?}: {:?}", kinds, other),
            }
        }
        found.into_iter().flatten().collect::<Vec<_>>()
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {:?}", kinds))
}

fn register(delegate_id: &str, selectors: &[&str], mode: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "register",
        "delegate_id": delegate_id,
        "account_id": "acct",
        "selectors": selectors,
        "connection_mode": mode
    })
}

#[tokio::test]
async fn test_messages_before_binding_are_rejected() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, serde_json::json!({"type": "poll"})).await;
    let error = expect(&mut ws, "error").await;
    assert!(error["message"].as_str().unwrap().contains("register"));
}

#[tokio::test]
async fn test_invalid_message_reports_error() {
    let (addr, _state) = setup_server().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    let error = expect(&mut ws, "error").await;
    assert!(error["message"].as_str().unwrap().starts_with("Invalid message"));
}

#[tokio::test]
async fn test_heartbeat_creates_unknown_delegate() {
    let (addr, state) = setup_server().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        serde_json::json!({"type": "heartbeat", "account_id": "acct", "delegate_id": "d-new"}),
    )
    .await;
    let ack = expect(&mut ws, "heartbeat_ack").await;
    assert_eq!(ack["delegate_id"], "d-new");
    assert_eq!(ack["approval"], "approved");

    let delegates = state.dispatcher.list_delegates("acct").await;
    assert_eq!(delegates.len(), 1);
    assert_eq!(delegates[0].id, "d-new");
}

#[tokio::test]
async fn test_poll_acquire_and_report() {
    let (addr, state) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, register("d-1", &["linux"], "polling")).await;
    let registered = expect(&mut ws, "registered").await;
    assert_eq!(registered["delegate"]["id"], "d-1");

    let task = state
        .dispatcher
        .queue_task(TaskSubmission::new("acct", serde_json::json!({"script": "ls"})).with_selectors(["linux"]))
        .await
        .unwrap();

    send(&mut ws, serde_json::json!({"type": "poll"})).await;
    let events = expect(&mut ws, "task_events").await;
    assert_eq!(events["events"][0]["event"], "queued");
    assert_eq!(events["events"][0]["task_id"], task.id.to_string());

    send(&mut ws, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    let acquired = expect(&mut ws, "task_acquired").await;
    assert_eq!(acquired["package"]["payload"]["script"], "ls");
    assert_eq!(acquired["package"]["delegate_id"], "d-1");

    send(
        &mut ws,
        serde_json::json!({"type": "progress", "task_id": task.id, "progress": {"pct": 50}}),
    )
    .await;
    expect(&mut ws, "ack").await;

    send(
        &mut ws,
        serde_json::json!({
            "type": "report_result",
            "task_id": task.id,
            "response": {"outcome": "success", "result": {"files": 3}}
        }),
    )
    .await;
    let accepted = expect(&mut ws, "result_accepted").await;
    assert_eq!(accepted["status"], "finished");

    let finished = state.dispatcher.get_task("acct", task.id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Finished);
    assert_eq!(finished.result, Some(serde_json::json!({"files": 3})));
}

#[tokio::test]
async fn test_losing_delegate_gets_no_task() {
    let (addr, state) = setup_server().await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;

    send(&mut first, register("d-1", &[], "polling")).await;
    expect(&mut first, "registered").await;
    send(&mut second, register("d-2", &[], "polling")).await;
    expect(&mut second, "registered").await;

    let task = state
        .dispatcher
        .queue_task(TaskSubmission::new("acct", serde_json::json!({})))
        .await
        .unwrap();

    send(&mut first, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    expect(&mut first, "task_acquired").await;

    send(&mut second, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    let none = expect(&mut second, "no_task").await;
    assert_eq!(none["task_id"], task.id.to_string());
}

#[tokio::test]
async fn test_streaming_delegate_receives_offer_and_probe() {
    let (addr, state) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, register("d-1", &[], "streaming")).await;
    expect(&mut ws, "registered").await;

    let capability = CapabilityDescriptor::SocketConnection {
        host: "db.internal".to_string(),
        port: 5432,
    };
    let task = state
        .dispatcher
        .queue_task(TaskSubmission::new("acct", serde_json::json!({})).with_capability(capability))
        .await
        .unwrap();

    let pushed = expect_all(&mut ws, &["validate_capabilities", "task_offered"]).await;
    assert_eq!(pushed[0]["task_id"], task.id.to_string());
    assert_eq!(pushed[0]["capabilities"][0]["kind"], "socket_connection");
    assert_eq!(pushed[1]["task_id"], task.id.to_string());

    send(&mut ws, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    let required = expect(&mut ws, "validation_required").await;
    assert_eq!(required["capabilities"][0]["port"], 5432);

    send(
        &mut ws,
        serde_json::json!({
            "type": "report_connection_results",
            "task_id": task.id,
            "results": [{
                "delegate_id": "d-1",
                "capability": {"kind": "socket_connection", "host": "db.internal", "port": 5432},
                "validated": true,
                "duration_ms": 4
            }]
        }),
    )
    .await;
    expect(&mut ws, "ack").await;

    send(&mut ws, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    expect(&mut ws, "task_acquired").await;
}

#[tokio::test]
async fn test_streaming_delegate_is_told_about_aborts() {
    let (addr, state) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, register("d-1", &[], "streaming")).await;
    expect(&mut ws, "registered").await;

    let task = state
        .dispatcher
        .queue_task(TaskSubmission::new("acct", serde_json::json!({})))
        .await
        .unwrap();
    send(&mut ws, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    expect(&mut ws, "task_acquired").await;

    state.dispatcher.abort_task("acct", task.id).await.unwrap();
    let aborted = expect(&mut ws, "task_aborted").await;
    assert_eq!(aborted["task_id"], task.id.to_string());
}

#[tokio::test]
async fn test_closing_streaming_socket_fails_over_its_task() {
    let (addr, state) = setup_server().await;
    let mut streaming = connect(addr).await;
    let mut polling = connect(addr).await;

    send(&mut streaming, register("d-1", &[], "streaming")).await;
    expect(&mut streaming, "registered").await;
    send(&mut polling, register("d-2", &[], "polling")).await;
    expect(&mut polling, "registered").await;

    let task = state
        .dispatcher
        .queue_task(TaskSubmission::new("acct", serde_json::json!({})))
        .await
        .unwrap();
    send(&mut streaming, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    expect(&mut streaming, "task_acquired").await;

    streaming.close(None).await.unwrap();

    let mut requeued = None;
    for _ in 0..50 {
        let current = state.dispatcher.get_task("acct", task.id).await.unwrap();
        if current.status == TaskStatus::Queued {
            requeued = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let requeued = requeued.expect("task was not failed over");
    assert!(requeued.is_excluded("d-1"));

    let d1 = state.dispatcher.registry().get("d-1").await.unwrap();
    assert!(!d1.connected);

    send(&mut polling, serde_json::json!({"type": "acquire", "task_id": task.id})).await;
    expect(&mut polling, "task_acquired").await;
}
