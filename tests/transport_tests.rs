//! End-to-end transport and manager tests against the wire-level mock tool
//! server (`mcp-hub-mock`), which speaks the real protocol over its own
//! stdio.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use mcp_hub::internal::mcp::protocol::{JsonRpcError, JsonRpcMessage};
use mcp_hub::internal::transport::{
    NotificationHandler, ProcessManager, ReconnectPolicy, RequestHandler, ServerSpec,
    StdioTransport, TransportError, TransportManager, TransportOptions, TransportState,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn mock_spec() -> ServerSpec {
    ServerSpec {
        command: env!("CARGO_BIN_EXE_mcp-hub-mock").to_string(),
        args: Vec::new(),
        working_directory: None,
        environment: HashMap::new(),
    }
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        multiplier: 1.5,
        max_delay: Duration::from_secs(1),
        max_attempts,
    }
}

struct Capture {
    tx: mpsc::Sender<(String, Option<Value>)>,
}

#[async_trait]
impl NotificationHandler for Capture {
    async fn on_notification(&self, method: &str, params: Option<Value>) {
        let _ = self.tx.send((method.to_string(), params)).await;
    }
}

struct Pong {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl RequestHandler for Pong {
    async fn on_request(
        &self,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        let _ = self.tx.send(method.to_string()).await;
        Ok(json!({"pong": true}))
    }
}

#[tokio::test]
async fn echo_round_trips_params() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();
    assert!(transport.is_connected());

    let result = transport
        .call("echo", Some(json!({"x": 1})), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!({"x": 1}));

    transport.close("test done").await;
    assert_eq!(transport.state(), TransportState::Closed);
    // Closing again is a no-op.
    transport.close("test done").await;
}

#[tokio::test]
async fn instantly_exiting_child_settles_at_closed() {
    // A child that dies before the loops even run must still end Closed;
    // the Connected publish in connect() may never mask the teardown.
    let spec = ServerSpec {
        command: "true".to_string(),
        args: Vec::new(),
        working_directory: None,
        environment: HashMap::new(),
    };
    let transport = StdioTransport::connect(&spec, TransportOptions::default())
        .await
        .unwrap();

    transport.closed().await;
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(transport.last_exit().unwrap().code, Some(0));
}

#[tokio::test]
async fn concurrent_calls_resolve_without_crosstalk() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();

    // Even ids sleep before answering, so their replies overtake nothing
    // and the echo replies overtake them: responses arrive out of request
    // order and every caller must still get its own.
    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let transport = Arc::clone(&transport);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let result = transport
                    .call("sleep", Some(json!({"ms": 200})), CALL_TIMEOUT)
                    .await
                    .unwrap();
                assert_eq!(result, json!({"slept": 200}));
            } else {
                let result = transport
                    .call("echo", Some(json!({"i": i})), CALL_TIMEOUT)
                    .await
                    .unwrap();
                assert_eq!(result, json!({"i": i}));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    transport.close("test done").await;
}

#[tokio::test]
async fn timeout_leaves_the_connection_healthy() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = transport
        .call("sleep", Some(json!({"ms": 2000})), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(transport.is_connected());

    // Other traffic is unaffected.
    let result = transport
        .call("echo", Some(json!("still alive")), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!("still alive"));

    // The late reply eventually arrives, is dropped, and changes nothing.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(transport.is_connected());
    let result = transport
        .call("echo", Some(json!("and well")), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!("and well"));

    transport.close("test done").await;
}

#[tokio::test]
async fn child_exit_drains_every_pending_call() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();

    let pending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .call("sleep", Some(json!({"ms": 10000})), Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    transport
        .notify("exit", Some(json!({"code": 1})))
        .await
        .unwrap();

    let outcome = pending.await.unwrap();
    assert!(
        matches!(outcome, Err(TransportError::ConnectionClosed { .. })),
        "got {:?}",
        outcome
    );

    transport.closed().await;
    assert_eq!(transport.state(), TransportState::Closed);
    let exit = transport.last_exit().expect("exit info recorded");
    assert_eq!(exit.code, Some(1));
}

#[tokio::test]
async fn oversized_reply_closes_the_connection() {
    let options = TransportOptions {
        max_message_size: 256,
        ..Default::default()
    };
    let transport = StdioTransport::connect(&mock_spec(), options).await.unwrap();

    let blob = "z".repeat(1024);
    let err = transport
        .call("echo", Some(json!({"blob": blob})), CALL_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        TransportError::ConnectionClosed { reason } => {
            assert!(reason.contains("frame"), "unexpected reason: {}", reason);
        }
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }

    transport.closed().await;
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn spawn_failure_surfaces_as_spawn_error() {
    let spec = ServerSpec {
        command: "/definitely/not/a/real/binary".to_string(),
        args: Vec::new(),
        working_directory: None,
        environment: HashMap::new(),
    };
    let err = StdioTransport::connect(&spec, TransportOptions::default())
        .await
        .err()
        .expect("spawn must fail");
    assert!(matches!(err, TransportError::Spawn { .. }), "got {:?}", err);
}

#[tokio::test]
async fn server_initiated_requests_reach_the_request_handler() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    transport.set_request_handler(Arc::new(Pong { tx }));

    let result = transport.call("callback", None, CALL_TIMEOUT).await.unwrap();
    assert_eq!(result, json!({"called_back": true}));

    let method = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "client/ping");

    transport.close("test done").await;
}

#[tokio::test]
async fn manager_caches_one_transport_and_reconnects_after_death() {
    let manager = TransportManager::new(
        HashMap::from([("mock".to_string(), mock_spec())]),
        fast_policy(3),
        TransportOptions::default(),
    );

    let result = manager
        .invoke("mock", "echo", Some(json!({"n": 1})), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 1}));

    let first = manager.get_transport("mock", &mock_spec()).await.unwrap();
    let second = manager.get_transport("mock", &mock_spec()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second), "live transport must be cached");

    // Kill the child out from under the manager.
    first.notify("exit", Some(json!({"code": 3}))).await.unwrap();
    first.closed().await;

    // The next invoke replaces the dead transport per the policy.
    let result = manager
        .invoke("mock", "echo", Some(json!({"n": 2})), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!({"n": 2}));

    let status = manager.status("mock").await;
    assert_eq!(status.state, Some(TransportState::Connected));
    assert_eq!(status.reconnect_attempt, 0, "attempt resets on success");

    manager.shutdown_all(Duration::from_secs(1)).await;
    let status = manager.status("mock").await;
    assert_eq!(status.state, Some(TransportState::Closed));
}

#[tokio::test]
async fn manager_stops_retrying_once_attempts_are_exhausted() {
    let bad = ServerSpec {
        command: "/definitely/not/a/real/binary".to_string(),
        args: Vec::new(),
        working_directory: None,
        environment: HashMap::new(),
    };
    let manager = TransportManager::new(
        HashMap::from([("bad".to_string(), bad)]),
        fast_policy(1),
        TransportOptions::default(),
    );

    let err = manager.invoke("bad", "echo", None, CALL_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn { .. }), "got {:?}", err);

    let err = manager.invoke("bad", "echo", None, CALL_TIMEOUT).await.unwrap_err();
    assert!(
        matches!(err, TransportError::MaxRetriesExceeded(_)),
        "got {:?}",
        err
    );

    let status = manager.status("bad").await;
    assert_eq!(status.reconnect_attempt, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn manager_rejects_unconfigured_servers() {
    let manager = TransportManager::new(HashMap::new(), fast_policy(1), TransportOptions::default());
    let err = manager.invoke("ghost", "echo", None, CALL_TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TransportError::UnknownServer(_)), "got {:?}", err);
}

#[tokio::test]
async fn subscribed_notifications_are_delivered() {
    let manager = TransportManager::new(
        HashMap::from([("mock".to_string(), mock_spec())]),
        fast_policy(3),
        TransportOptions::default(),
    );
    let (tx, mut rx) = mpsc::channel(8);
    manager
        .subscribe_notifications("mock", Arc::new(Capture { tx }))
        .await;

    let result = manager
        .invoke("mock", "emit", Some(json!({"k": "v"})), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!({"emitted": true}));

    let (method, params) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "event/emitted");
    assert_eq!(params, Some(json!({"k": "v"})));

    manager.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unknown_methods_surface_the_server_error() {
    let transport = StdioTransport::connect(&mock_spec(), TransportOptions::default())
        .await
        .unwrap();

    let err = transport
        .call("no/such/method", None, CALL_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        TransportError::Rpc { code, .. } => assert_eq!(code, -32601),
        other => panic!("expected Rpc error, got {:?}", other),
    }
    assert!(transport.is_connected());

    transport.close("test done").await;
}

#[tokio::test]
async fn process_manager_captures_the_stderr_tail_and_reaps() {
    let mut process = ProcessManager::spawn(&mock_spec()).unwrap();
    let mut stdin = process.take_stdin().unwrap();

    let mut frame = serde_json::to_vec(&JsonRpcMessage::request(
        1,
        "stderr",
        Some(json!({"text": "oops from the server"})),
    ))
    .unwrap();
    frame.push(b'\n');
    stdin.write_all(&frame).await.unwrap();
    stdin.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut exit_frame = serde_json::to_vec(&JsonRpcMessage::notification(
        "exit",
        Some(json!({"code": 0})),
    ))
    .unwrap();
    exit_frame.push(b'\n');
    stdin.write_all(&exit_frame).await.unwrap();
    stdin.flush().await.unwrap();

    let exit = process.wait().await;
    assert_eq!(exit.code, Some(0));
    assert!(
        exit.stderr_tail.contains("oops from the server"),
        "tail was: {}",
        exit.stderr_tail
    );

    // Killing an already-exited child is a no-op.
    let again = process.kill(Duration::from_millis(100)).await;
    assert_eq!(again.code, Some(0));
}
