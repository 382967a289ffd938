//! Wire-level mock tool server for integration tests and local demos.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on its own stdin/stdout. Every
//! request is handled in its own task, so `sleep` replies can overtake
//! later requests and exercise out-of-order response delivery.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use mcp_hub::internal::mcp::protocol::{JsonRpcError, JsonRpcMessage, METHOD_NOT_FOUND};

#[tokio::main]
async fn main() {
    let (reply_tx, mut reply_rx) = mpsc::channel::<JsonRpcMessage>(64);

    // Single writer task keeps frames whole.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = reply_rx.recv().await {
            let mut frame = match serde_json::to_vec(&message) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            frame.push(b'\n');
            if stdout.write_all(&frame).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let message: JsonRpcMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("[mock] ignoring unparseable line: {}", e);
                continue;
            }
        };
        tokio::spawn(handle(message, reply_tx.clone()));
    }

    drop(reply_tx);
    let _ = writer.await;
}

async fn handle(message: JsonRpcMessage, reply_tx: mpsc::Sender<JsonRpcMessage>) {
    // Responses to our own callbacks land here too; nothing to do with them.
    let Some(method) = message.method.clone() else {
        return;
    };
    let params = message.params.clone().unwrap_or(Value::Null);

    match method.as_str() {
        // Reply with the request params verbatim.
        "echo" => {
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::response(Some(id), params))
                    .await;
            }
        }
        // Delay the reply by params.ms milliseconds.
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::response(Some(id), json!({ "slept": ms })))
                    .await;
            }
        }
        // Send a server-initiated notification, then acknowledge.
        "emit" => {
            let _ = reply_tx
                .send(JsonRpcMessage::notification(
                    "event/emitted",
                    Some(params),
                ))
                .await;
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::response(Some(id), json!({ "emitted": true })))
                    .await;
            }
        }
        // Issue a server-to-client request, then acknowledge the original.
        "callback" => {
            let _ = reply_tx
                .send(JsonRpcMessage {
                    jsonrpc: "2.0".to_string(),
                    id: Some(json!("srv-cb-1")),
                    method: Some("client/ping".to_string()),
                    params: Some(json!({})),
                    result: None,
                    error: None,
                })
                .await;
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::response(Some(id), json!({ "called_back": true })))
                    .await;
            }
        }
        // Write params.text to stderr, for stderr-tail tests.
        "stderr" => {
            if let Some(text) = params.get("text").and_then(Value::as_str) {
                eprintln!("{}", text);
            }
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::response(Some(id), json!({ "ok": true })))
                    .await;
            }
        }
        // Terminate immediately with the given exit code.
        "exit" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(0);
            std::process::exit(code as i32);
        }
        _ => {
            if let Some(id) = message.id {
                let _ = reply_tx
                    .send(JsonRpcMessage::error_response(
                        Some(id),
                        JsonRpcError {
                            code: METHOD_NOT_FOUND,
                            message: format!("unknown method '{}'", method),
                            data: None,
                        },
                    ))
                    .await;
            }
        }
    }
}
