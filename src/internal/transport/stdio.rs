use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::internal::mcp::codec::{encode_message, FrameDecoder};
use crate::internal::mcp::protocol::{
    JsonRpcError, JsonRpcMessage, MessageKind, METHOD_NOT_FOUND,
};

use super::process::{ExitInfo, ProcessManager, ServerSpec};
use super::registry::RequestRegistry;
use super::TransportError;

/// Lifecycle of one transport. `Closed` is terminal: reconnecting means
/// building a new transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Ceiling for a single inbound frame; exceeding it closes the
    /// connection.
    pub max_message_size: usize,
    /// How long a killed child gets to exit on its own before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
            kill_grace: Duration::from_secs(3),
        }
    }
}

/// Server-initiated notifications (messages with a method and no id).
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, method: &str, params: Option<Value>);
}

/// Server-to-client requests (the server calling back into us). Rare in
/// practice but part of the protocol; without a registered handler the
/// transport answers method-not-found so the server is never left hanging.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn on_request(&self, method: &str, params: Option<Value>)
        -> Result<Value, JsonRpcError>;
}

const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const EXPIRE_TICK: Duration = Duration::from_millis(100);

/// One live connection to a spawned tool server.
///
/// Three tasks run per transport: a write loop draining the FIFO outbound
/// queue into child stdin, a read loop decoding child stdout, and a
/// supervisory task that owns the child process, sweeps request deadlines,
/// and reaps on exit. `call()` suspends only the calling task.
pub struct StdioTransport {
    state: watch::Sender<TransportState>,
    registry: Arc<RequestRegistry>,
    outbound: mpsc::Sender<JsonRpcMessage>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    closing: AtomicBool,
    close_reason: Mutex<Option<String>>,
    last_exit: Mutex<Option<ExitInfo>>,
    kill_grace_ms: AtomicU64,
    notification_handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    options: TransportOptions,
}

impl StdioTransport {
    /// Spawn the child described by `spec` and start the loops. Returns
    /// once the transport is `Connected`.
    pub async fn connect(
        spec: &ServerSpec,
        options: TransportOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let (state, _) = watch::channel(TransportState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let mut process = ProcessManager::spawn(spec)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| TransportError::connection_closed("child stdin was not piped"))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| TransportError::connection_closed("child stdout was not piped"))?;

        let kill_grace_ms = options.kill_grace.as_millis() as u64;
        let transport = Arc::new(Self {
            state,
            registry: Arc::new(RequestRegistry::new()),
            outbound: outbound_tx,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            last_exit: Mutex::new(None),
            kill_grace_ms: AtomicU64::new(kill_grace_ms),
            notification_handler: RwLock::new(None),
            request_handler: RwLock::new(None),
            options,
        });

        // Publish Connected before any loop runs, so an instantly-dying
        // child can never have its Closing overwritten by this write.
        transport.state.send_replace(TransportState::Connected);

        let write_task = tokio::spawn(Arc::clone(&transport).run_write_loop(stdin, outbound_rx));
        let read_task = tokio::spawn(Arc::clone(&transport).run_read_loop(stdout));
        tokio::spawn(Arc::clone(&transport).run_supervisor(process, write_task, read_task));

        info!(command = %spec.command, "transport connected");
        Ok(transport)
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Exit details of the reaped child, once it has exited.
    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.last_exit.lock().unwrap().clone()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap().clone()
    }

    pub fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self.notification_handler.write().unwrap() = Some(handler);
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.request_handler.write().unwrap() = Some(handler);
    }

    pub fn set_kill_grace(&self, grace: Duration) {
        self.kill_grace_ms
            .store(grace.as_millis() as u64, Ordering::Relaxed);
    }

    /// Issue a request and await its response.
    ///
    /// Requests are written in `call()` invocation order. On timeout the
    /// pending entry is removed and the caller gets `Timeout`; no cancel
    /// message is sent to the child, so a late response is simply dropped.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self
            .registry
            .register(id, Instant::now() + timeout, timeout);

        let message = JsonRpcMessage::request(id, method, params);
        if self.outbound.send(message).await.is_err() {
            self.registry.discard(id);
            return Err(self.closed_error());
        }
        match receiver.await {
            Ok(outcome) => outcome,
            // Resolver dropped without resolving: the transport tore down.
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Enqueue a notification. No response is expected and none will come.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        self.outbound
            .send(JsonRpcMessage::notification(method, params))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Stop the transport: drain every pending request, terminate the
    /// child, and wait until the state machine reaches `Closed`.
    pub async fn close(&self, reason: &str) {
        self.begin_close(reason);
        self.closed().await;
    }

    /// Wait until the transport reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            if *state.borrow_and_update() == TransportState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// First half of teardown, callable from any task (including the loops
    /// themselves) and idempotent. The supervisory task finishes the job:
    /// kill, reap, await the loops, publish `Closed`.
    fn begin_close(&self, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason, "transport closing");
        *self.close_reason.lock().unwrap() = Some(reason.to_string());
        self.state.send_replace(TransportState::Closing);
        self.registry.drain(reason);
        self.shutdown.cancel();
    }

    fn closed_error(&self) -> TransportError {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "transport is not connected".to_string());
        TransportError::connection_closed(reason)
    }

    async fn run_write_loop(
        self: Arc<Self>,
        mut stdin: ChildStdin,
        mut outbound: mpsc::Receiver<JsonRpcMessage>,
    ) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    let frame = match encode_message(&message) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "refusing to write invalid message");
                            if let Some(id) = message.numeric_id() {
                                self.registry.resolve(id, Err(TransportError::Codec(err)));
                            }
                            continue;
                        }
                    };
                    if let Err(err) = stdin.write_all(&frame).await {
                        self.begin_close(&format!("write to child failed: {err}"));
                        break;
                    }
                    if let Err(err) = stdin.flush().await {
                        self.begin_close(&format!("flush to child failed: {err}"));
                        break;
                    }
                }
            }
        }
        // Dropping stdin here delivers EOF: the graceful termination signal.
    }

    async fn run_read_loop(self: Arc<Self>, mut stdout: ChildStdout) {
        let shutdown = self.shutdown.clone();
        let mut decoder = FrameDecoder::new(self.options.max_message_size);
        let mut chunk = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => {
                        self.begin_close("server closed its stdout");
                        break;
                    }
                    Ok(n) => match decoder.feed(&chunk[..n]) {
                        Ok(frames) => {
                            for frame in frames {
                                match frame {
                                    Ok(message) => self.dispatch_inbound(message),
                                    Err(err) => {
                                        warn!(error = %err, "dropping malformed frame");
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            self.begin_close(&err.to_string());
                            break;
                        }
                    },
                    Err(err) => {
                        self.begin_close(&format!("read from child failed: {err}"));
                        break;
                    }
                }
            }
        }
    }

    fn dispatch_inbound(self: &Arc<Self>, message: JsonRpcMessage) {
        match message.kind() {
            MessageKind::Response => {
                let Some(id) = message.numeric_id() else {
                    warn!(id = ?message.id, "dropping response with non-numeric id");
                    return;
                };
                let outcome = match message.error {
                    Some(err) => Err(TransportError::Rpc {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                self.registry.resolve(id, outcome);
            }
            MessageKind::Notification => {
                let handler = self.notification_handler.read().unwrap().clone();
                let Some(handler) = handler else {
                    debug!(method = ?message.method, "no notification handler registered");
                    return;
                };
                let method = message.method.unwrap_or_default();
                tokio::spawn(async move {
                    handler.on_notification(&method, message.params).await;
                });
            }
            MessageKind::Request => {
                // Handled off the read loop so a slow handler cannot stall
                // response dispatch.
                let handler = self.request_handler.read().unwrap().clone();
                let outbound = self.outbound.clone();
                let method = message.method.unwrap_or_default();
                tokio::spawn(async move {
                    let reply = match handler {
                        Some(handler) => {
                            match handler.on_request(&method, message.params).await {
                                Ok(result) => JsonRpcMessage::response(message.id, result),
                                Err(err) => JsonRpcMessage::error_response(message.id, err),
                            }
                        }
                        None => JsonRpcMessage::error_response(
                            message.id,
                            JsonRpcError {
                                code: METHOD_NOT_FOUND,
                                message: "no request handler registered".to_string(),
                                data: None,
                            },
                        ),
                    };
                    let _ = outbound.send(reply).await;
                });
            }
            MessageKind::Invalid => {
                warn!(id = ?message.id, method = ?message.method, "dropping invalid message");
            }
        }
    }

    async fn run_supervisor(
        self: Arc<Self>,
        mut process: ProcessManager,
        write_task: JoinHandle<()>,
        read_task: JoinHandle<()>,
    ) {
        let shutdown = self.shutdown.clone();
        let mut expire_tick = tokio::time::interval(EXPIRE_TICK);
        expire_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                exit = process.wait() => break exit,
                _ = shutdown.cancelled() => {
                    let grace = Duration::from_millis(self.kill_grace_ms.load(Ordering::Relaxed));
                    break process.kill(grace).await;
                }
                _ = expire_tick.tick() => self.registry.expire_due(Instant::now()),
            }
        };

        if exit.code == Some(0) {
            debug!("tool server exited cleanly");
        } else {
            warn!(code = ?exit.code, stderr_tail = %exit.stderr_tail, "tool server exited");
        }
        let reason = match exit.code {
            Some(code) => format!("process exited with code {code}"),
            None => "process exited".to_string(),
        };
        *self.last_exit.lock().unwrap() = Some(exit);

        // No-op if close was already begun by close()/the loops; otherwise
        // this is how an idle child's death surfaces to in-flight callers.
        self.begin_close(&reason);

        let _ = write_task.await;
        let _ = read_task.await;
        // Anything registered between drain and loop exit.
        self.registry.drain(&self.close_reason().unwrap_or(reason));
        self.state.send_replace(TransportState::Closed);
    }
}
