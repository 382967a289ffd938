use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::process::ServerSpec;
use super::reconnect::{ReconnectPolicy, ReconnectState};
use super::stdio::{NotificationHandler, StdioTransport, TransportOptions, TransportState};
use super::TransportError;

/// Read-only health snapshot for one logical server, shaped for dashboard
/// display.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: Option<TransportState>,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

#[derive(Default)]
struct ServerEntry {
    transport: Option<Arc<StdioTransport>>,
    reconnect: ReconnectState,
    last_error: Option<String>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,
    /// Whether any launch was ever attempted for this id. The first launch
    /// skips the backoff wait; the policy gates everything after that.
    attempted: bool,
}

/// Maps a logical server id to at most one live transport, applying the
/// reconnect policy when a cached transport has died.
///
/// Constructed once at startup and passed by reference to callers, never an
/// ambient global. The id-to-entry map sits behind a short std mutex handing
/// out per-server async mutexes, so one server's backoff sleep never stalls
/// a lookup for another.
pub struct TransportManager {
    specs: RwLock<HashMap<String, ServerSpec>>,
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<ServerEntry>>>>,
    policy: ReconnectPolicy,
    options: TransportOptions,
}

impl TransportManager {
    pub fn new(
        specs: HashMap<String, ServerSpec>,
        policy: ReconnectPolicy,
        options: TransportOptions,
    ) -> Self {
        Self {
            specs: RwLock::new(specs),
            entries: Mutex::new(HashMap::new()),
            policy,
            options,
        }
    }

    pub fn add_server(&self, server_id: &str, spec: ServerSpec) {
        self.specs
            .write()
            .unwrap()
            .insert(server_id.to_string(), spec);
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.specs.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entry(&self, server_id: &str) -> Arc<tokio::sync::Mutex<ServerEntry>> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Lookup that never inserts, for read-only paths. Unbounded queries
    /// for unconfigured ids must not grow the entry map.
    fn existing_entry(&self, server_id: &str) -> Option<Arc<tokio::sync::Mutex<ServerEntry>>> {
        self.entries.lock().unwrap().get(server_id).cloned()
    }

    /// Return the cached transport for `server_id`, creating or replacing
    /// it per the reconnect policy when it is missing or has died.
    pub async fn get_transport(
        &self,
        server_id: &str,
        spec: &ServerSpec,
    ) -> Result<Arc<StdioTransport>, TransportError> {
        let entry = self.entry(server_id);
        let mut entry = entry.lock().await;

        if let Some(transport) = &entry.transport {
            if transport.is_connected() {
                return Ok(Arc::clone(transport));
            }
            // Carry the close reason into status() for dead transports.
            if entry.last_error.is_none() {
                entry.last_error = transport.close_reason();
            }
        }

        if entry.attempted {
            if !self.policy.should_retry(&entry.reconnect) {
                warn!(server_id, attempts = entry.reconnect.attempt, "reconnect attempts exhausted");
                return Err(TransportError::MaxRetriesExceeded(server_id.to_string()));
            }
            let delay = self.policy.next_delay(&entry.reconnect);
            debug!(server_id, attempt = entry.reconnect.attempt, ?delay, "backing off before reconnect");
            tokio::time::sleep(delay).await;
        }
        entry.attempted = true;

        match StdioTransport::connect(spec, self.options.clone()).await {
            Ok(transport) => {
                entry.reconnect = ReconnectState::default();
                entry.last_error = None;
                if let Some(handler) = &entry.notification_handler {
                    transport.set_notification_handler(Arc::clone(handler));
                }
                entry.transport = Some(Arc::clone(&transport));
                info!(server_id, "transport ready");
                Ok(transport)
            }
            Err(err) => {
                entry.reconnect.attempt += 1;
                entry.reconnect.next_delay = self.policy.next_delay(&entry.reconnect);
                entry.last_error = Some(err.to_string());
                warn!(server_id, attempt = entry.reconnect.attempt, error = %err, "connection attempt failed");
                Err(err)
            }
        }
    }

    /// The call surface the rest of the system uses: one request against a
    /// configured server, connecting or reconnecting as needed.
    pub async fn invoke(
        &self,
        server_id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let spec = self.spec_for(server_id)?;
        let transport = self.get_transport(server_id, &spec).await?;
        transport.call(method, params, timeout).await
    }

    /// Fire-and-forget notification against a configured server.
    pub async fn notify(
        &self,
        server_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let spec = self.spec_for(server_id)?;
        let transport = self.get_transport(server_id, &spec).await?;
        transport.notify(method, params).await
    }

    /// Register a handler for server-initiated messages. The registration
    /// survives reconnects: it is re-attached to every replacement
    /// transport.
    pub async fn subscribe_notifications(
        &self,
        server_id: &str,
        handler: Arc<dyn NotificationHandler>,
    ) {
        if !self.specs.read().unwrap().contains_key(server_id) {
            warn!(server_id, "dropping subscription for unconfigured server");
            return;
        }
        let entry = self.entry(server_id);
        let mut entry = entry.lock().await;
        if let Some(transport) = &entry.transport {
            transport.set_notification_handler(Arc::clone(&handler));
        }
        entry.notification_handler = Some(handler);
    }

    pub async fn status(&self, server_id: &str) -> ServerStatus {
        let Some(entry) = self.existing_entry(server_id) else {
            return ServerStatus {
                state: None,
                last_error: None,
                reconnect_attempt: 0,
            };
        };
        let entry = entry.lock().await;
        let state = entry.transport.as_ref().map(|t| t.state());
        let last_error = entry.last_error.clone().or_else(|| {
            entry
                .transport
                .as_ref()
                .filter(|t| !t.is_connected())
                .and_then(|t| t.close_reason())
        });
        ServerStatus {
            state,
            last_error,
            reconnect_attempt: entry.reconnect.attempt,
        }
    }

    /// Close every cached transport; used at process-wide teardown.
    pub async fn shutdown_all(&self, grace: Duration) {
        let entries: Vec<Arc<tokio::sync::Mutex<ServerEntry>>> =
            self.entries.lock().unwrap().values().cloned().collect();

        let mut transports = Vec::new();
        for entry in entries {
            let entry = entry.lock().await;
            if let Some(transport) = &entry.transport {
                transports.push(Arc::clone(transport));
            }
        }
        info!(count = transports.len(), "shutting down transports");
        join_all(transports.iter().map(|transport| {
            transport.set_kill_grace(grace);
            transport.close("shutting down")
        }))
        .await;
    }

    fn spec_for(&self, server_id: &str) -> Result<ServerSpec, TransportError> {
        self.specs
            .read()
            .unwrap()
            .get(server_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownServer(server_id.to_string()))
    }
}
