//! High-level client API.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listeners::NotificationCallback;
use crate::session::{ErrorHook, Session, SessionContext};
use crate::transport::Transport;
use electrum_protocol::{IdGenerator, TextEncoding};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Connection state as seen by request admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// One member of a batch call, aligned to the parameter that produced it.
#[derive(Debug)]
pub struct BatchItem {
    pub id: u64,
    pub param: Value,
    pub result: Result<Value, ClientError>,
}

impl BatchItem {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Electrum JSON-RPC client.
///
/// Cloning is cheap; clones share the connection, id counter and listeners.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transport: Mutex<Transport>,
    ids: IdGenerator,
    ctx: Arc<SessionContext>,
    sessions: AtomicU64,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.server)
            .field("state", &self.state())
            .field("last_issued_id", &self.last_issued_id())
            .finish()
    }
}

impl Client {
    /// Creates a disconnected client for the configured server.
    pub fn new(config: ClientConfig) -> Self {
        let transport = Transport::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Mutex::new(transport),
                ids: IdGenerator::new(),
                ctx: Arc::new(SessionContext::new()),
                sessions: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a client from `ELECTRUM_CONFIG` and `ELECTRUM_*` variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Ok(Self::new(ClientConfig::load()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connects to the server. A no-op when already connected.
    ///
    /// The client counts as connected from the moment this is called;
    /// requests issued before the handshake finishes wait for it.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let ctx = &self.inner.ctx;
        let session_id = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(session) = ctx.begin_session(session_id) else {
            tracing::debug!("connect() called while connected");
            return Ok(());
        };
        let mut link_slot = session.link().await;

        let transport = self.inner.transport.lock().clone();
        let encoding = transport.socket().encoding;
        let server = &self.inner.config.server;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        match transport.connect(&server.host, server.port, events_tx).await {
            Ok(link) => {
                session.attach(&mut link_slot, link);
                drop(link_slot);
                tokio::spawn(session.clone().run(ctx.clone(), events_rx, encoding));
                tracing::debug!(
                    "Connected to {}:{} (session {})",
                    server.host,
                    server.port,
                    session_id
                );
                Ok(())
            }
            Err(e) => {
                drop(link_slot);
                tracing::warn!("Connection to {}:{} failed: {}", server.host, server.port, e);
                ctx.report(&e);
                ctx.end_session(&session);
                session.drain();
                Err(e)
            }
        }
    }

    /// Closes the connection. A no-op when already disconnected.
    ///
    /// Pending requests fail with `ClosedWhileInFlight` once the transport
    /// reports the close. A write stuck on a peer that stopped reading is
    /// cut off rather than waited for.
    pub async fn close(&self) {
        let Some(session) = self.inner.ctx.end_current() else {
            tracing::debug!("close() called while disconnected");
            return;
        };
        tracing::debug!("Closing session {}", session.id);

        let mut slot = match session.try_link() {
            Some(slot) => slot,
            None => {
                // Held by a write or by the handshake.
                if session.shutdown() {
                    tracing::debug!("Session {} destroyed with a write in flight", session.id);
                }
                session.link().await
            }
        };
        if let Some(mut link) = slot.take() {
            drop(slot);
            if !link.is_closed() {
                link.end().await;
            }
            link.destroy();
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.ctx.is_connected()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Sends `method` with `params` and waits for its response.
    pub async fn request(&self, method: &str, params: &[Value]) -> Result<Value, ClientError> {
        let session = self.admit()?;
        let (id, pending) = session
            .send_request(&self.inner.ids, method, params)
            .await?;

        let outcome = pending.await.map_err(|_| ClientError::ClosedWhileInFlight)?;
        tracing::debug!("Request id={} completed (ok={})", id, outcome.is_ok());
        outcome
    }

    /// Calls `method` once per element of `params` in a single batch write.
    ///
    /// Each call's params are `[param]`, or `[param, second]` when `second`
    /// is given. Results come back in input order, one per parameter.
    pub async fn request_batch(
        &self,
        method: &str,
        params: &[Value],
        second: Option<&Value>,
    ) -> Result<Vec<BatchItem>, ClientError> {
        let session = self.admit()?;
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let (batch, pending) = session
            .send_batch(&self.inner.ids, method, params, second)
            .await?;
        let raw = pending.await.map_err(|_| ClientError::ClosedWhileInFlight)??;

        let items: Vec<BatchItem> = batch
            .align(raw)?
            .into_iter()
            .map(|entry| BatchItem {
                id: entry.id,
                param: entry.param,
                result: match entry.outcome {
                    Some(outcome) => outcome.map_err(ClientError::Server),
                    None => Err(ClientError::MissingBatchResponse(entry.id)),
                },
            })
            .collect();

        tracing::debug!(
            "Batch {} completed: {}/{} ok",
            method,
            items.iter().filter(|item| item.is_ok()).count(),
            items.len()
        );
        Ok(items)
    }

    fn admit(&self) -> Result<Arc<Session>, ClientError> {
        if !self.is_connected() {
            tracing::debug!("Request rejected: not connected");
            return Err(ClientError::ConnectionLost);
        }
        self.inner.ctx.current().ok_or(ClientError::ConnectionLost)
    }

    /// Number of calls awaiting a response on the current connection.
    pub fn pending_count(&self) -> usize {
        self.inner
            .ctx
            .current()
            .map_or(0, |session| session.pending_count())
    }

    /// The most recently issued request id (0 before the first request).
    pub fn last_issued_id(&self) -> u64 {
        self.inner.ids.last_id()
    }

    // =========================================================================
    // Notifications and errors
    // =========================================================================

    /// Registers a callback for notifications of `method`.
    pub fn on_notification<F>(&self, method: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: NotificationCallback = Arc::new(callback);
        self.inner.ctx.listeners.add_callback(method, callback);
    }

    /// Returns a receiver for notifications of `method`.
    pub fn subscribe(&self, method: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        self.inner.ctx.listeners.add_channel(method)
    }

    /// Removes all listeners for `method`.
    pub fn remove_listeners(&self, method: &str) -> usize {
        self.inner.ctx.listeners.remove(method)
    }

    /// Installs the error hook. Errors are observational; they never fail requests.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        let hook: ErrorHook = Arc::new(hook);
        self.inner.ctx.set_error_hook(Some(hook));
    }

    // =========================================================================
    // Socket settings (applied at the next connect)
    // =========================================================================

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.transport.lock().set_timeout(timeout);
    }

    pub fn set_keep_alive(&self, enabled: bool) {
        self.inner.transport.lock().set_keep_alive(enabled);
    }

    pub fn set_no_delay(&self, enabled: bool) {
        self.inner.transport.lock().set_no_delay(enabled);
    }

    pub fn set_encoding(&self, encoding: TextEncoding) {
        self.inner.transport.lock().set_encoding(encoding);
    }
}
