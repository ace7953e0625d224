//! One connection's worth of state, and the task that drives it.
//!
//! Every `connect()` creates a [`Session`] with its own link and registry.
//! A dispatcher task owns the framer and consumes the session's transport
//! events until `Close`, so a late close from an old session can only
//! drain that session.

use crate::error::ClientError;
use crate::listeners::Listeners;
use crate::registry::{CorrelationRegistry, Pending};
use crate::transport::{Link, LinkHandle, TransportEvent};
use electrum_protocol::{
    encode_line, make_request, BatchRequest, Frame, Framer, IdGenerator, InboundMessage,
    TextEncoding,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Observer for transport and protocol faults.
pub type ErrorHook = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// State shared between the client handle and its dispatchers.
pub(crate) struct SessionContext {
    connected: AtomicBool,
    current: Mutex<Option<Arc<Session>>>,
    pub(crate) listeners: Listeners,
    on_error: RwLock<Option<ErrorHook>>,
}

impl SessionContext {
    pub(crate) fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            current: Mutex::new(None),
            listeners: Listeners::new(),
            on_error: RwLock::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flips to connected and installs a fresh current session.
    ///
    /// Returns `None` when already connected.
    pub(crate) fn begin_session(&self, id: u64) -> Option<Arc<Session>> {
        let mut current = self.current.lock();
        if self.connected.swap(true, Ordering::SeqCst) {
            return None;
        }
        let session = Arc::new(Session::new(id));
        *current = Some(session.clone());
        Some(session)
    }

    /// Flips to disconnected if `session` is still the current one.
    pub(crate) fn end_session(&self, session: &Session) {
        let current = self.current.lock();
        if current.as_ref().is_some_and(|c| c.id == session.id) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    /// Flips to disconnected and returns the session that was current.
    ///
    /// Returns `None` when already disconnected.
    pub(crate) fn end_current(&self) -> Option<Arc<Session>> {
        let current = self.current.lock();
        if !self.connected.swap(false, Ordering::SeqCst) {
            return None;
        }
        current.clone()
    }

    pub(crate) fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().clone()
    }

    pub(crate) fn set_error_hook(&self, hook: Option<ErrorHook>) {
        *self.on_error.write() = hook;
    }

    /// Hands `error` to the hook, or logs it when none is installed.
    pub(crate) fn report(&self, error: &ClientError) {
        let hook = self.on_error.read().clone();
        match hook {
            Some(hook) => hook(error),
            None => tracing::warn!("Unhandled client error: {}", error),
        }
    }
}

/// A single connection attempt and everything scoped to it.
pub(crate) struct Session {
    pub(crate) id: u64,
    link: tokio::sync::Mutex<Option<Link>>,
    handle: Mutex<Option<LinkHandle>>,
    registry: Mutex<CorrelationRegistry>,
}

impl Session {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            link: tokio::sync::Mutex::new(None),
            handle: Mutex::new(None),
            registry: Mutex::new(CorrelationRegistry::new()),
        }
    }

    /// Write lock over the link. The connect path holds it for the handshake.
    pub(crate) async fn link(&self) -> tokio::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().await
    }

    /// The write lock, if nobody holds it.
    pub(crate) fn try_link(&self) -> Option<tokio::sync::MutexGuard<'_, Option<Link>>> {
        self.link.try_lock().ok()
    }

    /// Installs `link` in `slot` and keeps its teardown handle outside the lock.
    pub(crate) fn attach(&self, slot: &mut Option<Link>, link: Link) {
        *self.handle.lock() = Some(link.handle());
        *slot = Some(link);
    }

    /// Destroys the link without taking the write lock.
    ///
    /// An in-flight write fails with `ClosedWhileInFlight`. Returns whether
    /// a link was attached.
    pub(crate) fn shutdown(&self) -> bool {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                handle.destroy();
                true
            }
            None => false,
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Assigns an id, records the call and writes it, in that order, under the write lock.
    pub(crate) async fn send_request(
        &self,
        ids: &IdGenerator,
        method: &str,
        params: &[Value],
    ) -> Result<(u64, Pending), ClientError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let id = ids.next_id();
        let payload = make_request(method, params, id)?;
        let pending = self.registry.lock().register(id)?;

        tracing::debug!("Sending request id={} method={}", id, method);
        if let Err(e) = link.write(&encode_line(&payload)).await {
            self.registry.lock().remove(id);
            return Err(e);
        }
        Ok((id, pending))
    }

    /// Like [`send_request`](Self::send_request) for a whole batch in one write.
    pub(crate) async fn send_batch(
        &self,
        ids: &IdGenerator,
        method: &str,
        params: &[Value],
        second: Option<&Value>,
    ) -> Result<(BatchRequest, Pending), ClientError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let batch = electrum_protocol::make_batch(method, params, second, ids)?;
        let member_ids: Vec<u64> = batch.ids().collect();
        let pending = self.registry.lock().register_batch(&member_ids)?;

        tracing::debug!(
            "Sending batch of {} method={} ids={:?}",
            batch.len(),
            method,
            member_ids
        );
        if let Err(e) = link.write(&encode_line(&batch.payload)).await {
            if let Some(last) = batch.last_id() {
                self.registry.lock().remove(last);
            }
            return Err(e);
        }
        Ok((batch, pending))
    }

    /// Fails everything still pending and refuses new calls on this session.
    pub(crate) fn drain(&self) -> usize {
        self.registry.lock().close()
    }

    /// Consumes transport events until the link closes.
    pub(crate) async fn run(
        self: Arc<Self>,
        ctx: Arc<SessionContext>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        encoding: TextEncoding,
    ) {
        tracing::debug!("Session {} dispatcher started", self.id);
        let mut framer = Framer::new();

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connect => {
                    tracing::debug!("Session {} connected", self.id);
                }
                TransportEvent::Data(chunk) => {
                    tracing::trace!("Session {} received {} bytes", self.id, chunk.len());
                    framer.extend(&chunk);
                    for frame in framer.frames() {
                        match frame {
                            Ok(frame) => self.handle_frame(&ctx, frame, encoding),
                            Err(e) => {
                                tracing::warn!("Session {} framing error: {}", self.id, e);
                                ctx.report(&ClientError::Protocol(e));
                            }
                        }
                    }
                }
                TransportEvent::Error(e) => {
                    tracing::debug!("Session {} transport error: {}", self.id, e);
                    ctx.report(&ClientError::Transport(e));
                }
                TransportEvent::Close => {
                    self.teardown(&ctx);
                    break;
                }
            }
        }

        tracing::debug!("Session {} dispatcher stopped", self.id);
    }

    fn handle_frame(&self, ctx: &SessionContext, frame: Frame, encoding: TextEncoding) {
        let message = frame
            .parse(encoding)
            .and_then(InboundMessage::classify);

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Discarding malformed message #{}: {}", frame.sequence, e);
                ctx.report(&ClientError::MalformedMessage {
                    sequence: frame.sequence,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if let InboundMessage::Notification { method, params } = &message {
            let delivered = ctx.listeners.deliver(method, params);
            tracing::debug!("Notification {} delivered to {} listener(s)", method, delivered);
            return;
        }

        let outcome = self.registry.lock().dispatch(message);
        if let Err(violation) = outcome {
            tracing::warn!("Session {} {}", self.id, violation);
            ctx.report(&violation);
        }
    }

    fn teardown(&self, ctx: &SessionContext) {
        ctx.end_session(self);
        let failed = self.drain();
        tracing::debug!(
            "Session {} closed, {} pending request(s) failed",
            self.id,
            failed
        );
    }
}
