//! Plain and TLS transports behind one lifecycle.
//!
//! A [`Transport`] is selected once from the configured [`Protocol`] and
//! buffers socket settings until [`Transport::connect`] applies them to a
//! fresh socket. A successful connect yields a [`Link`]: the write half of
//! the socket plus a background reader that reports everything it sees as
//! [`TransportEvent`]s. Every link emits exactly one `Close`.
//!
//! A [`LinkHandle`] tears a link down from outside whatever lock guards
//! its writer, cutting off a write that the peer is not draining.

use crate::config::{ClientConfig, Protocol, SocketConfig, TlsOptions};
use crate::error::ClientError;
use crate::stream::SocketStream;
use crate::tls::create_tls_connector;
use bytes::Bytes;
use electrum_protocol::TextEncoding;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Socket read buffer size (8 KiB).
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Upper bound on the graceful half-close in [`Link::end`].
pub const END_GRACE: Duration = Duration::from_secs(1);

/// Events emitted by a live link.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket (and TLS session, if any) is established.
    Connect,
    /// A chunk of bytes arrived.
    Data(Bytes),
    /// A socket error, or `TimedOut` while waiting for the first byte.
    Error(io::Error),
    /// The link is gone. Always the last event.
    Close,
}

/// Unencrypted TCP transport.
#[derive(Debug, Clone)]
pub struct PlainTransport {
    socket: SocketConfig,
}

/// TLS transport. See [`crate::tls`] for the verification policy.
#[derive(Debug, Clone)]
pub struct SecureTransport {
    socket: SocketConfig,
    tls: TlsOptions,
}

/// The two transport variants.
#[derive(Debug, Clone)]
pub enum Transport {
    Plain(PlainTransport),
    Secure(SecureTransport),
}

impl PlainTransport {
    async fn open(&self, host: &str, port: u16) -> Result<SocketStream, ClientError> {
        let stream = open_tcp(host, port, &self.socket).await?;
        Ok(SocketStream::Plain { stream })
    }
}

impl SecureTransport {
    async fn open(&self, host: &str, port: u16) -> Result<SocketStream, ClientError> {
        let (connector, server_name) = create_tls_connector(&self.tls, host)?;
        let tcp = open_tcp(host, port, &self.socket).await?;

        tracing::debug!("Performing TLS handshake with {}:{}", host, port);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        tracing::debug!("TLS handshake complete");

        Ok(SocketStream::Secure { stream })
    }
}

impl Transport {
    pub fn new(protocol: Protocol, socket: SocketConfig, tls: TlsOptions) -> Self {
        match protocol {
            Protocol::Tcp => Transport::Plain(PlainTransport { socket }),
            Protocol::Tls => Transport::Secure(SecureTransport { socket, tls }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.server.protocol,
            config.socket.clone(),
            config.tls.clone(),
        )
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Plain(_) => Protocol::Tcp,
            Transport::Secure(_) => Protocol::Tls,
        }
    }

    /// Buffered socket settings.
    pub fn socket(&self) -> &SocketConfig {
        match self {
            Transport::Plain(t) => &t.socket,
            Transport::Secure(t) => &t.socket,
        }
    }

    fn socket_mut(&mut self) -> &mut SocketConfig {
        match self {
            Transport::Plain(t) => &mut t.socket,
            Transport::Secure(t) => &mut t.socket,
        }
    }

    /// Sets the idle window guarding the connect and the first read (`None` disables it).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_mut().idle_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
    }

    pub fn set_keep_alive(&mut self, enabled: bool) {
        self.socket_mut().keep_alive = enabled;
    }

    pub fn set_no_delay(&mut self, enabled: bool) {
        self.socket_mut().no_delay = enabled;
    }

    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        self.socket_mut().encoding = encoding;
    }

    /// Opens the socket, applying the buffered settings, and starts the reader.
    ///
    /// The idle window bounds the TCP connect and TLS handshake. Events for
    /// the returned link are sent on `events`, starting with `Connect`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Link, ClientError> {
        tracing::debug!("Connecting to {}:{} over {}", host, port, self.protocol());
        let idle_timeout = self.socket().idle_timeout();

        let open = async {
            match self {
                Transport::Plain(t) => t.open(host, port).await,
                Transport::Secure(t) => t.open(host, port).await,
            }
        };

        let stream = match idle_timeout {
            Some(window) => tokio::time::timeout(window, open).await.map_err(|_| {
                tracing::debug!("Connection timeout after {:?}", window);
                ClientError::Timeout
            })??,
            None => open.await?,
        };

        Ok(Link::start(stream, idle_timeout, events))
    }
}

async fn open_tcp(host: &str, port: u16, config: &SocketConfig) -> Result<TcpStream, ClientError> {
    let mut last_error = None;

    for addr in tokio::net::lookup_host((host, port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(config.keep_alive)?;

        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(config.no_delay)?;
                tracing::debug!("TCP connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", host),
            )
        })
        .into())
}

/// Emits the link's single `Close` event.
#[derive(Clone)]
struct CloseSignal {
    fired: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl CloseSignal {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Close);
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Forceful teardown for a [`Link`], usable without access to the link itself.
#[derive(Clone)]
pub struct LinkHandle {
    shutdown: Arc<watch::Sender<bool>>,
    reader: AbortHandle,
    close: CloseSignal,
}

impl LinkHandle {
    /// Abandons any in-flight write, stops the reader and emits `Close` if not yet emitted.
    pub fn destroy(&self) {
        self.shutdown.send_replace(true);
        self.reader.abort();
        self.close.fire();
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A live connection: writer plus background reader.
pub struct Link {
    writer: Option<WriteHalf<SocketStream>>,
    shutdown: watch::Receiver<bool>,
    handle: LinkHandle,
    secure: bool,
    peer: Option<SocketAddr>,
}

impl Link {
    fn start(
        stream: SocketStream,
        idle_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let secure = stream.is_secure();
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);

        let close = CloseSignal {
            fired: Arc::new(AtomicBool::new(false)),
            events: events.clone(),
        };
        let _ = events.send(TransportEvent::Connect);
        let reader = tokio::spawn(read_loop(read_half, idle_timeout, events, close.clone()));
        let (shutdown_tx, shutdown) = watch::channel(false);

        Self {
            writer: Some(write_half),
            shutdown,
            handle: LinkHandle {
                shutdown: Arc::new(shutdown_tx),
                reader: reader.abort_handle(),
                close,
            },
            secure,
            peer,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns whether `destroy` ran or the reader finished.
    pub fn is_closed(&self) -> bool {
        self.handle.close.is_fired()
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Writes one encoded document (already newline-terminated).
    ///
    /// Fails with `ClosedWhileInFlight` if the link is destroyed mid-write.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;

        let result = tokio::select! {
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
            _ = shutdown.wait_for(|down| *down) => {
                tracing::debug!("Write of {} bytes abandoned, link destroyed", data.len());
                return Err(ClientError::ClosedWhileInFlight);
            }
        };

        if let Err(ref e) = result {
            tracing::debug!("Write failed: {}", e);
            let _ = self
                .handle
                .close
                .events
                .send(TransportEvent::Error(io::Error::new(e.kind(), e.to_string())));
        }
        Ok(result?)
    }

    /// Half-closes the write side, giving up after [`END_GRACE`].
    pub async fn end(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            tracing::debug!("Shutting down writer");
            match tokio::time::timeout(END_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Writer shutdown failed: {}", e),
                Err(_) => tracing::debug!("Writer shutdown timed out after {:?}", END_GRACE),
            }
        }
    }

    /// Drops the socket, stops the reader and emits `Close` if not yet emitted.
    pub fn destroy(&mut self) {
        self.writer = None;
        self.handle.destroy();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn read_loop(
    mut reader: ReadHalf<SocketStream>,
    mut idle_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close: CloseSignal,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match idle_timeout {
            Some(window) => match tokio::time::timeout(window, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!("No data received within {:?}", window);
                    let timed_out = io::Error::new(io::ErrorKind::TimedOut, "ETIMEDOUT");
                    if events.send(TransportEvent::Error(timed_out)).is_err() {
                        break;
                    }
                    continue;
                }
            },
            None => reader.read(&mut buf).await,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Connection closed by peer");
                break;
            }
            Ok(n) => {
                // First data disarms the idle window for the rest of the link.
                idle_timeout = None;
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if events.send(TransportEvent::Data(chunk)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Read failed: {}", e);
                let _ = events.send(TransportEvent::Error(e));
                break;
            }
        }
    }

    close.fire();
}
