//! Byte stream behind both transport variants.

use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// A connected socket, either plain TCP or TLS over TCP.
    #[project = SocketStreamProj]
    pub enum SocketStream {
        Plain { #[pin] stream: TcpStream },
        Secure { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl SocketStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, SocketStream::Secure { .. })
    }

    /// Returns the remote address of the underlying TCP socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketStream::Plain { stream } => stream.peer_addr(),
            SocketStream::Secure { stream } => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            SocketStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            SocketStreamProj::Secure { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            SocketStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            SocketStreamProj::Secure { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SocketStreamProj::Plain { stream } => stream.poll_flush(cx),
            SocketStreamProj::Secure { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SocketStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            SocketStreamProj::Secure { stream } => stream.poll_shutdown(cx),
        }
    }
}
