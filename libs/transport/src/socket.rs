//! Socket Layer
//!
//! One connected stream, plain TCP or TLS, with non-blocking read/write/flush
//! on top of readiness polling. The channel state machine above this never
//! blocks: `try_read_buf`/`try_write` map pending I/O to `WouldBlock`, and
//! `readable()` is the awaitable the dispatch loop parks on.

use crate::endpoint::Endpoint;
use crate::{Result, TransportError};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Read chunk reserved per `try_read_buf` call
const READ_CHUNK: usize = 16 * 1024;

/// A connected stream, plain or encrypted
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Socket::Plain(_) => f.write_str("Socket::Plain"),
            Socket::Tls(_) => f.write_str("Socket::Tls"),
        }
    }
}

impl From<TcpStream> for Socket {
    fn from(stream: TcpStream) -> Self {
        Socket::Plain(stream)
    }
}

impl Socket {
    /// Connect to an endpoint, completing the TLS handshake when configured
    pub async fn connect(endpoint: Endpoint, connect_timeout: Duration) -> Result<Socket> {
        let addr = endpoint.addr();
        debug!(endpoint = %endpoint.name, %addr, tls = endpoint.tls, "Connecting");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::timeout("connect", connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                TransportError::connection_with_source(
                    format!("Failed to connect to {}", addr),
                    None,
                    e,
                )
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        if endpoint.tls {
            tls_connect(stream, &endpoint.host).await
        } else {
            Ok(Socket::Plain(stream))
        }
    }

    /// Peer address of the underlying TCP stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Plain(s) => s.peer_addr(),
            Socket::Tls(t) => t.get_ref().0.peer_addr(),
        }
    }

    /// Wait until the socket is readable
    ///
    /// For TLS this waits on the underlying TCP stream; a wakeup may still
    /// yield `WouldBlock` from `try_read_buf` (a record may be incomplete),
    /// which callers already tolerate.
    pub async fn readable(&self) -> io::Result<()> {
        let tcp = match self {
            Socket::Plain(s) => s,
            Socket::Tls(t) => t.get_ref().0,
        };
        tcp.ready(tokio::io::Interest::READABLE).await?;
        Ok(())
    }

    /// Read whatever is available into `buf` without blocking
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the
    /// stream, and `ErrorKind::WouldBlock` means nothing is buffered.
    pub fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        buf.reserve(READ_CHUNK);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let n = {
            let mut read_buf = ReadBuf::uninit(buf.spare_capacity_mut());
            match self.poll_read_inner(&mut cx, &mut read_buf) {
                Poll::Pending => return Err(io::ErrorKind::WouldBlock.into()),
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Ready(Ok(())) => read_buf.filled().len(),
            }
        };

        // poll_read filled exactly n initialized bytes past the current length
        unsafe { buf.set_len(buf.len() + n) };
        Ok(n)
    }

    /// Write as much of `data` as the socket accepts without blocking
    pub fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        match self.poll_write_inner(&mut cx, data) {
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
            Poll::Ready(result) => result,
        }
    }

    /// Flush buffered output; `WouldBlock` when the flush cannot complete yet
    pub fn try_flush(&mut self) -> io::Result<()> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        match self.poll_flush_inner(&mut cx) {
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
            Poll::Ready(result) => result,
        }
    }

    fn poll_read_inner(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }

    fn poll_write_inner(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match self {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, data),
            Socket::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush_inner(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }
}

/// Complete a TLS client handshake over an established TCP stream
async fn tls_connect(stream: TcpStream, host: &str) -> Result<Socket> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host).map_err(|_| {
        TransportError::configuration(format!("Invalid TLS host name: {}", host), Some("host"))
    })?;

    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::connection_with_source("TLS handshake failed", None, e))?;

    debug!(%host, "TLS handshake complete");
    Ok(Socket::Tls(Box::new(tls)))
}
