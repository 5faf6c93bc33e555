use anyhow::{Context, Result};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::{Connected, TcpConnectInfo};

use super::tls::{TlsConfig, TlsError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const INCOMING_BACKLOG: usize = 64;

/// Where to listen, as it appears in a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub addr: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
        }
    }

    /// Binds the socket and wraps it in TLS when configured.
    pub async fn bind(&self) -> Result<Listener> {
        let listener = Listener::tcp(&self.addr).await?;
        match &self.tls {
            Some(tls) => Listener::tls(listener, tls)
                .with_context(|| format!("invalid TLS settings for {}", self.addr)),
            None => Ok(listener),
        }
    }
}

/// A bound TCP socket, optionally terminating TLS.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Binds a plain TCP listener.
    pub async fn tcp(addr: &str) -> Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::from_tcp(tcp))
    }

    pub fn from_tcp(tcp: TcpListener) -> Self {
        Self { tcp, tls: None }
    }

    /// Wraps `base` so every accepted connection completes a TLS handshake
    /// first.
    pub fn tls(base: Listener, cfg: &TlsConfig) -> Result<Self, TlsError> {
        let server = cfg.server_config()?;
        Ok(Self {
            tcp: base.tcp,
            tls: Some(TlsAcceptor::from(Arc::new(server))),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accepts one connection, completing the TLS handshake when configured.
    pub async fn accept(&self) -> io::Result<(Connection, SocketAddr)> {
        let (tcp, peer) = self.tcp.accept().await?;
        match &self.tls {
            None => Ok((Connection::Plain(tcp), peer)),
            Some(acceptor) => Ok((handshake(acceptor, tcp).await?, peer)),
        }
    }

    /// Turns the listener into a stream of ready connections.
    ///
    /// Accepting stops when `cancel` fires or the stream is dropped. TLS
    /// handshakes run off the accept loop; a failed handshake is logged and
    /// the connection dropped.
    pub fn incoming(self, cancel: CancellationToken) -> ReceiverStream<io::Result<Connection>> {
        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    accepted = self.tcp.accept() => accepted,
                };

                let (tcp, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                match &self.tls {
                    None => {
                        if tx.send(Ok(Connection::Plain(tcp))).await.is_err() {
                            break;
                        }
                    }
                    Some(acceptor) => {
                        let acceptor = acceptor.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            match handshake(&acceptor, tcp).await {
                                Ok(conn) => {
                                    let _ = tx.send(Ok(conn)).await;
                                }
                                Err(e) => tracing::debug!(%peer, error = %e, "TLS handshake failed"),
                            }
                        });
                    }
                }
            }
            tracing::debug!("listener stopped accepting");
        });
        ReceiverStream::new(rx)
    }
}

async fn handshake(acceptor: &TlsAcceptor, tcp: TcpStream) -> io::Result<Connection> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(stream) => Ok(Connection::Tls(Box::new(stream?))),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")),
    }
}

/// An accepted connection, plain or TLS.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Connection::Plain(_) => None,
            Connection::Tls(s) => s.get_ref().1.alpn_protocol(),
        }
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(s) => s,
            Connection::Tls(s) => s.get_ref().0,
        }
    }
}

impl Connected for Connection {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.tcp().connect_info()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Connection::Plain(s) => s.is_write_vectored(),
            Connection::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
