use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::TlsConfig;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// An async stream to a server, possibly wrapped in TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = runtime::timeout(connect_timeout, TcpStream::connect(address)).await??;
    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    let stream = TcpStream::from_std(std_stream)?;

    Ok(stream)
}

async fn tcp_connect(address: &ServerAddress, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = match connect_timeout {
        Some(timeout) if timeout != Duration::ZERO => timeout,
        _ => DEFAULT_CONNECT_TIMEOUT,
    };

    let mut socket_addrs: Vec<_> = tokio::net::lookup_host(address.to_string()).await?.collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {}", address),
        )))
        .into());
    }

    // Try each resolved address in sequence, preferring IPv4.
    socket_addrs.sort_by_key(|addr| u8::from(!addr.is_ipv4()));

    let mut connect_error = None;

    for socket_addr in &socket_addrs {
        connect_error = match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    Err(connect_error.unwrap_or_else(|| {
        ErrorKind::Io(std::sync::Arc::new(std::io::ErrorKind::NotConnected.into())).into()
    }))
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, wrapping it in TLS when a config is given.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = tcp_connect(address, connect_timeout).await?;

        match tls_config {
            Some(cfg) => {
                let stream = cfg.connect(address.host(), inner).await?;
                Ok(Self::Tls(stream))
            }
            None => Ok(Self::Tcp(inner)),
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
