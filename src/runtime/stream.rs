use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

use super::TlsConfig;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The configured `connectTimeoutMS` as a duration. Zero disables the timeout.
pub(crate) fn connect_timeout(configured: Option<Duration>) -> Duration {
    match configured {
        Some(timeout) if timeout.is_zero() => Duration::MAX,
        Some(timeout) => timeout,
        None => DEFAULT_CONNECT_TIMEOUT,
    }
}

#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A connection's byte stream: plain TCP, or TLS over TCP.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// Reads nothing and swallows nothing. Left behind when a connection's stream is taken.
    Null,

    Tcp(TcpStream),

    #[cfg(feature = "rustls-tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncStream {
    /// Resolves `address` and connects to the first resolved address that accepts, then runs the
    /// TLS handshake when `tls` is set.
    pub(crate) async fn connect(address: &ServerAddress, tls: Option<&TlsConfig>) -> Result<Self> {
        let mut candidates: Vec<SocketAddr> =
            tokio::net::lookup_host(address.to_string()).await?.collect();
        // IPv6 first.
        candidates.sort_by_key(SocketAddr::is_ipv4);

        let mut first_error = None;
        let mut tcp = None;
        for candidate in &candidates {
            match open_tcp(candidate).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        let tcp = match (tcp, first_error) {
            (Some(stream), _) => stream,
            (None, Some(error)) => return Err(error),
            (None, None) => {
                let not_found = io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{address} did not resolve to any address"),
                );
                return Err(ErrorKind::Io(Arc::new(not_found)).into());
            }
        };

        match tls {
            None => Ok(Self::Tcp(tcp)),
            #[cfg(feature = "rustls-tls")]
            Some(config) => Ok(Self::Tls(config.connect(address.host(), tcp).await?)),
            #[cfg(not(feature = "rustls-tls"))]
            Some(_) => Err(ErrorKind::InvalidTlsConfig {
                message: "this build has no TLS support".to_string(),
            }
            .into()),
        }
    }
}

async fn open_tcp(address: &SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    #[cfg(not(target_os = "wasi"))]
    socket2::SockRef::from(&stream)
        .set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(stream)
}

/// Forwards a poll to whichever stream is inside. `Null` is immediately ready with `$null`.
macro_rules! poll_inner {
    ($stream:expr, $null:expr, |$inner:ident| $poll:expr) => {
        match $stream.get_mut() {
            AsyncStream::Null => Poll::Ready(Ok($null)),
            AsyncStream::Tcp(tcp) => {
                let $inner = Pin::new(tcp);
                $poll
            }
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(tls) => {
                let $inner = Pin::new(tls);
                $poll
            }
        }
    };
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        poll_inner!(self, (), |inner| inner.poll_read(cx, buf))
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        poll_inner!(self, 0, |inner| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        poll_inner!(self, (), |inner| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        poll_inner!(self, (), |inner| inner.poll_shutdown(cx))
    }
}
