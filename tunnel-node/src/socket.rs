//! Local sockets carried by a tunnel connection.
//!
//! The forwarder works on any byte stream. Inbound connections dial the
//! service named in the bridge options: `tcp://host:port` gives a TCP stream,
//! `udp://host:port` a connected UDP socket where each read returns one
//! datagram and each write sends one. Empty datagrams are skipped, since a
//! zero-length read means EOF to a stream reader.

use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// A byte stream the forwarder can pump.
pub trait LocalSocket: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> LocalSocket for T {}

/// Owned local socket.
pub type LocalStream = Box<dyn LocalSocket>;

/// Parsed `url_remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUrl {
    /// `tcp://host:port`
    Tcp(String),
    /// `udp://host:port`
    Udp(String),
}

impl FromStr for RemoteUrl {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{msg}: {s}"));
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if address.is_empty() || !address.contains(':') {
            return Err(invalid("missing host:port"));
        }
        match scheme {
            "tcp" => Ok(RemoteUrl::Tcp(address.to_string())),
            "udp" => Ok(RemoteUrl::Udp(address.to_string())),
            _ => Err(invalid("unsupported scheme")),
        }
    }
}

/// Dial the remote service within `timeout`.
pub async fn dial(url: &str, timeout: Duration) -> io::Result<LocalStream> {
    let remote: RemoteUrl = url.parse()?;
    let connect = async {
        match &remote {
            RemoteUrl::Tcp(address) => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok::<LocalStream, io::Error>(Box::new(stream))
            }
            RemoteUrl::Udp(address) => Ok(Box::new(UdpStream::connect(address).await?) as LocalStream),
        }
    };

    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {url} timed out")))??;
    debug!(%url, "Dialed remote service");
    Ok(stream)
}

/// Connected UDP socket exposed as a byte stream.
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    /// Bind an ephemeral local port and connect it to `address`.
    pub async fn connect(address: &str) -> io::Result<Self> {
        let target = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, address.to_string()))?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let filled = buf.filled().len();
            ready!(self.socket.poll_recv(cx, buf))?;
            if buf.filled().len() > filled {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
