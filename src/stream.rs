/*! FCGI servers and clients usually support TCP as well as Unix sockets.
 */

use std::fmt;
use std::io;
use std::net;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(unix)]
use tokio::net::unix;
#[cfg(unix)]
use std::path::{Path, PathBuf};

/// Address of a FastCGI endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FCGIAddr {
    Inet(net::SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl From<net::SocketAddr> for FCGIAddr {
    fn from(s: net::SocketAddr) -> FCGIAddr {
        FCGIAddr::Inet(s)
    }
}

#[cfg(unix)]
impl From<&Path> for FCGIAddr {
    fn from(s: &Path) -> FCGIAddr {
        FCGIAddr::Unix(s.to_path_buf())
    }
}
#[cfg(unix)]
impl From<PathBuf> for FCGIAddr {
    fn from(s: PathBuf) -> FCGIAddr {
        FCGIAddr::Unix(s)
    }
}
#[cfg(unix)]
impl From<unix::SocketAddr> for FCGIAddr {
    fn from(s: unix::SocketAddr) -> FCGIAddr {
        FCGIAddr::Unix(match s.as_pathname() {
            None => Path::new("unnamed").to_path_buf(),
            Some(p) => p.to_path_buf(),
        })
    }
}

impl fmt::Display for FCGIAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FCGIAddr::Inet(n) => write!(f, "{}", n),
            #[cfg(unix)]
            FCGIAddr::Unix(n) => write!(f, "{}", n.to_string_lossy()),
        }
    }
}

impl FromStr for FCGIAddr {
    type Err = net::AddrParseError;

    #[cfg(unix)]
    fn from_str(s: &str) -> Result<FCGIAddr, net::AddrParseError> {
        if s.starts_with('/') {
            Ok(FCGIAddr::Unix(Path::new(s).to_path_buf()))
        } else {
            s.parse().map(FCGIAddr::Inet)
        }
    }

    #[cfg(not(unix))]
    fn from_str(s: &str) -> Result<FCGIAddr, net::AddrParseError> {
        s.parse().map(FCGIAddr::Inet)
    }
}

/// An accepted or established connection.
#[derive(Debug)]
pub enum Stream {
    Inet(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl From<TcpStream> for Stream {
    fn from(s: TcpStream) -> Stream {
        Stream::Inet(s)
    }
}

#[cfg(unix)]
impl From<UnixStream> for Stream {
    fn from(s: UnixStream) -> Stream {
        Stream::Unix(s)
    }
}

impl Stream {
    pub async fn connect(s: &FCGIAddr) -> io::Result<Stream> {
        match s {
            FCGIAddr::Inet(s) => TcpStream::connect(s).await.map(Stream::Inet),
            #[cfg(unix)]
            FCGIAddr::Unix(s) => UnixStream::connect(s).await.map(Stream::Unix),
        }
    }

    pub fn local_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Stream::Inet(s) => s.local_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.local_addr().map(|e| e.into()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Stream::Inet(s) => s.peer_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.peer_addr().map(|e| e.into()),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Socket a web server connects to.
pub enum Listener {
    Inet(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(addr: &FCGIAddr) -> io::Result<Listener> {
        match addr {
            FCGIAddr::Inet(s) => TcpListener::bind(s).await.map(Listener::Inet),
            #[cfg(unix)]
            FCGIAddr::Unix(p) => UnixListener::bind(p).map(Listener::Unix),
        }
    }

    pub async fn accept(&self) -> io::Result<(Stream, FCGIAddr)> {
        match self {
            Listener::Inet(l) => {
                let (s, a) = l.accept().await?;
                Ok((Stream::Inet(s), FCGIAddr::Inet(a)))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (s, a) = l.accept().await?;
                Ok((Stream::Unix(s), a.into()))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Listener::Inet(l) => l.local_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Listener::Unix(l) => l.local_addr().map(|a| a.into()),
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(l: TcpListener) -> Listener {
        Listener::Inet(l)
    }
}

#[cfg(unix)]
impl From<UnixListener> for Listener {
    fn from(l: UnixListener) -> Listener {
        Listener::Unix(l)
    }
}
