//! TCP adapters for [`Transport`]: outbound connect and inbound accept.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Blocking TCP stream with readiness waits built on `peek`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Resolve `host` (numeric first, then DNS) and connect within `connect_timeout`.
    /// The stream then uses `io_timeout` for steady-state reads and writes.
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        if host.is_empty() || port == 0 {
            return Err(Error::InvalidArgument("empty host or port".into()));
        }
        let addr = resolve(host, port)?;
        info!(%addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| Error::ConnectFailed(format!("{addr}: {e}")))?;
        Self::from_stream(stream, io_timeout).map_err(Error::Socket)
    }

    /// Wrap an already connected stream, e.g. one returned by accept.
    pub fn from_stream(stream: TcpStream, io_timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::ConnectFailed(format!("DNS resolution failed for {host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::ConnectFailed(format!("no address for {host}")))
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        let peeked = if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let r = self.stream.peek(&mut probe);
            self.stream.set_nonblocking(false)?;
            r
        } else {
            self.stream.set_read_timeout(Some(timeout))?;
            self.stream.peek(&mut probe)
        };
        match peeked {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Non-blocking TCP listener for peers that connect to the device.
#[derive(Debug)]
pub struct DeviceListener {
    listener: TcpListener,
    io_timeout: Duration,
}

impl DeviceListener {
    pub fn bind(port: u16, io_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(Error::Socket)?;
        listener.set_nonblocking(true).map_err(Error::Socket)?;
        Ok(Self {
            listener,
            io_timeout,
        })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    /// Accept one pending connection without blocking.
    pub fn accept(&self) -> Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                TcpTransport::from_stream(stream, self.io_timeout)
                    .map(Some)
                    .map_err(Error::Socket)
            }
            Err(e) if crate::error::is_transient(&e) => Ok(None),
            Err(e) => Err(Error::Socket(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_and_exchange_bytes() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = TcpTransport::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();
        let (mut accepted, _) = server.accept().unwrap();

        assert!(!client.wait_readable(Duration::from_millis(20)).unwrap());
        accepted.write_all(b"ping").unwrap();
        assert!(client.wait_readable(Duration::from_secs(2)).unwrap());
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += client.recv(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        assert_eq!(client.send(b"pong").unwrap(), 4);
        assert_eq!(client.peer_addr().map(|a| a.port()), Some(port));
    }

    #[test]
    fn closed_peer_is_readable_with_zero_bytes() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = TcpTransport::connect(
            "localhost",
            port,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();
        let (accepted, _) = server.accept().unwrap();
        drop(accepted);
        assert!(client.wait_readable(Duration::from_secs(2)).unwrap());
        let mut buf = [0u8; 1];
        assert_eq!(client.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn connect_refused_is_connect_failed() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TcpTransport::connect(
            "127.0.0.1",
            port,
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
    }

    #[test]
    fn empty_host_is_invalid() {
        let err = TcpTransport::connect("", 9090, Duration::from_secs(1), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn listener_accepts_without_blocking() {
        let listener = DeviceListener::bind(0, Duration::from_secs(1)).unwrap();
        assert!(listener.accept().unwrap().is_none());
        let port = listener.local_port().unwrap();
        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(t) = listener.accept().unwrap() {
                accepted = Some(t);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(accepted.is_some());
    }
}
