//! LAN discovery: non-blocking UDP listeners on the broadcast ports that answer peer
//! probes with our TCP port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{is_transient, Error, Result};

/// Substrings that identify a discovery probe.
const PROBES: [&str; 2] = ["hi there", "calibre"];

const MAX_DATAGRAM: usize = 512;

/// Client id used in announcement replies.
pub const DEFAULT_CLIENT_ID: &str = "calibre wireless device client";

/// How a probe is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFormat {
    /// Bare TCP port as ASCII decimal.
    Port,
    /// `"<client-id> (on <ip>);<content-port>,<tcp-port>"`.
    Announcement {
        client_id: String,
        content_port: u16,
    },
}

impl ReplyFormat {
    /// Reply text for a probe; `local_ip` is only used by announcements.
    pub fn render(&self, tcp_port: u16, local_ip: IpAddr) -> String {
        match self {
            ReplyFormat::Port => tcp_port.to_string(),
            ReplyFormat::Announcement {
                client_id,
                content_port,
            } => format!("{client_id} (on {local_ip});{content_port},{tcp_port}"),
        }
    }
}

/// True when a datagram is a discovery probe.
pub fn is_probe(datagram: &[u8]) -> bool {
    let text = String::from_utf8_lossy(datagram);
    PROBES.iter().any(|p| text.contains(p))
}

/// Parse either reply format back into `(tcp_port, content_port)`.
pub fn parse_reply(text: &str) -> Option<(u16, Option<u16>)> {
    let text = text.trim();
    if let Ok(port) = text.parse() {
        return Some((port, None));
    }
    let (_, ports) = text.rsplit_once(';')?;
    let (content, tcp) = ports.split_once(',')?;
    Some((tcp.trim().parse().ok()?, Some(content.trim().parse().ok()?)))
}

/// Local address the host would use to reach `peer`.
fn local_ip_towards(peer: SocketAddr) -> IpAddr {
    let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    UdpSocket::bind((unspecified, 0))
        .and_then(|s| {
            s.connect(peer)?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or(unspecified)
}

fn bind_broadcast(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Set of bound discovery sockets.
#[derive(Debug)]
pub struct Discovery {
    sockets: Vec<(u16, UdpSocket)>,
    tcp_port: u16,
    reply: ReplyFormat,
}

impl Discovery {
    /// Bind every port that can be bound. Fails only if none could.
    pub fn start(ports: &[u16], tcp_port: u16, reply: ReplyFormat) -> Result<Self> {
        let mut sockets = Vec::new();
        for &port in ports {
            match bind_broadcast(port) {
                Ok(sock) => {
                    let bound = sock.local_addr().map(|a| a.port()).unwrap_or(port);
                    debug!(port = bound, "listening for discovery");
                    sockets.push((bound, sock));
                }
                Err(e) => warn!(port, error = %e, "failed to bind discovery port"),
            }
        }
        if sockets.is_empty() {
            return Err(Error::Socket(io::Error::new(
                io::ErrorKind::AddrInUse,
                "failed to bind any discovery port",
            )));
        }
        info!(
            ports = sockets.len(),
            tcp_port, "discovery started"
        );
        Ok(Self {
            sockets,
            tcp_port,
            reply,
        })
    }

    /// Ports actually bound, in configuration order.
    pub fn ports(&self) -> Vec<u16> {
        self.sockets.iter().map(|(p, _)| *p).collect()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Drain every socket without blocking and answer probes. Returns replies sent.
    pub fn poll(&mut self) -> usize {
        let mut replies = 0;
        let mut buf = [0u8; MAX_DATAGRAM];
        for (port, sock) in &self.sockets {
            loop {
                let (n, from) = match sock.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => {
                        warn!(port, error = %e, "discovery receive failed");
                        break;
                    }
                };
                let datagram = &buf[..n];
                debug!(%from, text = %String::from_utf8_lossy(datagram), "discovery datagram");
                if !is_probe(datagram) {
                    continue;
                }
                let text = self.reply_for(from);
                match sock.send_to(text.as_bytes(), from) {
                    Ok(_) => {
                        info!(%from, reply = %text, "answered discovery probe");
                        replies += 1;
                    }
                    Err(e) => warn!(%from, error = %e, "discovery reply failed"),
                }
            }
        }
        replies
    }

    /// Reply text for a probe from `from`. Only announcements look up a local address.
    fn reply_for(&self, from: SocketAddr) -> String {
        let local_ip = match self.reply {
            ReplyFormat::Port => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ReplyFormat::Announcement { .. } => local_ip_towards(from),
        };
        self.reply.render(self.tcp_port, local_ip)
    }
}
