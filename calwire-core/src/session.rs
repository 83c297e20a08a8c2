//! The single live session: sockets, protocol state and the cooperative processing tick.
//!
//! The host calls [`Connection::process`] repeatedly with a small budget. Each tick
//! services discovery, accepts a pending inbound peer, and handles at most one message.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, SessionOptions};
use crate::discovery::Discovery;
use crate::error::{is_transient, Error, Result};
use crate::events::SessionEvents;
use crate::net::{DeviceListener, TcpTransport};
use crate::protocol::Opcode;
use crate::storage::Storage;
use crate::transport::{CancelToken, Transport};
use crate::wire::{self, Message};

/// Protocol phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Discovery,
    /// TCP peer attached, waiting for `GET_INITIALIZATION_INFO`.
    Handshake,
    Connected,
    /// Streaming one book's binary payload.
    ReceivingBook,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Discovery => "discovery",
            State::Handshake => "handshake",
            State::Connected => "connected",
            State::ReceivingBook => "receiving book",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Library announced by the peer with `SET_LIBRARY_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryInfo {
    pub name: String,
    pub uuid: String,
}

/// Successful outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Nothing arrived within the budget.
    Idle,
    /// One message was read and dispatched.
    Message(String),
}

/// Device side of one sync session.
pub struct Connection {
    pub(crate) config: DeviceConfig,
    pub(crate) options: SessionOptions,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) events: Box<dyn SessionEvents>,
    pub(crate) state: State,
    pub(crate) transport: Option<Box<dyn Transport>>,
    listener: Option<DeviceListener>,
    discovery: Option<Discovery>,
    recv_buf: Vec<u8>,
    pub(crate) cancel: CancelToken,
    pub(crate) server_version: Option<i64>,
    pub(crate) library: LibraryInfo,
    pub(crate) books_received: u32,
}

impl Connection {
    pub fn new(
        config: DeviceConfig,
        options: SessionOptions,
        storage: Box<dyn Storage>,
        events: Box<dyn SessionEvents>,
    ) -> Self {
        Self {
            config,
            options,
            storage,
            events,
            state: State::Idle,
            transport: None,
            listener: None,
            discovery: None,
            recv_buf: Vec::new(),
            cancel: CancelToken::new(),
            server_version: None,
            library: LibraryInfo::default(),
            books_received: 0,
        }
    }

    /// Handle for cancelling blocking waits from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True once a TCP peer is attached, handshake complete or not.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
            && matches!(
                self.state,
                State::Handshake | State::Connected | State::ReceivingBook
            )
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn library(&self) -> &LibraryInfo {
        &self.library
    }

    /// `serverProtocolVersion` from the last handshake.
    pub fn server_version(&self) -> Option<i64> {
        self.server_version
    }

    /// Books fully received since this connection object was created.
    pub fn books_received(&self) -> u32 {
        self.books_received
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.peer_addr())
    }

    /// TCP port announced to discovery probes: the listener's when listening.
    pub fn advertised_port(&self) -> u16 {
        self.listener
            .as_ref()
            .and_then(|l| l.local_port())
            .unwrap_or(self.options.tcp_port)
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }

    /// Open the discovery sockets. Already-active discovery is kept.
    pub fn start_discovery(&mut self) -> Result<()> {
        if self.discovery.is_none() {
            let discovery = Discovery::start(
                &self.options.broadcast_ports,
                self.advertised_port(),
                self.options.reply_format.clone(),
            )?;
            self.discovery = Some(discovery);
        }
        if !self.is_connected() {
            self.state = State::Discovery;
            self.events.on_status("Waiting for Calibre...");
        }
        Ok(())
    }

    /// Close every discovery socket.
    pub fn stop_discovery(&mut self) {
        if self.discovery.take().is_some() {
            debug!("discovery stopped");
        }
        if !self.is_connected() {
            self.state = State::Idle;
        }
    }

    /// Accept inbound peers on the configured TCP port.
    pub fn listen(&mut self) -> Result<u16> {
        let listener = DeviceListener::bind(self.options.tcp_port, self.options.recv_timeout)?;
        let port = listener.local_port().unwrap_or(self.options.tcp_port);
        info!(port, "listening for peers");
        self.listener = Some(listener);
        Ok(port)
    }

    pub fn stop_listening(&mut self) {
        self.listener = None;
    }

    /// Connect out to a peer and wait for its handshake.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let transport = TcpTransport::connect(
            host,
            port,
            self.options.connect_timeout,
            self.options.recv_timeout,
        )?;
        self.attach(Box::new(transport));
        Ok(())
    }

    /// Make `transport` the active peer. An existing peer is torn down first.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        if self.transport.is_some() {
            info!("new peer replaces the active one");
            self.disconnect();
        }
        info!(peer = ?transport.peer_addr(), "peer connected");
        self.transport = Some(transport);
        self.recv_buf.clear();
        self.state = State::Handshake;
    }

    /// Close the peer connection and return to `Idle`.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
            info!("peer disconnected");
        }
        self.recv_buf = Vec::new();
        self.state = State::Idle;
    }

    /// Send one framed message to the peer.
    pub fn send_message(&mut self, opcode: Opcode, payload: &str) -> Result<()> {
        let max_len = self.options.max_message_len;
        let transport = self.transport_mut()?;
        wire::send_frame(transport, opcode.as_str(), payload, max_len)
    }

    /// Read one frame into the receive buffer. The view stays valid until the next
    /// receive.
    pub fn receive_message(&mut self, timeout: Duration) -> Result<Message<'_>> {
        let max_len = self.options.max_message_len;
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidArgument("not connected".into()))?;
        wire::read_frame(transport, &mut self.recv_buf, max_len, timeout, &self.cancel)
    }

    pub(crate) fn transport_mut(&mut self) -> Result<&mut dyn Transport> {
        match self.transport.as_deref_mut() {
            Some(t) => Ok(t),
            None => Err(Error::InvalidArgument("not connected".into())),
        }
    }

    /// One cooperative step, waiting at most `budget` for peer data.
    ///
    /// A clean peer close while waiting for a message returns `Disconnected` and resets
    /// to `Idle`. `Timeout` leaves the session as it was. Every failure is also
    /// reported through [`SessionEvents::on_status`].
    pub fn process(&mut self, budget: Duration) -> Result<Processed> {
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.poll();
        }
        self.accept_pending();

        if self.transport.is_none() {
            return Ok(Processed::Idle);
        }
        if let Err(e) = self.cancel.check() {
            return Err(self.report(e));
        }
        let ready = match self.transport.as_deref_mut() {
            Some(transport) => transport.wait_readable(budget),
            None => return Ok(Processed::Idle),
        };
        match ready {
            Ok(true) => {}
            Ok(false) => return Ok(Processed::Idle),
            Err(e) if is_transient(&e) => return Ok(Processed::Idle),
            Err(e) => {
                let err = Error::from_socket(e);
                return Err(self.fail_receive(err));
            }
        }

        let mut buf = std::mem::take(&mut self.recv_buf);
        let result = self.receive_and_dispatch(&mut buf);
        if self.transport.is_some() {
            self.recv_buf = buf;
        }
        result.map(Processed::Message).map_err(|e| self.report(e))
    }

    fn receive_and_dispatch(&mut self, buf: &mut Vec<u8>) -> Result<String> {
        let max_len = self.options.max_message_len;
        let timeout = self.options.recv_timeout;
        let cancel = self.cancel.clone();
        let transport = self.transport_mut()?;
        let msg = match wire::read_frame(transport, buf, max_len, timeout, &cancel) {
            Ok(msg) => msg,
            Err(e) => return Err(self.drop_if_terminal(e)),
        };
        if let Err(e) = self.dispatch(msg.opcode, msg.payload) {
            // A close inside a handler is noticed on the next tick; a broken socket is not.
            if matches!(e, Error::Socket(_)) {
                self.disconnect();
            }
            return Err(e);
        }
        Ok(msg.opcode.to_string())
    }

    /// Peer closes and hard socket failures end the session.
    fn drop_if_terminal(&mut self, err: Error) -> Error {
        if matches!(err, Error::Disconnected | Error::Socket(_)) {
            self.disconnect();
        }
        err
    }

    fn fail_receive(&mut self, err: Error) -> Error {
        let err = self.drop_if_terminal(err);
        self.report(err)
    }

    fn report(&mut self, err: Error) -> Error {
        match err {
            Error::Timeout => debug!("receive timed out"),
            Error::Disconnected => info!("peer closed the connection"),
            ref e => warn!(error = %e, state = %self.state, "session error"),
        }
        self.events.on_status(err.kind().as_str());
        err
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        match listener.accept() {
            Ok(Some(transport)) => self.attach(Box::new(transport)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("peer", &self.peer_addr())
            .field("discovering", &self.discovery.is_some())
            .field("library", &self.library)
            .field("books_received", &self.books_received)
            .finish_non_exhaustive()
    }
}
