//! Byte transport seam: one trait, blocking primitives with deadlines and cancellation.
//!
//! The session never touches a socket directly. It talks to a [`Transport`], which is
//! implemented for outbound and accepted TCP streams in [`crate::net`] and by scripted
//! in-memory peers in tests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{is_transient, Error, Result};

/// A connected, reliable byte stream.
pub trait Transport: Send {
    /// Write some bytes; may write fewer than offered.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read what is available; `Ok(0)` means the peer closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for readability. `Ok(false)` on timeout.
    /// An orderly close counts as readable.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Close both directions. Errors are ignored.
    fn shutdown(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).send(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Cooperative cancellation flag. Set by the host, polled by the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wall-clock budget shared by every wait of one logical operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Time left, or `Timeout` once the budget is spent.
    pub fn remaining(&self) -> Result<Duration> {
        let elapsed = self.start.elapsed();
        if elapsed >= self.budget {
            return Err(Error::Timeout);
        }
        Ok(self.budget - elapsed)
    }
}

/// Write all of `bytes`, retrying would-block and interrupted writes.
pub fn send_all<T: Transport + ?Sized>(transport: &mut T, bytes: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        match transport.send(&bytes[sent..]) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => sent += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(Error::from_socket(e)),
        }
    }
    Ok(())
}

/// Fill `buf` completely before `deadline`, checking `cancel` before every wait.
pub fn recv_exact<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    deadline: Deadline,
    cancel: &CancelToken,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        cancel.check()?;
        let wait = deadline.remaining()?;
        match transport.wait_readable(wait) {
            Ok(true) => {}
            Ok(false) => return Err(Error::Timeout),
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(Error::from_socket(e)),
        }
        match transport.recv(&mut buf[filled..]) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => filled += n,
            Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(Error::from_socket(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory peer used by the session tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What the scripted peer does on the next read.
    #[derive(Debug)]
    pub enum Step {
        Data(Vec<u8>),
        /// Simulated peer close.
        Eof,
        /// Nothing arrives within the wait budget.
        Stall,
    }

    /// Shared view of everything the engine wrote.
    #[derive(Debug, Clone, Default)]
    pub struct Sent(Arc<Mutex<Vec<u8>>>);

    impl Sent {
        pub fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        /// Decode every frame written so far into (opcode, payload) pairs.
        pub fn frames(&self) -> Vec<(String, String)> {
            let bytes = self.bytes();
            let mut out = Vec::new();
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
                let len: usize = std::str::from_utf8(&rest[..digits]).unwrap().parse().unwrap();
                let text = std::str::from_utf8(&rest[digits..digits + len]).unwrap();
                let msg = crate::wire::Message::parse(text).unwrap();
                out.push((msg.opcode.to_string(), msg.payload.to_string()));
                rest = &rest[digits + len..];
            }
            out
        }
    }

    pub struct ScriptedPeer {
        steps: VecDeque<Step>,
        pending: VecDeque<u8>,
        closed: bool,
        pub sent: Sent,
    }

    impl ScriptedPeer {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                pending: VecDeque::new(),
                closed: false,
                sent: Sent::default(),
            }
        }

        fn refill(&mut self) -> bool {
            while self.pending.is_empty() {
                match self.steps.pop_front() {
                    Some(Step::Data(bytes)) => self.pending.extend(bytes),
                    Some(Step::Eof) => {
                        self.closed = true;
                        return true;
                    }
                    Some(Step::Stall) | None => return self.closed,
                }
            }
            true
        }
    }

    impl Transport for ScriptedPeer {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() && !self.refill() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.pending.is_empty() || self.refill())
        }
    }
}
