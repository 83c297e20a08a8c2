//! Device-side engine for the Calibre wireless sync protocol.
//! Host-driven: the host calls `Connection::process` in a loop; the engine owns sockets
//! and protocol state, and reports through storage and event collaborators.

pub mod auth;
pub mod book;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
mod handlers;
pub mod json;
pub mod net;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod wire;

pub use book::BookMeta;
pub use config::{Capabilities, DeviceConfig, SessionOptions};
pub use discovery::{Discovery, ReplyFormat};
pub use error::{Error, ErrorKind, Result};
pub use events::{NoEvents, SessionEvents};
pub use net::{DeviceListener, TcpTransport};
pub use protocol::{Opcode, PROTOCOL_VERSION};
pub use session::{Connection, LibraryInfo, Processed, State};
pub use storage::{FsStorage, Storage};
pub use transport::{CancelToken, Transport};
pub use wire::{encode_frame, Message};
