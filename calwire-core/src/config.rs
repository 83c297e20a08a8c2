//! Device description and session tunables, injected at session construction.

use std::time::Duration;

use crate::discovery::ReplyFormat;
use crate::error::{Error, Result};
use crate::protocol::{BROADCAST_PORTS, DEFAULT_PORT, MAX_CHUNK_SIZE, MAX_MESSAGE_LEN};

/// Upper bound on accepted extensions.
pub const MAX_EXTENSIONS: usize = 16;

/// Capability flags advertised during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub can_delete_books: bool,
    pub can_stream_books: bool,
    pub can_stream_metadata: bool,
    pub can_receive_book_binary: bool,
    pub can_use_cached_metadata: bool,
    pub cache_uses_lpaths: bool,
    /// Enumerate stored books for booklist requests; when false, report none so the
    /// peer pushes its whole library.
    pub report_existing_books: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_delete_books: true,
            can_stream_books: true,
            can_stream_metadata: true,
            can_receive_book_binary: true,
            can_use_cached_metadata: true,
            cache_uses_lpaths: true,
            report_existing_books: true,
        }
    }
}

/// Read-only description of this device for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub app_name: String,
    pub device_kind: String,
    pub cover_height: u32,
    extensions: Vec<String>,
    pub capabilities: Capabilities,
    /// Plain device password; the handshake only ever sends its salted hash.
    pub password: Option<String>,
    /// Directory (device path) holding received books.
    pub books_dir: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "Papyrix Reader".into(),
            manufacturer: "Papyrix".into(),
            model: "X4".into(),
            app_name: "Papyrix Reader".into(),
            device_kind: "Papyrix E-Ink Reader".into(),
            cover_height: 240,
            extensions: vec!["epub".into(), "txt".into()],
            capabilities: Capabilities::default(),
            password: None,
            books_dir: "/Books".into(),
        }
    }
}

impl DeviceConfig {
    /// Config with the given name and no accepted extensions yet.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            extensions: Vec::new(),
            ..Self::default()
        }
    }

    /// Append an accepted extension. Leading dots and case are normalised; duplicates
    /// are ignored.
    pub fn add_extension(&mut self, ext: &str) -> Result<()> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        if ext.is_empty() {
            return Err(Error::InvalidArgument("empty extension".into()));
        }
        if self.extensions.contains(&ext) {
            return Ok(());
        }
        if self.extensions.len() >= MAX_EXTENSIONS {
            return Err(Error::InvalidArgument(format!(
                "more than {MAX_EXTENSIONS} extensions"
            )));
        }
        self.extensions.push(ext);
        Ok(())
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn accepts(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    pub fn with_books_dir(mut self, dir: impl Into<String>) -> Self {
        self.books_dir = dir.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Timeouts, size limits and discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    /// Budget for one message once a session is established.
    pub recv_timeout: Duration,
    pub max_message_len: usize,
    pub max_chunk_size: usize,
    pub broadcast_ports: Vec<u16>,
    pub tcp_port: u16,
    pub reply_format: ReplyFormat,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
            max_message_len: MAX_MESSAGE_LEN,
            max_chunk_size: MAX_CHUNK_SIZE,
            broadcast_ports: BROADCAST_PORTS.to_vec(),
            tcp_port: DEFAULT_PORT,
            reply_format: ReplyFormat::Port,
        }
    }
}
