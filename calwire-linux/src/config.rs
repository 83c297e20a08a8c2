//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use calwire_core::discovery::DEFAULT_CLIENT_ID;
use calwire_core::{Capabilities, DeviceConfig, FsStorage, ReplyFormat, SessionOptions};

/// How discovery probes are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStyle {
    Port,
    Announcement,
}

/// Daemon configuration. File: ~/.config/calwire/config.toml or /etc/calwire/config.toml.
/// Env overrides: CALWIRE_TCP_PORT, CALWIRE_BOOKS_ROOT, CALWIRE_PEER,
/// CALWIRE_DEVICE_NAME, CALWIRE_PASSWORD.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session TCP port (default 9090).
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Host directory that stands in for the device's storage root.
    #[serde(default = "default_books_root")]
    pub books_root: PathBuf,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub password: Option<String>,
    /// `host:port` to connect out to instead of waiting for the peer.
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default = "default_reply")]
    pub reply: ReplyStyle,
    /// Content port named in announcement replies.
    #[serde(default = "default_content_port")]
    pub content_port: u16,
    /// Wait budget of one processing tick, in milliseconds (default 50).
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_total_bytes")]
    pub total_bytes: u64,
    #[serde(default = "default_free_bytes")]
    pub free_bytes: u64,
    #[serde(default = "default_true")]
    pub report_existing_books: bool,
    #[serde(default = "default_true")]
    pub allow_delete: bool,
}

fn default_tcp_port() -> u16 {
    calwire_core::protocol::DEFAULT_PORT
}
fn default_books_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/calwire"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/calwire"))
}
fn default_device_name() -> String {
    DeviceConfig::default().device_name
}
fn default_reply() -> ReplyStyle {
    ReplyStyle::Port
}
fn default_content_port() -> u16 {
    8080
}
fn default_poll_ms() -> u64 {
    50
}
fn default_extensions() -> Vec<String> {
    DeviceConfig::default().extensions().to_vec()
}
fn default_total_bytes() -> u64 {
    FsStorage::DEFAULT_TOTAL
}
fn default_free_bytes() -> u64 {
    FsStorage::DEFAULT_FREE
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            books_root: default_books_root(),
            device_name: default_device_name(),
            password: None,
            peer: None,
            reply: default_reply(),
            content_port: default_content_port(),
            poll_ms: default_poll_ms(),
            extensions: default_extensions(),
            total_bytes: default_total_bytes(),
            free_bytes: default_free_bytes(),
            report_existing_books: true,
            allow_delete: true,
        }
    }
}

impl Config {
    pub fn poll_budget(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    /// Outbound peer as `(host, port)`; the port defaults to the session port.
    pub fn peer_addr(&self) -> Option<(String, u16)> {
        let peer = self.peer.as_deref()?.trim();
        if peer.is_empty() {
            return None;
        }
        match peer.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Some((host.to_string(), port.parse().ok()?))
            }
            _ => Some((peer.to_string(), self.tcp_port)),
        }
    }

    pub fn device_config(&self) -> anyhow::Result<DeviceConfig> {
        let mut device = DeviceConfig::new(self.device_name.clone()).with_capabilities(Capabilities {
            can_delete_books: self.allow_delete,
            report_existing_books: self.report_existing_books,
            ..Capabilities::default()
        });
        for ext in &self.extensions {
            device.add_extension(ext)?;
        }
        if let Some(pw) = &self.password {
            device = device.with_password(pw.clone());
        }
        Ok(device)
    }

    pub fn session_options(&self) -> SessionOptions {
        let reply_format = match self.reply {
            ReplyStyle::Port => ReplyFormat::Port,
            ReplyStyle::Announcement => ReplyFormat::Announcement {
                client_id: DEFAULT_CLIENT_ID.to_string(),
                content_port: self.content_port,
            },
        };
        SessionOptions {
            tcp_port: self.tcp_port,
            reply_format,
            ..SessionOptions::default()
        }
    }

    pub fn storage(&self) -> FsStorage {
        FsStorage::new(&self.books_root).with_capacity_estimate(self.total_bytes, self.free_bytes)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

/// Apply overrides from `lookup` (the process environment outside tests).
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(p) = lookup("CALWIRE_TCP_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.tcp_port = p;
    }
    if let Some(root) = lookup("CALWIRE_BOOKS_ROOT").filter(|s| !s.is_empty()) {
        c.books_root = PathBuf::from(root);
    }
    if let Some(peer) = lookup("CALWIRE_PEER") {
        c.peer = Some(peer).filter(|p| !p.is_empty());
    }
    if let Some(name) = lookup("CALWIRE_DEVICE_NAME").filter(|s| !s.is_empty()) {
        c.device_name = name;
    }
    if let Some(pw) = lookup("CALWIRE_PASSWORD") {
        c.password = Some(pw).filter(|p| !p.is_empty());
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/calwire/config.toml"));
    }
    out.push(PathBuf::from("/etc/calwire/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => {
                    tracing::info!(path = %p.display(), "loaded config");
                    return Some(c);
                }
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config, using defaults"),
            }
            break;
        }
    }
    None
}
