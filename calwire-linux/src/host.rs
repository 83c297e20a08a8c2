//! Blocking session loop: discovery and listener (or an outbound peer), ticked until
//! shutdown.

use std::time::{Duration, Instant};

use anyhow::Context;
use calwire_core::{CancelToken, Connection, Error, Processed};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::LogEvents;

/// Pause between outbound connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Build the session from daemon config. `shutdown` stops transfers in progress.
pub fn build_connection(cfg: &Config, shutdown: CancelToken) -> anyhow::Result<Connection> {
    let device = cfg.device_config().context("invalid device config")?;
    let storage = cfg.storage();
    std::fs::create_dir_all(storage.root())
        .with_context(|| format!("creating {}", storage.root().display()))?;
    Ok(Connection::new(
        device,
        cfg.session_options(),
        Box::new(storage),
        Box::new(LogEvents::new(shutdown)),
    ))
}

/// Run until `shutdown` is cancelled. Returns the number of books received.
pub fn run(mut conn: Connection, cfg: &Config, shutdown: &CancelToken) -> anyhow::Result<u32> {
    let budget = cfg.poll_budget();
    let outbound = cfg.peer_addr();
    let mut next_attempt = Instant::now();

    if outbound.is_none() {
        let port = conn.listen().context("binding session port")?;
        conn.start_discovery().context("starting discovery")?;
        info!(port, "waiting for calibre");
    }

    while !shutdown.is_cancelled() {
        if let Some((host, port)) = &outbound {
            if !conn.is_connected() && Instant::now() >= next_attempt {
                match conn.connect(host, *port) {
                    Ok(()) => info!(%host, port, "connected to calibre"),
                    Err(e) => warn!(%host, port, error = %e, "connect failed"),
                }
                next_attempt = Instant::now() + RECONNECT_DELAY;
            }
        }

        match conn.process(budget) {
            Ok(Processed::Message(opcode)) => debug!(%opcode, "handled"),
            Ok(Processed::Idle) => {
                if !conn.is_connected() {
                    std::thread::sleep(budget);
                }
            }
            Err(Error::Timeout) => {}
            Err(e @ (Error::Disconnected | Error::Socket(_))) if !conn.is_connected() => {
                info!(
                    reason = %e,
                    books = conn.books_received(),
                    library = %conn.library().name,
                    "session ended"
                );
                if outbound.is_none() {
                    conn.start_discovery().context("restarting discovery")?;
                }
            }
            Err(Error::Cancelled) if shutdown.is_cancelled() => break,
            Err(Error::Cancelled) => conn.cancel_token().reset(),
            Err(e) => debug!(error = %e, "tick failed"),
        }
    }

    let books = conn.books_received();
    conn.disconnect();
    conn.stop_discovery();
    conn.stop_listening();
    Ok(books)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            books_root: root.join("device"),
            tcp_port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn build_creates_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let conn = build_connection(&cfg, CancelToken::new()).unwrap();
        assert!(dir.path().join("device").is_dir());
        assert_eq!(conn.config().device_name, cfg.device_name);
    }

    #[test]
    fn run_returns_once_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            peer: Some("127.0.0.1:1".into()),
            poll_ms: 5,
            ..test_config(dir.path())
        };
        let shutdown = CancelToken::new();
        let conn = build_connection(&cfg, shutdown.clone()).unwrap();
        let stopper = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.cancel();
        });
        let books = run(conn, &cfg, &shutdown).unwrap();
        handle.join().unwrap();
        assert_eq!(books, 0);
    }
}
