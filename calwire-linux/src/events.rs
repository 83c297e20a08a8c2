//! Session events rendered as log lines; the daemon has no screen.

use calwire_core::{BookMeta, CancelToken, SessionEvents};
use tracing::{debug, info};

/// Logs every event and stops transfers once shutdown has been requested.
pub struct LogEvents {
    shutdown: CancelToken,
    last_decile: u64,
}

impl LogEvents {
    pub fn new(shutdown: CancelToken) -> Self {
        Self {
            shutdown,
            last_decile: 0,
        }
    }
}

impl SessionEvents for LogEvents {
    fn on_progress(&mut self, received: u64, total: u64) -> bool {
        let decile = if total == 0 { 10 } else { received * 10 / total };
        if decile != self.last_decile {
            self.last_decile = decile;
            info!(received, total, "{}%", decile * 10);
        }
        if received >= total {
            self.last_decile = 0;
        }
        !self.shutdown.is_cancelled()
    }

    fn on_book_received(&mut self, meta: &BookMeta, path: &str) {
        info!(
            title = meta.display_title(),
            authors = %meta.authors,
            size = meta.size,
            path,
            "book stored"
        );
    }

    fn on_book_deleted(&mut self, lpath: &str) {
        info!(lpath, "book removed");
    }

    fn on_message(&mut self, text: &str) {
        info!(%text, "calibre says");
    }

    fn on_status(&mut self, status: &str) {
        debug!(status, "status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_continues_until_shutdown() {
        let token = CancelToken::new();
        let mut events = LogEvents::new(token.clone());
        assert!(events.on_progress(10, 100));
        token.cancel();
        assert!(!events.on_progress(20, 100));
    }

    #[test]
    fn decile_resets_after_each_book() {
        let mut events = LogEvents::new(CancelToken::new());
        events.on_progress(100, 100);
        assert_eq!(events.last_decile, 0);
        events.on_progress(50, 100);
        assert_eq!(events.last_decile, 5);
    }
}
