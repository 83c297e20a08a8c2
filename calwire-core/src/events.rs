//! UI collaborator: progress, received books, peer messages and status lines.

use crate::book::BookMeta;

/// Callbacks invoked synchronously from the processing thread.
///
/// All methods have no-op defaults so hosts implement only what they display.
pub trait SessionEvents: Send {
    /// Bytes received so far for the current book. Return `false` to cancel it.
    fn on_progress(&mut self, _received: u64, _total: u64) -> bool {
        true
    }

    /// A book was fully written to `path`.
    fn on_book_received(&mut self, _meta: &BookMeta, _path: &str) {}

    /// The peer removed the book stored under `lpath`.
    fn on_book_deleted(&mut self, _lpath: &str) {}

    /// Human-readable text sent by the peer.
    fn on_message(&mut self, _text: &str) {}

    /// Short status line, including failure reports.
    fn on_status(&mut self, _status: &str) {}
}

/// Host that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl SessionEvents for NoEvents {}
