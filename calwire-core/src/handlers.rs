//! Opcode handlers. Each handler answers with exactly one `OK` or `ERROR` frame, which
//! is the protocol's flow control: the peer waits for that reply before sending more.

use std::io::{self, Write};

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::auth::password_hash;
use crate::book::{self, BookMeta};
use crate::error::{Error, Result};
use crate::json;
use crate::protocol::{
    to_payload, BookEntry, EmptyBooklist, InitInfo, Opcode, CC_VERSION_NUMBER, PROTOCOL_VERSION,
};
use crate::session::{Connection, LibraryInfo, State};
use crate::storage::{parent_dir, BookWriter};
use crate::transport::{recv_exact, Deadline};
use crate::wire;

fn text_field(payload: &str, name: &str) -> String {
    json::find_str(payload, name)
        .map(|raw| json::unescape(raw).into_owned())
        .unwrap_or_default()
}

impl Connection {
    /// Route one decoded message. Unknown opcodes are logged and ignored.
    pub(crate) fn dispatch(&mut self, opcode: &str, payload: &str) -> Result<()> {
        let Some(op) = Opcode::parse(opcode) else {
            warn!(opcode, "ignoring unknown opcode");
            return Ok(());
        };
        if self.state == State::Handshake
            && !matches!(op, Opcode::GetInitializationInfo | Opcode::Noop)
        {
            let err = Error::protocol(format!("{op} before handshake"));
            self.reply_error(&err.to_string());
            return Err(err);
        }
        match op {
            Opcode::GetInitializationInfo => self.handle_init_info(payload),
            Opcode::SetLibraryInfo => self.handle_library_info(payload),
            Opcode::FreeSpace => {
                let (_, free) = self.storage.capacity_estimate();
                self.reply_ok(&to_payload(&json!({ "free_space_on_device": free })))
            }
            Opcode::TotalSpace => {
                let (total, _) = self.storage.capacity_estimate();
                self.reply_ok(&to_payload(&json!({ "total_space_on_device": total })))
            }
            Opcode::GetBookCount => {
                let count = self.stored_books().len();
                self.reply_ok(&to_payload(&json!({ "count": count })))
            }
            Opcode::SendBooklists => self.handle_booklists(),
            Opcode::SendBook => self.handle_send_book(payload),
            Opcode::DeleteBook => self.handle_delete_book(payload),
            Opcode::DisplayMessage => self.handle_message(payload),
            Opcode::Noop => {
                debug!("keep-alive");
                self.reply_ok("{}")
            }
            Opcode::Ok => {
                debug!("peer acknowledged");
                Ok(())
            }
            Opcode::Error => {
                warn!(reason = %text_field(payload, "errorMessage"), "peer reported an error");
                Ok(())
            }
            Opcode::BookData | Opcode::BookDone => {
                warn!(opcode, "unexpected outside a book transfer");
                Ok(())
            }
        }
    }

    fn reply_ok(&mut self, payload: &str) -> Result<()> {
        self.send_message(Opcode::Ok, payload)
    }

    /// Best effort: the original failure matters more than a failed error reply.
    fn reply_error(&mut self, message: &str) {
        let payload = to_payload(&json!({ "errorMessage": message }));
        if let Err(e) = self.send_message(Opcode::Error, &payload) {
            debug!(error = %e, "could not send error reply");
        }
    }

    fn handle_init_info(&mut self, payload: &str) -> Result<()> {
        let challenge = text_field(payload, "passwordChallenge");
        let version = json::find_int(payload, "serverProtocolVersion");
        if let Some(v) = version.filter(|&v| v > PROTOCOL_VERSION) {
            warn!(server = v, ours = PROTOCOL_VERSION, "peer speaks a newer protocol");
        }
        self.server_version = version;

        let caps = &self.config.capabilities;
        let info = InitInfo {
            app_name: self.config.app_name.clone(),
            accepted_extensions: self.config.extensions().to_vec(),
            cache_uses_lpaths: caps.cache_uses_lpaths,
            can_accept_library_info: true,
            can_delete_multiple_books: false,
            can_receive_book_binary: caps.can_receive_book_binary,
            can_send_ok_to_sendbook: true,
            can_stream_books: caps.can_stream_books,
            can_stream_metadata: caps.can_stream_metadata,
            can_use_cached_metadata: caps.can_use_cached_metadata,
            cc_version_number: CC_VERSION_NUMBER,
            cover_height: self.config.cover_height,
            device_kind: self.config.device_kind.clone(),
            device_name: self.config.device_name.clone(),
            extension_path_lengths: serde_json::Map::new(),
            max_book_content_packet_len: self.options.max_chunk_size,
            password_hash: password_hash(self.config.password.as_deref(), &challenge),
            use_uuid_file_names: false,
            current_library_name: self.library.name.clone(),
            current_library_uuid: self.library.uuid.clone(),
            version_ok: true,
        };
        self.reply_ok(&to_payload(&info))?;
        self.state = State::Connected;
        info!(device = %self.config.device_name, "handshake complete");
        self.events.on_status("Connected to Calibre");
        Ok(())
    }

    fn handle_library_info(&mut self, payload: &str) -> Result<()> {
        self.library = LibraryInfo {
            name: text_field(payload, "libraryName"),
            uuid: text_field(payload, "libraryUUID"),
        };
        info!(name = %self.library.name, uuid = %self.library.uuid, "library info");
        self.reply_ok("{}")
    }

    /// Books to report to the peer. Listing failures count as an empty device.
    fn stored_books(&self) -> Vec<BookEntry> {
        if !self.config.capabilities.report_existing_books {
            return Vec::new();
        }
        self.storage
            .list_books(&self.config.books_dir, self.config.extensions())
            .unwrap_or_else(|e| {
                warn!(error = %e, "listing stored books failed");
                Vec::new()
            })
    }

    fn handle_booklists(&mut self) -> Result<()> {
        if !self.config.capabilities.report_existing_books {
            let empty = EmptyBooklist {
                count: 0,
                will_stream: true,
                will_scan: false,
            };
            return self.reply_ok(&to_payload(&empty));
        }
        let books = self.stored_books();
        debug!(count = books.len(), "sending booklist");
        self.reply_ok(&to_payload(&books))
    }

    fn handle_message(&mut self, payload: &str) -> Result<()> {
        let text = text_field(payload, "message");
        if !text.is_empty() {
            info!(%text, "message from peer");
            self.events.on_message(&text);
        }
        self.reply_ok("{}")
    }

    fn handle_delete_book(&mut self, payload: &str) -> Result<()> {
        let mut lpaths: Vec<String> = match json::find_str(payload, "lpath") {
            Some(raw) => vec![json::unescape(raw).into_owned()],
            None => json::string_list(payload, "lpaths")
                .map(|items| items.map(|s| json::unescape(s).into_owned()).collect())
                .unwrap_or_default(),
        };
        lpaths.retain(|p| !p.is_empty());
        if lpaths.is_empty() {
            self.reply_error("No lpath provided");
            return Err(Error::field("lpath"));
        }
        if !self.config.capabilities.can_delete_books {
            self.reply_error("Deleting books is not enabled on this device");
            return Err(Error::InvalidArgument("book deletion is disabled".into()));
        }
        for lpath in &lpaths {
            let path = match book::lpath_to_path(&self.config.books_dir, lpath) {
                Ok(path) => path,
                Err(e) => {
                    self.reply_error(&e.to_string());
                    return Err(e);
                }
            };
            match self.storage.remove(&path) {
                Ok(()) => {
                    info!(%lpath, "book deleted");
                    self.events.on_book_deleted(lpath);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(%lpath, "book already absent")
                }
                Err(e) => {
                    self.reply_error(&format!("Failed to delete {lpath}: {e}"));
                    return Err(Error::WriteFile(e));
                }
            }
        }
        self.events.on_status("Book deleted");
        self.reply_ok("{}")
    }

    fn handle_send_book(&mut self, payload: &str) -> Result<()> {
        let meta = match BookMeta::from_payload(payload) {
            Ok(meta) => meta,
            Err(e) => {
                self.reply_error(&e.to_string());
                return Err(e);
            }
        };
        let default_ext = self
            .config
            .extensions()
            .first()
            .cloned()
            .unwrap_or_else(|| "epub".to_string());
        let path = match book::destination_path(&self.config.books_dir, &meta, &default_ext) {
            Ok(path) => path,
            Err(e) => {
                self.reply_error(&e.to_string());
                return Err(e);
            }
        };
        info!(title = meta.display_title(), %path, size = meta.size, "receiving book");

        if let Some(dir) = parent_dir(&path) {
            if let Err(e) = self.storage.create_dirs(dir) {
                error!(%dir, error = %e, "failed to create directory");
                self.reply_error("Failed to create directory");
                return Err(Error::WriteFile(e));
            }
        }
        let writer = match self.storage.create(&path) {
            Ok(w) => w,
            Err(e) => {
                error!(%path, error = %e, "failed to open file");
                self.reply_error(&format!("Failed to open file: {e}"));
                return Err(Error::WriteFile(e));
            }
        };
        if let Err(e) = self.reply_ok(r#"{"willAccept": true}"#) {
            drop(writer);
            self.discard(&path);
            return Err(e);
        }

        self.events.on_status("Receiving book...");
        self.state = State::ReceivingBook;
        let result = self.receive_chunks(meta.size, writer);
        self.state = State::Connected;

        match result {
            Ok(size) => {
                self.books_received += 1;
                info!(title = meta.display_title(), %path, size, "book received");
                self.events.on_book_received(&meta, &path);
                self.events.on_status("Book received!");
                let done = json!({ "lpath": meta.lpath, "size": size });
                self.send_message(Opcode::BookDone, &to_payload(&done))
            }
            Err(e) => {
                error!(%path, error = %e, "book transfer failed");
                self.discard(&path);
                if !matches!(e, Error::Disconnected) {
                    self.reply_error(&format!("Transfer failed: {e}"));
                }
                self.events.on_status("Transfer failed");
                Err(e)
            }
        }
    }

    /// Stream chunks into `writer` until `isLast` or `total` bytes. Returns bytes written.
    fn receive_chunks(&mut self, total: u64, mut writer: BookWriter) -> Result<u64> {
        let max_chunk = self.options.max_chunk_size;
        let max_len = self.options.max_message_len;
        let timeout = self.options.recv_timeout;
        let cancel = self.cancel.clone();

        let mut chunk = Vec::new();
        let want = usize::try_from(total).unwrap_or(usize::MAX).min(max_chunk);
        chunk
            .try_reserve_exact(want)
            .map_err(|_| Error::OutOfMemory(format!("chunk buffer of {want} bytes")))?;
        let mut header = Vec::new();
        let mut received = 0u64;

        while received < total {
            cancel.check()?;
            let (len, is_last) = {
                let transport = self.transport_mut()?;
                let msg = wire::read_frame(transport, &mut header, max_len, timeout, &cancel)?;
                if msg.opcode != Opcode::BookData.as_str() && msg.opcode != Opcode::Ok.as_str() {
                    return Err(Error::protocol(format!(
                        "unexpected {} during transfer",
                        msg.opcode
                    )));
                }
                (
                    json::find_int(msg.payload, "length").unwrap_or(0),
                    json::find_bool(msg.payload, "isLast").unwrap_or(false),
                )
            };
            let len = match usize::try_from(len) {
                Ok(n) if n > 0 && n <= max_chunk => n,
                _ => return Err(Error::protocol(format!("invalid chunk length {len}"))),
            };
            if received + len as u64 > total {
                return Err(Error::protocol(format!(
                    "chunk of {len} bytes overruns declared length {total}"
                )));
            }
            self.reply_ok("{}")?;

            chunk.resize(len, 0);
            let transport = self.transport_mut()?;
            recv_exact(transport, &mut chunk, Deadline::after(timeout), &cancel)?;
            writer.write_all(&chunk).map_err(Error::WriteFile)?;
            received += len as u64;
            debug!(received, total, "chunk written");

            if !self.events.on_progress(received, total) {
                return Err(Error::Cancelled);
            }
            self.reply_ok(&to_payload(&json!({ "received": received })))?;
            if is_last {
                break;
            }
        }
        writer.flush().map_err(Error::WriteFile)?;
        if received != total {
            return Err(Error::protocol(format!(
                "transfer ended after {received} of {total} bytes"
            )));
        }
        Ok(received)
    }

    fn discard(&mut self, path: &str) {
        match self.storage.remove(path) {
            Ok(()) => debug!(%path, "removed partial file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(%path, error = %e, "failed to remove partial file"),
        }
    }
}
