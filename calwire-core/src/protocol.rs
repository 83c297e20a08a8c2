//! Calibre wireless protocol: opcodes, constants and response documents.

use std::io;

use serde::Serialize;

/// Protocol version we speak; compared against `serverProtocolVersion`.
pub const PROTOCOL_VERSION: i64 = 1;

/// Version number advertised as `ccVersionNumber`.
pub const CC_VERSION_NUMBER: u32 = 128;

/// Default TCP port for the session.
pub const DEFAULT_PORT: u16 = 9090;

/// Well-known UDP ports the desktop peer broadcasts discovery probes on.
pub const BROADCAST_PORTS: [u16; 5] = [54982, 48123, 39001, 44044, 59678];

/// Largest binary chunk we accept (`maxBookContentPacketLen`).
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Largest frame we accept or send, in bytes of JSON text.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Message-type tags. Unknown tags are kept as text by the framer and never error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    GetInitializationInfo,
    SetLibraryInfo,
    FreeSpace,
    TotalSpace,
    GetBookCount,
    SendBooklists,
    SendBook,
    BookData,
    BookDone,
    DeleteBook,
    DisplayMessage,
    Noop,
    Ok,
    Error,
}

impl Opcode {
    pub const ALL: [Opcode; 14] = [
        Opcode::GetInitializationInfo,
        Opcode::SetLibraryInfo,
        Opcode::FreeSpace,
        Opcode::TotalSpace,
        Opcode::GetBookCount,
        Opcode::SendBooklists,
        Opcode::SendBook,
        Opcode::BookData,
        Opcode::BookDone,
        Opcode::DeleteBook,
        Opcode::DisplayMessage,
        Opcode::Noop,
        Opcode::Ok,
        Opcode::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::GetInitializationInfo => "GET_INITIALIZATION_INFO",
            Opcode::SetLibraryInfo => "SET_LIBRARY_INFO",
            Opcode::FreeSpace => "FREE_SPACE",
            Opcode::TotalSpace => "TOTAL_SPACE",
            Opcode::GetBookCount => "GET_BOOK_COUNT",
            Opcode::SendBooklists => "SEND_BOOKLISTS",
            Opcode::SendBook => "SEND_BOOK",
            Opcode::BookData => "BOOK_DATA",
            Opcode::BookDone => "BOOK_DONE",
            Opcode::DeleteBook => "DELETE_BOOK",
            Opcode::DisplayMessage => "DISPLAY_MESSAGE",
            Opcode::Noop => "NOOP",
            Opcode::Ok => "OK",
            Opcode::Error => "ERROR",
        }
    }

    pub fn parse(tag: &str) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.as_str() == tag)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to `GET_INITIALIZATION_INFO`: our identity and capabilities.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitInfo {
    pub app_name: String,
    pub accepted_extensions: Vec<String>,
    pub cache_uses_lpaths: bool,
    pub can_accept_library_info: bool,
    pub can_delete_multiple_books: bool,
    pub can_receive_book_binary: bool,
    pub can_send_ok_to_sendbook: bool,
    pub can_stream_books: bool,
    pub can_stream_metadata: bool,
    pub can_use_cached_metadata: bool,
    pub cc_version_number: u32,
    pub cover_height: u32,
    pub device_kind: String,
    pub device_name: String,
    pub extension_path_lengths: serde_json::Map<String, serde_json::Value>,
    pub max_book_content_packet_len: usize,
    pub password_hash: String,
    pub use_uuid_file_names: bool,
    pub current_library_name: String,
    #[serde(rename = "currentLibraryUUID")]
    pub current_library_uuid: String,
    #[serde(rename = "versionOK")]
    pub version_ok: bool,
}

/// One entry of the `SEND_BOOKLISTS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookEntry {
    pub lpath: String,
    pub title: String,
    pub authors: Vec<String>,
    pub size: u64,
}

/// Reply used when the device reports no existing books.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyBooklist {
    pub count: u32,
    pub will_stream: bool,
    pub will_scan: bool,
}

/// Compact output with a space after `:` and `,`, the layout desktop peers emit.
struct Spaced;

impl serde_json::ser::Formatter for Spaced {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        w.write_all(b": ")
    }
}

/// Serialise a response document; `serde_json` never fails for these types.
pub fn to_payload<T: Serialize>(doc: &T) -> String {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, Spaced);
    if doc.serialize(&mut ser).is_err() {
        return String::from("{}");
    }
    String::from_utf8(out).unwrap_or_else(|_| String::from("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_tags_roundtrip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::parse(op.as_str()), Some(op));
        }
        assert_eq!(Opcode::parse("NOT_A_THING"), None);
    }

    #[test]
    fn init_info_field_names() {
        let info = InitInfo {
            app_name: "Reader".into(),
            accepted_extensions: vec!["epub".into()],
            cache_uses_lpaths: true,
            can_accept_library_info: true,
            can_delete_multiple_books: false,
            can_receive_book_binary: true,
            can_send_ok_to_sendbook: true,
            can_stream_books: true,
            can_stream_metadata: true,
            can_use_cached_metadata: true,
            cc_version_number: CC_VERSION_NUMBER,
            cover_height: 240,
            device_kind: "E-Ink".into(),
            device_name: "Reader".into(),
            extension_path_lengths: serde_json::Map::new(),
            max_book_content_packet_len: MAX_CHUNK_SIZE,
            password_hash: String::new(),
            use_uuid_file_names: false,
            current_library_name: String::new(),
            current_library_uuid: String::new(),
            version_ok: true,
        };
        let json = to_payload(&info);
        assert!(json.contains(r#""versionOK": true"#));
        assert!(json.contains(r#""currentLibraryUUID": """#));
        assert!(json.contains(r#""maxBookContentPacketLen": 4096"#));
        assert!(json.contains(r#""acceptedExtensions": ["epub"]"#));
        assert!(json.contains(r#""extensionPathLengths": {}"#));
    }

    #[test]
    fn empty_booklist_document() {
        let doc = EmptyBooklist {
            count: 0,
            will_stream: true,
            will_scan: false,
        };
        assert_eq!(
            to_payload(&doc),
            r#"{"count": 0, "willStream": true, "willScan": false}"#
        );
    }
}
