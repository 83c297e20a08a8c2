//! Book metadata from `SEND_BOOK` and destination path rules.

use crate::error::{Error, Result};
use crate::json;

/// Attributes of one incoming book. Lives for the duration of one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookMeta {
    pub lpath: String,
    pub title: String,
    pub authors: String,
    pub uuid: String,
    /// Declared byte length of the whole book.
    pub size: u64,
    /// Numeric id in the sending library, 0 when absent.
    pub library_id: u32,
}

impl BookMeta {
    /// Read metadata fields from a `SEND_BOOK` payload. Missing fields default to empty.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let text = |name: &str| {
            json::find_str(payload, name)
                .map(|raw| json::unescape(raw).into_owned())
                .unwrap_or_default()
        };
        let size = match json::find_int(payload, "length") {
            Some(n) if n < 0 => return Err(Error::field("length")),
            Some(n) => n as u64,
            None => 0,
        };
        let library_id = json::find_int(payload, "calibre_id")
            .or_else(|| json::find_int(payload, "application_id"))
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or(0);
        Ok(Self {
            lpath: text("lpath"),
            title: text("title"),
            authors: authors(payload),
            uuid: text("uuid"),
            size,
            library_id,
        })
    }

    /// Title for status display.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "Unknown"
        } else {
            &self.title
        }
    }
}

/// `authors` is either a string or a flat list of strings.
fn authors(payload: &str) -> String {
    if let Some(raw) = json::find_str(payload, "authors") {
        return json::unescape(raw).into_owned();
    }
    json::string_list(payload, "authors")
        .map(|items| {
            items
                .map(|a| json::unescape(a).into_owned())
                .collect::<Vec<_>>()
                .join(" & ")
        })
        .unwrap_or_default()
}

/// Reject logical paths that could escape the books directory.
pub fn validate_lpath(lpath: &str) -> Result<()> {
    let bad = lpath.starts_with('/')
        || lpath.starts_with('\\')
        || lpath.contains(':')
        || lpath.split(['/', '\\']).any(|part| part == "..");
    if bad {
        return Err(Error::InvalidArgument(format!("unsafe lpath {lpath:?}")));
    }
    Ok(())
}

/// Device path for an lpath under `books_dir`.
pub fn lpath_to_path(books_dir: &str, lpath: &str) -> Result<String> {
    validate_lpath(lpath)?;
    Ok(format!("{}/{}", books_dir.trim_end_matches('/'), lpath))
}

/// Where an incoming book is written: its lpath when given, otherwise a file named
/// after the title with the first accepted extension.
pub fn destination_path(books_dir: &str, meta: &BookMeta, default_ext: &str) -> Result<String> {
    if !meta.lpath.is_empty() {
        return lpath_to_path(books_dir, &meta.lpath);
    }
    let name = sanitize_filename(meta.display_title());
    Ok(format!(
        "{}/{}.{}",
        books_dir.trim_end_matches('/'),
        name,
        default_ext
    ))
}

/// Replace characters unsafe in file names and trim spaces and dots from both ends.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_metadata() {
        let payload = r#"{"lpath": "Ann/Story.epub", "length": 10, "metadata":
            {"title": "Story", "authors": ["Ann", "Bob"], "uuid": "u-1", "application_id": 7}}"#;
        let meta = BookMeta::from_payload(payload).unwrap();
        assert_eq!(meta.lpath, "Ann/Story.epub");
        assert_eq!(meta.title, "Story");
        assert_eq!(meta.authors, "Ann & Bob");
        assert_eq!(meta.uuid, "u-1");
        assert_eq!(meta.size, 10);
        assert_eq!(meta.library_id, 7);
    }

    #[test]
    fn flat_fields_and_defaults() {
        let meta =
            BookMeta::from_payload(r#"{"title": "T", "authors": "Solo", "calibre_id": 3}"#).unwrap();
        assert_eq!(meta.authors, "Solo");
        assert_eq!(meta.library_id, 3);
        assert_eq!(meta.size, 0);
        assert!(meta.lpath.is_empty());
    }

    #[test]
    fn negative_length_rejected() {
        assert!(matches!(
            BookMeta::from_payload(r#"{"length": -1}"#),
            Err(Error::JsonParse(_))
        ));
    }

    #[test]
    fn destination_prefers_lpath() {
        let meta = BookMeta {
            lpath: "Ann/Story.epub".into(),
            title: "Ignored".into(),
            ..Default::default()
        };
        assert_eq!(
            destination_path("/Books/", &meta, "epub").unwrap(),
            "/Books/Ann/Story.epub"
        );
    }

    #[test]
    fn destination_from_title() {
        let meta = BookMeta {
            title: "What? A: Story".into(),
            ..Default::default()
        };
        assert_eq!(
            destination_path("/Books", &meta, "epub").unwrap(),
            "/Books/What_ A_ Story.epub"
        );
        let untitled = BookMeta::default();
        assert_eq!(
            destination_path("/Books", &untitled, "txt").unwrap(),
            "/Books/Unknown.txt"
        );
    }

    #[test]
    fn sanitize_trims_and_falls_back() {
        assert_eq!(sanitize_filename("  ..name.. "), "name");
        assert_eq!(sanitize_filename(" . "), "Untitled");
        assert_eq!(sanitize_filename("a\tb"), "a_b");
    }

    #[test]
    fn unsafe_lpaths_rejected() {
        assert!(validate_lpath("../etc/passwd").is_err());
        assert!(validate_lpath("a/../../b").is_err());
        assert!(validate_lpath("/abs.epub").is_err());
        assert!(validate_lpath("C:/x.epub").is_err());
        assert!(validate_lpath("Author/..hidden.epub").is_ok());
    }
}
