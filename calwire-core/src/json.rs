//! Minimal field extractor for protocol payloads.
//!
//! This is a linear scan, not a parser. Given a buffer holding one JSON object or
//! array, it finds the first occurrence (at any depth) of `"<name>"` followed by `:`
//! and reads the value token after it. Supported value shapes:
//!
//! - string: returned as the raw slice between the quotes, escapes left intact
//!   (use [`unescape`] when an owned, decoded value is needed);
//! - integer: optional `-` then ASCII digits, parsed as `i64`;
//! - boolean: `true` / `false`;
//! - flat array of strings: iterated with [`string_list`].
//!
//! Nothing is allocated and overall well-formedness is not checked. Absent fields or
//! fields of a different shape yield `None`; callers pick their own default.

use std::borrow::Cow;

/// Locate the value token for `name`, returning the remainder starting at the value.
fn value_after<'a>(json: &'a str, name: &str) -> Option<&'a str> {
    let bytes = json.as_bytes();
    let key = name.as_bytes();
    let mut from = 0;
    while let Some(pos) = find_key(&bytes[from..], key) {
        let after = from + pos + key.len() + 2;
        let rest = json[after..].trim_start();
        if let Some(value) = rest.strip_prefix(':') {
            return Some(value.trim_start());
        }
        from = after;
    }
    None
}

/// Offset of `"key"` inside `hay`.
fn find_key(hay: &[u8], key: &[u8]) -> Option<usize> {
    let needle_len = key.len() + 2;
    if hay.len() < needle_len {
        return None;
    }
    (0..=hay.len() - needle_len).find(|&i| {
        hay[i] == b'"' && hay[i + 1 + key.len()] == b'"' && &hay[i + 1..i + 1 + key.len()] == key
    })
}

/// Split a string token starting at `"` into (contents, rest after closing quote).
fn string_token(value: &str) -> Option<(&str, &str)> {
    let body = value.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some((&body[..i], &body[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

/// Raw string value of `name`.
pub fn find_str<'a>(json: &'a str, name: &str) -> Option<&'a str> {
    string_token(value_after(json, name)?).map(|(s, _)| s)
}

/// Integer value of `name`.
pub fn find_int(json: &str, name: &str) -> Option<i64> {
    let value = value_after(json, name)?;
    let digits_start = usize::from(value.starts_with('-'));
    let end = value[digits_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(value.len(), |n| n + digits_start);
    if end == digits_start {
        return None;
    }
    value[..end].parse().ok()
}

/// Boolean value of `name`.
pub fn find_bool(json: &str, name: &str) -> Option<bool> {
    let value = value_after(json, name)?;
    if value.starts_with("true") {
        Some(true)
    } else if value.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

/// Raw string items of a flat array value, e.g. `"authors": ["A", "B"]`.
pub fn string_list<'a>(json: &'a str, name: &str) -> Option<StringList<'a>> {
    let rest = value_after(json, name)?.strip_prefix('[')?;
    Some(StringList { rest })
}

/// Iterator returned by [`string_list`]. Stops at the first non-string item.
pub struct StringList<'a> {
    rest: &'a str,
}

impl<'a> Iterator for StringList<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start();
        let rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        let (item, after) = string_token(rest)?;
        self.rest = after;
        Some(item)
    }
}

/// Decode JSON string escapes in a raw slice from [`find_str`].
pub fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                out.push(decoded);
            }
            Some(other) => out.push(other),
            None => break,
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEND_BOOK: &str = r#"{"lpath": "Author/Book.epub", "length": 1234,
        "metadata": {"title": "A \"quoted\" title", "authors": ["Ann", "Bob"],
        "uuid": "abc-123", "application_id": 42}, "willStreamBinary": true}"#;

    #[test]
    fn finds_top_level_string() {
        assert_eq!(find_str(SEND_BOOK, "lpath"), Some("Author/Book.epub"));
    }

    #[test]
    fn finds_nested_fields() {
        assert_eq!(find_str(SEND_BOOK, "uuid"), Some("abc-123"));
        assert_eq!(find_int(SEND_BOOK, "application_id"), Some(42));
    }

    #[test]
    fn string_keeps_escapes_until_unescaped() {
        let raw = find_str(SEND_BOOK, "title").unwrap();
        assert_eq!(raw, r#"A \"quoted\" title"#);
        assert_eq!(unescape(raw), "A \"quoted\" title");
    }

    #[test]
    fn integers_and_booleans() {
        assert_eq!(find_int(SEND_BOOK, "length"), Some(1234));
        assert_eq!(find_bool(SEND_BOOK, "willStreamBinary"), Some(true));
        assert_eq!(find_int(r#"{"n": -7}"#, "n"), Some(-7));
        assert_eq!(find_bool(r#"{"isLast":false}"#, "isLast"), Some(false));
    }

    #[test]
    fn absent_field_is_none() {
        assert_eq!(find_str(SEND_BOOK, "missing"), None);
        assert_eq!(find_int("{}", "length"), None);
        assert_eq!(find_bool("", "isLast"), None);
    }

    #[test]
    fn wrong_shape_is_none() {
        assert_eq!(find_int(SEND_BOOK, "lpath"), None);
        assert_eq!(find_str(SEND_BOOK, "length"), None);
        assert_eq!(find_str(SEND_BOOK, "authors"), None);
    }

    #[test]
    fn name_appearing_as_value_is_skipped() {
        let json = r#"{"kind": "title", "title": "Real"}"#;
        assert_eq!(find_str(json, "title"), Some("Real"));
    }

    #[test]
    fn string_list_items() {
        let authors: Vec<&str> = string_list(SEND_BOOK, "authors").unwrap().collect();
        assert_eq!(authors, vec!["Ann", "Bob"]);
        assert_eq!(string_list(r#"{"a": []}"#, "a").unwrap().count(), 0);
        assert!(string_list(SEND_BOOK, "lpath").is_none());
    }

    #[test]
    fn unicode_escape() {
        assert_eq!(unescape(r"caf\u00e9"), "café");
        assert!(matches!(unescape("plain"), Cow::Borrowed("plain")));
    }
}
