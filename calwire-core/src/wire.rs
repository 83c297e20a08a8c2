//! Framing: ASCII decimal length immediately followed by `["OPCODE", payload]`.
//!
//! There is no separator between the digits and the opening `[`; the first non-digit
//! ends the length and is already the first byte of the message.

use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{recv_exact, send_all, CancelToken, Deadline, Transport};

/// Longest length prefix accepted before the frame is rejected.
const MAX_LEN_DIGITS: usize = 10;

/// One decoded frame. Both fields borrow the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub opcode: &'a str,
    /// Raw JSON text of the payload, normally an object.
    pub payload: &'a str,
}

impl<'a> Message<'a> {
    /// Split assembled frame text into opcode and payload.
    pub fn parse(text: &'a str) -> Result<Self> {
        let start = text
            .find('"')
            .ok_or_else(|| Error::JsonParse("missing opcode".into()))?;
        let rest = &text[start + 1..];
        let end = rest
            .find('"')
            .ok_or_else(|| Error::JsonParse("malformed opcode".into()))?;
        let opcode = &rest[..end];
        let payload = rest[end + 1..]
            .trim_start_matches(|c: char| c == ',' || c.is_whitespace())
            .trim_end();
        let payload = payload.strip_suffix(']').unwrap_or(payload).trim_end();
        Ok(Message { opcode, payload })
    }
}

/// Encode one frame. An empty payload is sent as `{}`.
pub fn encode_frame(opcode: &str, payload: &str, max_len: usize) -> Result<Vec<u8>> {
    let payload = if payload.trim().is_empty() { "{}" } else { payload };
    let text = format!("[\"{opcode}\", {payload}]");
    if text.len() > max_len {
        return Err(Error::OutOfMemory(format!(
            "message too large ({} bytes)",
            text.len()
        )));
    }
    let mut out = text.len().to_string().into_bytes();
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}

/// Encode and write one frame.
pub fn send_frame<T: Transport + ?Sized>(
    transport: &mut T,
    opcode: &str,
    payload: &str,
    max_len: usize,
) -> Result<()> {
    let frame = encode_frame(opcode, payload, max_len)?;
    debug!(opcode, len = frame.len(), "sending frame");
    send_all(transport, &frame)
}

/// Read exactly one frame into `buf` and return a view of it.
///
/// A declared length of zero or above `max_len` fails with `Protocol` after consuming
/// only the length prefix and its terminating byte.
pub fn read_frame<'b, T: Transport + ?Sized>(
    transport: &mut T,
    buf: &'b mut Vec<u8>,
    max_len: usize,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Message<'b>> {
    let deadline = Deadline::after(timeout);
    let mut digits = [0u8; MAX_LEN_DIGITS];
    let mut count = 0;
    let first = loop {
        let mut byte = [0u8; 1];
        recv_exact(transport, &mut byte, deadline, cancel)?;
        if !byte[0].is_ascii_digit() {
            break byte[0];
        }
        if count == MAX_LEN_DIGITS {
            return Err(Error::protocol("length prefix too long"));
        }
        digits[count] = byte[0];
        count += 1;
    };
    let len = parse_len(&digits[..count])?;
    if len == 0 || len > max_len {
        return Err(Error::protocol(format!("invalid message length {len}")));
    }

    buf.clear();
    if buf.capacity() < len {
        buf.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory(format!("receive buffer of {len} bytes")))?;
    }
    buf.push(first);
    buf.resize(len, 0);
    recv_exact(transport, &mut buf[1..], deadline, cancel)?;

    let text = std::str::from_utf8(buf).map_err(|_| Error::JsonParse("frame is not UTF-8".into()))?;
    let msg = Message::parse(text)?;
    debug!(opcode = msg.opcode, len, "received frame");
    Ok(msg)
}

fn parse_len(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() {
        return Err(Error::protocol("missing length prefix"));
    }
    // Digits only, so this is valid UTF-8 and at most ten characters.
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol("unparsable length prefix"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json;
    use crate::transport::mock::{ScriptedPeer, Step};

    const MAX: usize = 1024;

    fn read_one(bytes: &[u8]) -> (Result<(String, String)>, ScriptedPeer) {
        let mut peer = ScriptedPeer::new(vec![Step::Data(bytes.to_vec())]);
        let mut buf = Vec::new();
        let res = read_frame(
            &mut peer,
            &mut buf,
            MAX,
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .map(|m| (m.opcode.to_string(), m.payload.to_string()));
        (res, peer)
    }

    #[test]
    fn encode_prefixes_decimal_length() {
        let frame = encode_frame("OK", "{}", MAX).unwrap();
        assert_eq!(frame, b"10[\"OK\", {}]");
    }

    #[test]
    fn empty_payload_becomes_object() {
        let frame = encode_frame("NOOP", "", MAX).unwrap();
        assert_eq!(frame, b"12[\"NOOP\", {}]");
    }

    #[test]
    fn oversized_outgoing_frame_rejected() {
        let big = format!("{{\"x\": \"{}\"}}", "a".repeat(MAX));
        assert!(matches!(
            encode_frame("OK", &big, MAX),
            Err(Error::OutOfMemory(_))
        ));
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let payload = r#"{"passwordChallenge":"X","serverProtocolVersion":1}"#;
        let frame = encode_frame("GET_INITIALIZATION_INFO", payload, MAX).unwrap();
        let (res, _) = read_one(&frame);
        let (opcode, got) = res.unwrap();
        assert_eq!(opcode, "GET_INITIALIZATION_INFO");
        assert_eq!(json::find_str(&got, "passwordChallenge"), Some("X"));
        assert_eq!(json::find_int(&got, "serverProtocolVersion"), Some(1));
    }

    #[test]
    fn decodes_literal_handshake_frame() {
        let text = r#"["GET_INITIALIZATION_INFO", {"passwordChallenge":"X","serverProtocolVersion":1}]"#;
        let frame = format!("{}{}", text.len(), text);
        let (res, _) = read_one(frame.as_bytes());
        let (opcode, payload) = res.unwrap();
        assert_eq!(opcode, "GET_INITIALIZATION_INFO");
        assert_eq!(
            payload,
            r#"{"passwordChallenge":"X","serverProtocolVersion":1}"#
        );
    }

    #[test]
    fn zero_length_is_protocol_error() {
        let (res, mut peer) = read_one(b"0[\"OK\", {}]");
        assert!(matches!(res, Err(Error::Protocol(_))));
        // Only "0[" was consumed.
        let mut rest = [0u8; 4];
        peer.recv(&mut rest).unwrap();
        assert_eq!(&rest, b"\"OK\"");
    }

    #[test]
    fn oversized_length_is_protocol_error() {
        let (res, mut peer) = read_one(b"999999[\"OK\"");
        assert!(matches!(res, Err(Error::Protocol(_))));
        let mut rest = [0u8; 4];
        peer.recv(&mut rest).unwrap();
        assert_eq!(&rest, b"\"OK\"");
    }

    #[test]
    fn missing_length_prefix_rejected() {
        let (res, _) = read_one(b"[\"OK\", {}]");
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[test]
    fn truncated_frame_is_disconnect() {
        let mut peer = ScriptedPeer::new(vec![Step::Data(b"10[\"OK\"".to_vec()), Step::Eof]);
        let mut buf = Vec::new();
        let err = read_frame(
            &mut peer,
            &mut buf,
            MAX,
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn consecutive_frames_share_buffer() {
        let mut bytes = encode_frame("NOOP", "{}", MAX).unwrap();
        bytes.extend(encode_frame("DISPLAY_MESSAGE", r#"{"message":"hi"}"#, MAX).unwrap());
        let mut peer = ScriptedPeer::new(vec![Step::Data(bytes)]);
        let mut buf = Vec::new();
        let cancel = CancelToken::new();
        let first = read_frame(&mut peer, &mut buf, MAX, Duration::from_secs(1), &cancel)
            .unwrap()
            .opcode
            .to_string();
        assert_eq!(first, "NOOP");
        let second = read_frame(&mut peer, &mut buf, MAX, Duration::from_secs(1), &cancel).unwrap();
        assert_eq!(second.opcode, "DISPLAY_MESSAGE");
        assert_eq!(json::find_str(second.payload, "message"), Some("hi"));
    }

    #[test]
    fn parse_without_payload() {
        let msg = Message::parse(r#"["NOOP"]"#).unwrap();
        assert_eq!(msg.opcode, "NOOP");
        assert_eq!(msg.payload, "");
    }

    #[test]
    fn parse_without_opcode_fails() {
        assert!(matches!(Message::parse("[1, 2]"), Err(Error::JsonParse(_))));
    }
}
