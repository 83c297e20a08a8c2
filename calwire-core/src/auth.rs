//! Password proof sent in the handshake.

use sha1::{Digest, Sha1};

/// Hex SHA-1 of `password ++ challenge`, or empty when no password is set.
pub fn password_hash(password: Option<&str>, challenge: &str) -> String {
    match password {
        Some(pw) if !pw.is_empty() => {
            let mut hasher = Sha1::new();
            hasher.update(pw.as_bytes());
            hasher.update(challenge.as_bytes());
            hex::encode(hasher.finalize())
        }
        _ => String::new(),
    }
}
