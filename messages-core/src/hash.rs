//! Content addressing for messages and email thread roots.
//!
//! The hash algorithm and truncation length are a fixed constant: changing
//! either invalidates every id a deployment has already issued, so this is
//! not exposed as a runtime setting.

use sha2::{Digest, Sha256};

/// Number of hex characters (64 bits) kept from the SHA-256 digest.
pub const CONTENT_HASH_HEX_LEN: usize = 16;

/// Hash the canonical tuple `(kind, author_handle, created_at, content,
/// platform, platform_id)` used to derive a Message's id.
///
/// Field order and separators are fixed; changing them changes every
/// future id but never affects already-stored ids (those are just strings).
pub fn message_content_hash(
    kind: i32,
    author_handle: &str,
    created_at: i64,
    content: &str,
    platform: &str,
    platform_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(author_handle.as_bytes());
    hasher.update(b"\0");
    hasher.update(created_at.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hasher.update(b"\0");
    hasher.update(platform.as_bytes());
    hasher.update(b"\0");
    hasher.update(platform_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..CONTENT_HASH_HEX_LEN].to_string()
}

/// Hash an arbitrary root identifier (e.g. an email Message-ID) down to the
/// same fixed-length hex prefix used for email thread ids.
pub fn hash_prefix(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..CONTENT_HASH_HEX_LEN].to_string()
}

/// Hash arbitrary bytes for content-blob addressing. Full 64 hex chars are
/// kept here (blobs need a much lower collision tolerance than message ids
/// tied to a narrow per-thread ordering).
pub fn blob_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_input_yields_identical_id() {
        let a = message_content_hash(0, "alice", 1000, "hi", "signal", "msg1");
        let b = message_content_hash(0, "alice", 1000, "hi", "signal", "msg1");
        assert_eq!(a, b);
        assert_eq!(a.len(), CONTENT_HASH_HEX_LEN);
    }

    #[test]
    fn different_content_yields_different_id() {
        let a = message_content_hash(0, "alice", 1000, "hi", "signal", "msg1");
        let b = message_content_hash(0, "alice", 1000, "bye", "signal", "msg1");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_prefix_is_deterministic() {
        assert_eq!(hash_prefix("<a@x>"), hash_prefix("<a@x>"));
    }
}
