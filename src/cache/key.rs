//! Text normalization and content fingerprints

use sha2::{Digest, Sha256};

/// Normalize text for keying: trimmed and lowercased
#[must_use]
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Stable fingerprint of the normalized text (hex-encoded SHA-256)
#[must_use]
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}
