use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a migration file's raw bytes, hex-encoded.
///
/// The digest covers the bytes exactly as read from disk. Line endings are
/// not normalized, so any edit to an applied file is reported as drift.
pub fn calculate_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
