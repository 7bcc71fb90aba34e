use sha2::{Digest, Sha256};

/// Hash entity content for embedding staleness detection.
///
/// Unlike duplicate detection, no normalization is applied: the embedding is
/// computed from the exact text, so any byte change makes it stale.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
