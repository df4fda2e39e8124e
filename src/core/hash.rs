use sha3::{Digest, Sha3_256};

/// Prefix marking a cache key derived from a digest rather than the raw reference.
pub const DIGEST_KEY_PREFIX: &str = "sha3:";

/// Computes SHA3-256 hash of byte data
pub fn compute_sha3_256(data: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derives the embedding cache key for an image reference.
///
/// Inline `data:` payloads are replaced by their digest so the cache never
/// stores the encoded image itself; every other reference keys by its text.
pub fn reference_key(reference: &str) -> String {
    if reference.starts_with("data:") {
        format!("{}{}", DIGEST_KEY_PREFIX, compute_sha3_256(reference.as_bytes()))
    } else {
        reference.to_string()
    }
}
