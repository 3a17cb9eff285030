//! Content hashing utilities
//!
//! SHA-256 identifies exact duplicates; 64-bit SimHash over the normalised
//! token stream identifies near-duplicates for bundle dedupe.

use crate::text::normalize_terms;
use sha2::{Digest, Sha256};

/// SHA-256 content hash for deduplication and integrity verification.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Render a content hash as lowercase hex (for provenance and exports).
pub fn render_content_hash(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// 64-bit SimHash over the normalised token stream of `text`.
///
/// Tokens are weighted equally; each token's SHA-256 contributes its low
/// 64 bits to the bit-vote. Empty or all-stopword text hashes to 0.
pub fn simhash64(text: &str) -> u64 {
    let terms = normalize_terms(text);
    if terms.is_empty() {
        return 0;
    }

    let mut votes = [0i32; 64];
    for term in &terms {
        let digest = compute_content_hash(term.as_bytes());
        let mut low = [0u8; 8];
        low.copy_from_slice(&digest[..8]);
        let bits = u64::from_be_bytes(low);
        for (i, vote) in votes.iter_mut().enumerate() {
            if bits >> i & 1 == 1 {
                *vote += 1;
            } else {
                *vote -= 1;
            }
        }
    }

    let mut hash = 0u64;
    for (i, vote) in votes.iter().enumerate() {
        if *vote > 0 {
            hash |= 1 << i;
        }
    }
    hash
}

/// Hamming distance between two SimHash values.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let a = compute_content_hash(b"our budget is 65K");
        let b = compute_content_hash(b"our budget is 65K");
        let c = compute_content_hash(b"our budget is 32K");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(render_content_hash(&a).len(), 64);
    }

    #[test]
    fn test_simhash_near_duplicates_are_close() {
        let a = simhash64("the project budget is 65K tokens for every bundle");
        let b = simhash64("project budget is 65K tokens for each bundle");
        let c = simhash64("retrieval uses reciprocal rank fusion with k sixty");
        assert!(hamming_distance(a, b) < hamming_distance(a, c));
    }

    #[test]
    fn test_simhash_identical_text() {
        let a = simhash64("Chunk derivation splits on paragraph boundaries");
        let b = simhash64("Chunk derivation splits on paragraph boundaries");
        assert_eq!(hamming_distance(a, b), 0);
    }

    #[test]
    fn test_simhash_empty_text() {
        assert_eq!(simhash64(""), 0);
        // Pure stopwords normalise to nothing.
        assert_eq!(simhash64("the and of"), 0);
    }
}
