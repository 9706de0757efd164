//! Key normalization pipeline.
//!
//! Cache keys arrive as arbitrary strings. Before they touch the database
//! they are (1) converted to bytes, (2) truncated to the configured maximum
//! byte size with a collision-safe digest suffix, and (3) hashed to a signed
//! 64-bit integer that serves both as the shard-router input and as the
//! unique index of the `entries` table.

use sha2::{Digest, Sha256};

/// Separator inserted between the truncated key prefix and its digest suffix.
pub const KEY_HASH_SEPARATOR: &str = ":hash:";

// ---------------------------------------------------------------------------
// key_hash
// ---------------------------------------------------------------------------

/// Computes the stable 64-bit hash of a (normalized) key.
///
/// The hash is the first 8 bytes of SHA-256(key), interpreted big-endian and
/// bit-cast to `i64`. The signed representation is deliberate: it fits
/// storage backends without unsigned 64-bit column types exactly. Never
/// reduce this with a modulo -- the full bit pattern is the value.
#[must_use]
pub fn key_hash(key: &[u8]) -> i64 {
    let digest = Sha256::digest(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

// ---------------------------------------------------------------------------
// NormalizedKey
// ---------------------------------------------------------------------------

/// A cache key after normalization: byte form plus its 64-bit hash.
///
/// At most `max_key_bytesize` bytes long. Keys exceeding the limit are
/// truncated and suffixed with `:hash:<hex digest of the full key>`, so two
/// distinct long keys keep distinct normalized forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedKey {
    bytes: Vec<u8>,
    hash: i64,
}

impl NormalizedKey {
    /// Normalizes a string key under the given byte-size limit.
    #[must_use]
    pub fn new(key: &str, max_key_bytesize: usize) -> Self {
        Self::from_bytes(key.as_bytes(), max_key_bytesize)
    }

    /// Normalizes a raw byte key under the given byte-size limit.
    #[must_use]
    pub fn from_bytes(key: &[u8], max_key_bytesize: usize) -> Self {
        let bytes = if key.len() > max_key_bytesize {
            truncate_with_digest(key, max_key_bytesize)
        } else {
            key.to_vec()
        };
        let hash = key_hash(&bytes);
        Self { bytes, hash }
    }

    /// The normalized key bytes stored in the `key` column.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The signed 64-bit hash stored in the `key_hash` column.
    #[must_use]
    pub const fn hash(&self) -> i64 {
        self.hash
    }
}

/// Truncates an over-long key, appending a digest suffix of the *full* key.
///
/// The prefix keeps as many original bytes as fit next to the suffix. When
/// the limit is smaller than the full 64-hex-char digest suffix, the digest
/// itself is shortened so the result still fits the limit; the two keys of a
/// would-be collision then differ in their (shortened) digests instead.
fn truncate_with_digest(key: &[u8], max_key_bytesize: usize) -> Vec<u8> {
    let digest = hex::encode(Sha256::digest(key));
    let full_suffix = KEY_HASH_SEPARATOR.len() + digest.len();

    if full_suffix >= max_key_bytesize {
        let hex_budget = max_key_bytesize.saturating_sub(KEY_HASH_SEPARATOR.len());
        let mut out = Vec::with_capacity(max_key_bytesize);
        out.extend_from_slice(KEY_HASH_SEPARATOR.as_bytes());
        out.extend_from_slice(digest[..hex_budget].as_bytes());
        return out;
    }

    let keep = max_key_bytesize - full_suffix;
    let mut out = Vec::with_capacity(max_key_bytesize);
    out.extend_from_slice(&key[..keep]);
    out.extend_from_slice(KEY_HASH_SEPARATOR.as_bytes());
    out.extend_from_slice(digest.as_bytes());
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(key_hash(b"hello"), key_hash(b"hello"));
        assert_ne!(key_hash(b"hello"), key_hash(b"hellp"));
    }

    #[test]
    fn hash_matches_sha256_prefix() {
        let digest = Sha256::digest(b"strata");
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        assert_eq!(key_hash(b"strata"), i64::from_be_bytes(prefix));
    }

    #[test]
    fn hash_uses_full_signed_range() {
        // 在足夠多的 key 中，bit-cast 應同時產生正負值。
        let mut saw_negative = false;
        let mut saw_positive = false;
        for i in 0..64 {
            let h = key_hash(format!("key_{i}").as_bytes());
            if h < 0 {
                saw_negative = true;
            } else {
                saw_positive = true;
            }
        }
        assert!(saw_negative, "expected at least one negative hash");
        assert!(saw_positive, "expected at least one positive hash");
    }

    #[test]
    fn short_key_passes_through() {
        let key = NormalizedKey::new("users/42", MAX);
        assert_eq!(key.bytes(), b"users/42");
        assert_eq!(key.hash(), key_hash(b"users/42"));
    }

    #[test]
    fn long_key_is_truncated_to_limit() {
        let long = "x".repeat(MAX + 500);
        let key = NormalizedKey::new(&long, MAX);
        assert_eq!(key.bytes().len(), MAX);
    }

    #[test]
    fn truncated_key_keeps_original_prefix_and_digest() {
        let long = "a".repeat(2000);
        let key = NormalizedKey::new(&long, MAX);
        let s = String::from_utf8(key.bytes().to_vec()).unwrap();
        assert!(s.starts_with("aaaa"));
        assert!(s.contains(KEY_HASH_SEPARATOR));
        // 完整 sha256 hex 是 64 字元。
        assert!(s.ends_with(&hex::encode(Sha256::digest(long.as_bytes()))));
    }

    #[test]
    fn distinct_long_keys_stay_distinct() {
        // Two keys sharing a long common prefix must not collapse to the
        // same normalized form.
        let a = "A".repeat(100);
        let b = format!("{}B", "A".repeat(99));
        let ka = NormalizedKey::new(&a, 32);
        let kb = NormalizedKey::new(&b, 32);
        assert_ne!(ka.bytes(), kb.bytes());
        assert_ne!(ka.hash(), kb.hash());
        assert!(ka.bytes().len() <= 32);
        assert!(kb.bytes().len() <= 32);
    }

    #[test]
    fn tiny_limit_still_bounded() {
        let key = NormalizedKey::new(&"z".repeat(100), 16);
        assert!(key.bytes().len() <= 16);
    }

    #[test]
    fn exact_limit_is_not_truncated() {
        let exact = "k".repeat(MAX);
        let key = NormalizedKey::new(&exact, MAX);
        assert_eq!(key.bytes(), exact.as_bytes());
    }
}
