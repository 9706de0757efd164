//! Maglev lookup-table construction and key lookup.

use crate::RouterError;

/// Lookup table length. Prime, so every per-shard preference sequence is a
/// full permutation of the slot indices and table filling always terminates.
pub const TABLE_SIZE: usize = 2053;

const EMPTY: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// MaglevTable
// ---------------------------------------------------------------------------

/// A precomputed Maglev routing table over a fixed set of shard names.
///
/// The table is read-only after construction; membership changes mean
/// building a new table. Lookups cost one CRC32 and one array index.
#[derive(Debug, Clone)]
pub struct MaglevTable {
    shards: Vec<String>,
    table: Vec<u32>,
}

impl MaglevTable {
    /// Builds the routing table for the given shard names.
    ///
    /// Names are sorted and deduplicated first, so the table is a pure
    /// function of the shard *set* -- callers need not care about order.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoShards`] for an empty set and
    /// [`RouterError::TooManyShards`] when the set exceeds [`TABLE_SIZE`].
    pub fn build<S: AsRef<str>>(names: &[S]) -> Result<Self, RouterError> {
        let mut shards: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        shards.sort();
        shards.dedup();

        if shards.is_empty() {
            return Err(RouterError::NoShards);
        }
        if shards.len() > TABLE_SIZE {
            return Err(RouterError::TooManyShards(shards.len(), TABLE_SIZE));
        }

        let table = fill_table(&shards);
        Ok(Self { shards, table })
    }

    /// Returns the shard name responsible for `key`.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> &str {
        let slot = crc32fast::hash(key) as usize % TABLE_SIZE;
        &self.shards[self.table[slot] as usize]
    }

    /// The sorted, deduplicated shard names this table routes over.
    #[must_use]
    pub fn shards(&self) -> &[String] {
        &self.shards
    }

    #[cfg(test)]
    fn slots(&self) -> &[u32] {
        &self.table
    }
}

/// Round-robin fill over the per-shard preference permutations.
fn fill_table(shards: &[String]) -> Vec<u32> {
    let n = shards.len();
    let mut offsets = Vec::with_capacity(n);
    let mut skips = Vec::with_capacity(n);
    for name in shards {
        let (h1, h2) = hash_pair(name);
        offsets.push(h1 as usize % TABLE_SIZE);
        // skip ∈ [1, M-1]，與 M 互質（M 為質數），保證偏好序列走完全部 slot。
        skips.push(h2 as usize % (TABLE_SIZE - 1) + 1);
    }

    let mut table = vec![EMPTY; TABLE_SIZE];
    let mut ranks = vec![0usize; n];
    let mut filled = 0usize;

    'fill: loop {
        for shard in 0..n {
            // Advance this shard's preference rank until it hits a free slot.
            loop {
                let slot = (offsets[shard] + ranks[shard] * skips[shard]) % TABLE_SIZE;
                ranks[shard] += 1;
                if table[slot] == EMPTY {
                    table[slot] = shard as u32;
                    filled += 1;
                    if filled == TABLE_SIZE {
                        break 'fill;
                    }
                    break;
                }
            }
        }
    }

    table
}

/// Two independent 32-bit hashes of a shard name, MD5-derived: the first
/// four bytes (big-endian) of `md5(name)` and of `md5(name + 0x01)`.
fn hash_pair(name: &str) -> (u32, u32) {
    let d1 = md5::compute(name.as_bytes());

    let mut salted = Vec::with_capacity(name.len() + 1);
    salted.extend_from_slice(name.as_bytes());
    salted.push(0x01);
    let d2 = md5::compute(&salted);

    (be_u32(&d1.0), be_u32(&d2.0))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
