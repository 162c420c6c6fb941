//! Shard placement for direct loading
//!
//! Maps a document URI onto the shard that should own it. The hash is the
//! single source of truth for placement: it must stay stable across runs
//! and across processes, otherwise re-loads of the same URI would land on a
//! different shard than the store expects.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One independently addressable partition of the destination store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    /// Opaque shard identifier
    pub id: String,
    /// Hosts currently serving this shard
    pub hosts: Vec<String>,
}

impl ShardRef {
    pub fn new(id: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            id: id.into(),
            hosts,
        }
    }
}

/// Read-only shard map resolved once at startup
///
/// Shared across workers behind an [`Arc`]; never mutated by the pipeline.
#[derive(Debug, Clone)]
pub struct ShardMap {
    shards: Arc<Vec<ShardRef>>,
}

/// FNV-1a 64-bit hash over the URI bytes.
///
/// Written out rather than pulled from a hashing crate so the constants are
/// pinned: the placement of every URI depends on them.
fn fnv1a_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl ShardMap {
    /// Build a map from resolved shard references
    pub fn new(shards: Vec<ShardRef>) -> Self {
        Self {
            shards: Arc::new(shards),
        }
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Check whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard slot index for a URI (sign-bit masked, modulo shard count)
    ///
    /// Deterministic and side-effect-free; O(len(uri)).
    pub fn shard_index(&self, uri: &str) -> usize {
        debug_assert!(!self.shards.is_empty());
        let hash = fnv1a_64(uri.as_bytes()) & 0x7fff_ffff_ffff_ffff;
        (hash % self.shards.len() as u64) as usize
    }

    /// Shard reference at a slot index
    pub fn shard(&self, index: usize) -> &ShardRef {
        &self.shards[index]
    }

    /// Iterate over all shards in slot order
    pub fn iter(&self) -> impl Iterator<Item = &ShardRef> {
        self.shards.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(n: usize) -> ShardMap {
        let shards = (0..n)
            .map(|i| ShardRef::new(format!("shard-{}", i), vec![format!("node{}:8020", i)]))
            .collect();
        ShardMap::new(shards)
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        // Reference values for the 64-bit FNV-1a parameters
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_placement_is_deterministic() {
        let map = map_of(7);
        let first = map.shard_index("/docs/report-2024.xml");
        for _ in 0..10 {
            assert_eq!(map.shard_index("/docs/report-2024.xml"), first);
        }
    }

    #[test]
    fn test_placement_within_bounds() {
        let map = map_of(3);
        for i in 0..1000 {
            let idx = map.shard_index(&format!("/docs/{}.json", i));
            assert!(idx < 3);
        }
    }

    #[test]
    fn test_placement_spreads_across_shards() {
        let map = map_of(4);
        let mut seen = [0usize; 4];
        for i in 0..400 {
            seen[map.shard_index(&format!("/docs/{}.json", i))] += 1;
        }
        // every shard receives a reasonable share of 400 uniform URIs
        for (idx, count) in seen.iter().enumerate() {
            assert!(*count > 40, "shard {} got only {} documents", idx, count);
        }
    }

    #[test]
    fn test_single_shard_takes_everything() {
        let map = map_of(1);
        assert_eq!(map.shard_index("/a"), 0);
        assert_eq!(map.shard_index("/b"), 0);
    }
}
