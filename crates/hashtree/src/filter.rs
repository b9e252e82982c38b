use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dfl_common::{DflError, Result};

/// Deterministic shard of a path under `n_shards` partitions.
pub fn shard_of(path: &str, n_shards: i64) -> i64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % n_shards as u64) as i64
}

/// Shard predicate keeping exactly the paths whose hash-derived shard matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    n_shards: i64,
    shard: i64,
}

impl Filter {
    /// Build the `(n_shards, shard)` predicate.
    pub fn new(n_shards: i64, shard: i64) -> Result<Self> {
        if n_shards <= 0 {
            return Err(DflError::InvalidConfig(format!(
                "shard count must be positive, got {n_shards}"
            )));
        }
        if shard < 0 || shard >= n_shards {
            return Err(DflError::InvalidConfig(format!(
                "shard {shard} outside [0, {n_shards})"
            )));
        }
        Ok(Self { n_shards, shard })
    }

    /// Whether `path` belongs to this filter's shard.
    pub fn allows(&self, path: &str) -> bool {
        shard_of(path, self.n_shards) == self.shard
    }
}
