//! Background expiry controller.
//!
//! There is no TTL column: per-entry expiry lives inside the opaque value
//! and is enforced on read. This controller enforces the *global* bounds --
//! maximum age, row count and byte size -- by scheduling small eviction
//! batches in proportion to the write rate. After `c` successful row writes
//! the store schedules `batches_for(c)` eviction tasks, so over time the
//! eviction rate tracks `MULTIPLIER` times the write rate and the table
//! stays bounded without any periodic sweeper.

use std::time::Duration;

use rand::Rng;
use strata_core::config::{ExpiryConfig, ExpiryMethod};
use tracing::debug;

use crate::dispatcher::Shard;
use crate::estimator::SizeEstimator;
use crate::repository::{now_secs, Repository};
use crate::StoreError;

// ---------------------------------------------------------------------------
// ExpiryController
// ---------------------------------------------------------------------------

/// Tracks write volume and runs eviction batches.
#[derive(Debug, Clone)]
pub struct ExpiryController {
    batch_size: usize,
    max_age: Option<Duration>,
    max_entries: Option<u64>,
    max_size: Option<u64>,
    method: ExpiryMethod,
    queue: Option<String>,
}

impl ExpiryController {
    /// Builds a controller from the store configuration.
    #[must_use]
    pub fn from_config(config: &ExpiryConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_age: config.max_age.map(Duration::from_secs),
            max_entries: config.max_entries,
            max_size: config.max_size,
            method: config.method,
            queue: config.queue.clone(),
        }
    }

    /// Where eviction batches run.
    #[must_use]
    pub const fn method(&self) -> ExpiryMethod {
        self.method
    }

    /// Job queue name for the `job` method.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Rows targeted per eviction batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of eviction batches to schedule after writing `written` rows.
    ///
    /// The expected count is `written × MULTIPLIER / batch_size`; the
    /// fractional part is realized with a Bernoulli draw. Rounding instead
    /// would bias the long-run eviction rate.
    #[must_use]
    pub fn batches_for(&self, written: usize) -> usize {
        if written == 0 {
            return 0;
        }
        let expected = written as f64 * ExpiryConfig::MULTIPLIER / self.batch_size as f64;
        let floor = expected.floor();
        let fraction = expected - floor;
        let mut batches = floor as usize;
        if fraction > 0.0 && rand::rng().random::<f64>() < fraction {
            batches += 1;
        }
        batches
    }

    /// Runs one eviction batch against a shard. Returns the rows deleted.
    ///
    /// When the cache is over its row-count or byte-size bound, the oldest
    /// rows are evicted unconditionally; otherwise only rows older than
    /// `max_age` qualify. Candidates are over-fetched threefold and the
    /// batch is sampled uniformly from them, so two evictors running
    /// concurrently rarely target the same rows.
    pub fn evict(
        &self,
        repository: &Repository,
        shard: &Shard,
        estimator: &SizeEstimator,
    ) -> Result<usize, StoreError> {
        let cache_full = self.cache_full(repository, shard, estimator)?;
        if !cache_full && self.max_age.is_none() {
            return Ok(0);
        }

        let candidates = repository.oldest_entries(shard, self.batch_size * 3)?;
        let ids: Vec<i64> = if cache_full {
            candidates.into_iter().map(|(id, _)| id).collect()
        } else if let Some(max_age) = self.max_age {
            let cutoff = now_secs() - max_age.as_secs() as i64;
            candidates
                .into_iter()
                .filter(|&(_, created_at)| created_at < cutoff)
                .map(|(id, _)| id)
                .collect()
        } else {
            return Ok(0);
        };

        if ids.is_empty() {
            return Ok(0);
        }

        let victims = sample(&ids, self.batch_size);
        let deleted = repository.delete_by_ids(shard, &victims)?;
        if deleted > 0 {
            debug!(shard = shard.name(), deleted, cache_full, "eviction batch complete");
        }
        Ok(deleted)
    }

    fn cache_full(
        &self,
        repository: &Repository,
        shard: &Shard,
        estimator: &SizeEstimator,
    ) -> Result<bool, StoreError> {
        if let Some(max_entries) = self.max_entries {
            if max_entries < repository.id_range(shard)? {
                return Ok(true);
            }
        }
        if let Some(max_size) = self.max_size {
            if max_size < estimator.estimated_size(repository, shard)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Uniform sample of `n` ids without replacement.
fn sample(ids: &[i64], n: usize) -> Vec<i64> {
    if ids.len() <= n {
        return ids.to_vec();
    }
    let mut rng = rand::rng();
    rand::seq::index::sample(&mut rng, ids.len(), n)
        .into_iter()
        .map(|i| ids[i])
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
