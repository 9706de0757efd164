//! The cache API surface.
//!
//! [`Store`] composes the engine's capabilities -- dispatcher, repository,
//! expiry controller, background executor, failsafe envelope, size
//! estimator -- behind a conventional cache interface. Every storage call
//! runs inside the failsafe, so transient faults surface as defaulted
//! return values, never as caller-visible errors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use strata_core::config::{ClearWith, ExpiryMethod, StrataConfig};
use strata_core::{CacheEntry, NormalizedKey};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Shard};
use crate::estimator::SizeEstimator;
use crate::executor::{Executor, TaskWrapper};
use crate::expiry::ExpiryController;
use crate::failsafe::{ErrorHandler, Failsafe, FailsafeTag};
use crate::repository::{Repository, MAX_BATCH};
use crate::StoreError;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Relative expiry; enforced on read, not by the schema.
    pub expires_in: Option<Duration>,
    /// Version tag; reads requesting a different version miss.
    pub version: Option<String>,
    /// Only write when no live entry exists for the key.
    pub unless_exist: bool,
}

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Expected version tag; a stored entry tagged differently is dropped.
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Host-supplied durable job runner, used when eviction is configured with
/// the `job` method. The job carries everything needed to call
/// [`Store::run_eviction`] later, on any process.
pub trait JobQueue: Send + Sync {
    /// Enqueues an eviction job.
    fn enqueue(&self, job: EvictionJob) -> Result<(), StoreError>;
}

/// One durable eviction work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionJob {
    /// Shard captured at scheduling time.
    pub shard: String,
    /// Rows targeted by the batch.
    pub batch_size: usize,
    /// Queue name from the store configuration.
    pub queue: Option<String>,
}

// ---------------------------------------------------------------------------
// StoreBuilder
// ---------------------------------------------------------------------------

/// Builds a [`Store`], attaching the runtime-only hooks that do not belong
/// in the serializable configuration.
pub struct StoreBuilder {
    config: StrataConfig,
    error_handler: Option<ErrorHandler>,
    job_queue: Option<Arc<dyn JobQueue>>,
    task_wrapper: Option<TaskWrapper>,
}

impl StoreBuilder {
    /// Host callback invoked whenever a transient storage error is
    /// swallowed.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Durable job runner for `job`-method eviction.
    #[must_use]
    pub fn job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.job_queue = Some(queue);
        self
    }

    /// Host-runtime wrapper applied around background tasks.
    #[must_use]
    pub fn task_wrapper(mut self, wrapper: TaskWrapper) -> Self {
        self.task_wrapper = Some(wrapper);
        self
    }

    /// Validates the configuration, opens every shard, and migrates the
    /// schema.
    ///
    /// # Errors
    ///
    /// Fails on an inconsistent configuration or an unopenable database.
    pub fn build(self) -> Result<Store, StoreError> {
        self.config.validate()?;

        let failsafe = Failsafe::new(self.error_handler);
        let dispatcher = Dispatcher::open(
            &self.config.backing(),
            Duration::from_millis(self.config.busy_timeout_ms),
            self.config.journal_mode,
        )?;
        let repository =
            Repository::new(self.config.instrumentation, self.config.row_overhead());
        dispatcher.with_each(|shard| repository.migrate(shard))?;

        let executor = Executor::new(
            self.task_wrapper,
            self.config.instrumentation,
            failsafe.clone(),
        );

        let store = Store {
            dispatcher,
            repository,
            expiry: ExpiryController::from_config(&self.config.expiry),
            estimator: SizeEstimator::new(self.config.size_estimate_samples),
            executor,
            failsafe,
            job_queue: self.job_queue,
            max_key_bytesize: self.config.max_key_bytesize,
            clear_with: self.config.clear_with,
        };
        info!(shards = store.dispatcher.len(), "strata store ready");
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The durable SQL-backed cache.
pub struct Store {
    dispatcher: Dispatcher,
    repository: Repository,
    expiry: ExpiryController,
    estimator: SizeEstimator,
    executor: Executor,
    failsafe: Failsafe,
    job_queue: Option<Arc<dyn JobQueue>>,
    max_key_bytesize: usize,
    clear_with: ClearWith,
}

impl Store {
    /// Builds a store from configuration with no runtime hooks attached.
    ///
    /// # Errors
    ///
    /// See [`StoreBuilder::build`].
    pub fn new(config: StrataConfig) -> Result<Self, StoreError> {
        Self::builder(config).build()
    }

    /// Starts a builder for attaching runtime hooks.
    #[must_use]
    pub fn builder(config: StrataConfig) -> StoreBuilder {
        StoreBuilder {
            config,
            error_handler: None,
            job_queue: None,
            task_wrapper: None,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Reads the value stored under `key`.
    ///
    /// Returns `None` on a miss, an expired entry (which is deleted as a
    /// side effect), or a transient storage fault.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_with(key, &ReadOptions::default())
    }

    /// Like [`read`](Self::read), with a version expectation.
    pub fn read_with(
        &self,
        key: &str,
        options: &ReadOptions,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let normalized = self.normalize(key);
        self.reading_key(&normalized, FailsafeTag::ReadEntry, None, |shard| {
            let rows = self.repository.read_multi(shard, &[&normalized])?;
            for (key_bytes, value) in rows {
                if key_bytes != normalized.bytes() {
                    // 64-bit 碰撞：回傳的 key 不是請求的 key，當作 miss。
                    continue;
                }
                return Ok(self.accept_entry(shard, &normalized, &value, options));
            }
            Ok(None)
        })
    }

    /// Reads many keys at once, grouping the selects by shard.
    ///
    /// The result maps each *found* original key to its value; misses,
    /// expired entries, version mismatches and undecodable entries are
    /// absent. A shard-level transient fault drops that shard's subset.
    pub fn read_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        self.read_multi_with(keys, &ReadOptions::default())
    }

    /// Like [`read_multi`](Self::read_multi), with a version expectation.
    pub fn read_multi_with(
        &self,
        keys: &[&str],
        options: &ReadOptions,
    ) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let normalized: Vec<NormalizedKey> =
            keys.iter().map(|key| self.normalize(key)).collect();
        let requested: HashMap<&[u8], (&NormalizedKey, &str)> = normalized
            .iter()
            .zip(keys)
            .map(|(norm, original)| (norm.bytes(), (norm, *original)))
            .collect();

        let mut results = HashMap::new();
        for (shard, subset) in self.dispatcher.assign(&normalized) {
            let found = self.failsafe.run(FailsafeTag::ReadEntries, Vec::new(), || {
                self.repository.read_multi(&shard, &subset)
            })?;

            let mut expired: Vec<&NormalizedKey> = Vec::new();
            for (key_bytes, value) in found {
                let Some(&(norm, original)) = requested.get(key_bytes.as_slice()) else {
                    continue;
                };
                match CacheEntry::decode(&value) {
                    Err(err) => {
                        debug!(error = %err, "undecodable entry dropped from multi-read");
                    }
                    Ok(entry) if entry.is_expired() => expired.push(norm),
                    Ok(entry) if entry.mismatched(options.version.as_deref()) => {}
                    Ok(entry) => {
                        results.insert(original.to_string(), entry.into_value());
                    }
                }
            }

            if !expired.is_empty() {
                let _ = self.failsafe.run(FailsafeTag::DeleteEntries, 0, || {
                    self.repository.delete_by_keys(&shard, &expired)
                });
            }
        }
        Ok(results)
    }

    /// Reads `key`, or computes, stores and returns the value on a miss.
    pub fn fetch<F>(
        &self,
        key: &str,
        options: &WriteOptions,
        compute: F,
    ) -> Result<Vec<u8>, StoreError>
    where
        F: FnOnce() -> Vec<u8>,
    {
        let read_options = ReadOptions {
            version: options.version.clone(),
        };
        if let Some(value) = self.read_with(key, &read_options)? {
            return Ok(value);
        }
        let value = compute();
        self.write_with(key, &value, options)?;
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Writes `value` under `key`. Returns `false` when the write was
    /// skipped (`unless_exist` against a live entry, or a transient fault).
    pub fn write(&self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        self.write_with(key, value, &WriteOptions::default())
    }

    /// Like [`write`](Self::write), with options.
    pub fn write_with(
        &self,
        key: &str,
        value: &[u8],
        options: &WriteOptions,
    ) -> Result<bool, StoreError> {
        let normalized = self.normalize(key);
        let encoded = encode_entry(value, options);

        if options.unless_exist {
            return self.writing_key(&normalized, FailsafeTag::WriteEntry, false, |shard| {
                let written = self.repository.lock_and_write(shard, &normalized, |current| {
                    let live = current
                        .and_then(|bytes| CacheEntry::decode(bytes).ok())
                        .is_some_and(|entry| !entry.is_expired());
                    if live {
                        None
                    } else {
                        Some(encoded.clone())
                    }
                })?;
                let wrote = written.is_some();
                if wrote {
                    self.track_writes(1, shard);
                }
                Ok(wrote)
            });
        }

        let row = [(normalized, encoded)];
        self.writing_key(&row[0].0, FailsafeTag::WriteEntry, false, |shard| {
            self.repository.write_multi(shard, &row)?;
            self.track_writes(1, shard);
            Ok(true)
        })
    }

    /// Writes many pairs at once, one upsert batch per shard. Returns the
    /// number of rows written; a shard-level transient fault drops that
    /// shard's batch (multi-writes are not atomic across shards).
    pub fn write_multi(&self, pairs: &[(&str, &[u8])]) -> Result<usize, StoreError> {
        self.write_multi_with(pairs, &WriteOptions::default())
    }

    /// Like [`write_multi`](Self::write_multi), with options.
    pub fn write_multi_with(
        &self,
        pairs: &[(&str, &[u8])],
        options: &WriteOptions,
    ) -> Result<usize, StoreError> {
        if options.unless_exist {
            // 條件寫入需要逐 key 上鎖，走單鍵路徑。
            let mut written = 0;
            for (key, value) in pairs {
                if self.write_with(key, value, options)? {
                    written += 1;
                }
            }
            return Ok(written);
        }

        let mut groups: BTreeMap<String, Vec<(NormalizedKey, Vec<u8>)>> = BTreeMap::new();
        for (key, value) in pairs {
            let normalized = self.normalize(key);
            let shard = self.dispatcher.shard_for(&normalized).name().to_string();
            groups
                .entry(shard)
                .or_default()
                .push((normalized, encode_entry(value, options)));
        }

        let mut written = 0;
        for (name, rows) in groups {
            written += self.failsafe.run(FailsafeTag::WriteEntries, 0, || {
                self.dispatcher.with(&name, |shard| {
                    let count = self.repository.write_multi(shard, &rows)?;
                    self.track_writes(count, shard);
                    Ok(count)
                })
            })?;
        }
        Ok(written)
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Atomically adds `amount` to the integer stored under `key`,
    /// initializing at zero. Returns the new value, or `None` on a
    /// transient fault.
    pub fn increment(&self, key: &str, amount: i64) -> Result<Option<i64>, StoreError> {
        self.mutate_counter(key, amount, FailsafeTag::Increment)
    }

    /// Atomically subtracts `amount` from the integer stored under `key`.
    pub fn decrement(&self, key: &str, amount: i64) -> Result<Option<i64>, StoreError> {
        self.mutate_counter(key, -amount, FailsafeTag::Decrement)
    }

    fn mutate_counter(
        &self,
        key: &str,
        amount: i64,
        tag: FailsafeTag,
    ) -> Result<Option<i64>, StoreError> {
        let normalized = self.normalize(key);
        self.writing_key(&normalized, tag, None, |shard| {
            let mut new_value = None;
            self.repository.lock_and_write(shard, &normalized, |current| {
                let (old, expires_at, version) = match current {
                    Some(bytes) => match CacheEntry::decode(bytes) {
                        Ok(entry) if !entry.is_expired() => (
                            entry.value_as_int().unwrap_or(0),
                            entry.expires_at(),
                            entry.version().map(str::to_string),
                        ),
                        Ok(_) => (0, None, None),
                        // 框架之外寫進來的裸值：當作 ASCII 整數解析。
                        Err(_) => (raw_integer_parse(bytes).unwrap_or(0), None, None),
                    },
                    None => (0, None, None),
                };

                let next = old.saturating_add(amount);
                new_value = Some(next);

                let mut entry = CacheEntry::new(next.to_string().into_bytes());
                if let Some(at) = expires_at {
                    entry = entry.with_expires_at(at);
                }
                if let Some(version) = version {
                    entry = entry.with_version(version);
                }
                Some(entry.encode())
            })?;

            if new_value.is_some() {
                self.track_writes(1, shard);
            }
            Ok(new_value)
        })
    }

    // -----------------------------------------------------------------------
    // Deletes
    // -----------------------------------------------------------------------

    /// Deletes `key`. Returns whether a row was removed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let normalized = self.normalize(key);
        self.writing_key(&normalized, FailsafeTag::DeleteEntry, false, |shard| {
            Ok(self.repository.delete_by_keys(shard, &[&normalized])? > 0)
        })
    }

    /// Deletes many keys, grouping by shard. Returns rows removed.
    pub fn delete_multi(&self, keys: &[&str]) -> Result<usize, StoreError> {
        let normalized: Vec<NormalizedKey> =
            keys.iter().map(|key| self.normalize(key)).collect();
        let mut deleted = 0;
        for (shard, subset) in self.dispatcher.assign(&normalized) {
            deleted += self.failsafe.run(FailsafeTag::DeleteEntries, 0, || {
                self.repository.delete_by_keys(&shard, &subset)
            })?;
        }
        Ok(deleted)
    }

    /// Empties every shard, by truncate or batched delete per
    /// configuration.
    pub fn clear(&self) -> Result<(), StoreError> {
        let clear_with = self.clear_with;
        self.writing_all(FailsafeTag::Clear, (), |shard| match clear_with {
            ClearWith::Truncate => self.repository.clear_truncate(shard),
            ClearWith::Delete => self.repository.clear_delete(shard, MAX_BATCH).map(|_| ()),
        })
    }

    /// Sweeping expired entries eagerly is unsupported; expiry is enforced
    /// on read and by the background evictor.
    ///
    /// # Errors
    ///
    /// Always returns [`StoreError::UnsupportedOperation`].
    pub fn cleanup(&self) -> Result<(), StoreError> {
        Err(StoreError::UnsupportedOperation("cleanup"))
    }

    // -----------------------------------------------------------------------
    // Introspection and background work
    // -----------------------------------------------------------------------

    /// The shard name responsible for `key` under the current routing
    /// strategy.
    #[must_use]
    pub fn shard_for(&self, key: &str) -> &str {
        self.dispatcher.shard_for(&self.normalize(key)).name()
    }

    /// Shard names, sorted.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.dispatcher.shard_names()
    }

    /// Runs one eviction batch against the named shard. This is the entry
    /// point for host job runners executing an [`EvictionJob`].
    pub fn run_eviction(&self, shard: &str) -> Result<usize, StoreError> {
        self.dispatcher.with(shard, |shard| {
            self.expiry.evict(&self.repository, shard, &self.estimator)
        })
    }

    /// Blocks until queued background eviction batches have run. Intended
    /// for shutdown and tests.
    pub fn drain_background_tasks(&self) {
        self.executor.join();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn normalize(&self, key: &str) -> NormalizedKey {
        NormalizedKey::new(key, self.max_key_bytesize)
    }

    /// Routes one key and runs `f` against its shard inside the failsafe.
    fn reading_key<T, F>(
        &self,
        key: &NormalizedKey,
        tag: FailsafeTag,
        default: T,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: std::fmt::Debug,
        F: FnOnce(&Arc<Shard>) -> Result<T, StoreError>,
    {
        self.failsafe
            .run(tag, default, || self.dispatcher.with_connection_for(key, f))
    }

    /// Same routing as [`reading_key`](Self::reading_key); named separately
    /// because write-path callers also schedule expiry work inside `f`.
    fn writing_key<T, F>(
        &self,
        key: &NormalizedKey,
        tag: FailsafeTag,
        default: T,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: std::fmt::Debug,
        F: FnOnce(&Arc<Shard>) -> Result<T, StoreError>,
    {
        self.failsafe
            .run(tag, default, || self.dispatcher.with_connection_for(key, f))
    }

    /// Fans `f` out to every shard, each call failsafe-wrapped, and
    /// returns the first shard's result.
    fn writing_all<T, F>(&self, tag: FailsafeTag, default: T, f: F) -> Result<T, StoreError>
    where
        T: std::fmt::Debug + Clone,
        F: Fn(&Arc<Shard>) -> Result<T, StoreError>,
    {
        let mut first: Option<T> = None;
        self.dispatcher.with_each(|shard| {
            let result = self.failsafe.run(tag, default.clone(), || f(shard))?;
            if first.is_none() {
                first = Some(result);
            }
            Ok(())
        })?;
        Ok(first.unwrap_or(default))
    }

    /// Decodes a stored value and applies the read-path filters. Expired
    /// entries are deleted as a side effect; a failed side-effect delete
    /// does not disturb the read result.
    fn accept_entry(
        &self,
        shard: &Shard,
        key: &NormalizedKey,
        stored: &[u8],
        options: &ReadOptions,
    ) -> Option<Vec<u8>> {
        match CacheEntry::decode(stored) {
            Err(err) => {
                debug!(error = %err, "undecodable entry dropped");
                None
            }
            Ok(entry) if entry.is_expired() => {
                if let Err(err) = self.repository.delete_by_keys(shard, &[key]) {
                    debug!(error = %err, "expired entry delete failed");
                }
                None
            }
            Ok(entry) if entry.mismatched(options.version.as_deref()) => None,
            Ok(entry) => Some(entry.into_value()),
        }
    }

    /// After `count` rows were written to `shard`, schedules the matching
    /// number of eviction batches.
    fn track_writes(&self, count: usize, shard: &Arc<Shard>) {
        for _ in 0..self.expiry.batches_for(count) {
            self.schedule_eviction(shard);
        }
    }

    fn schedule_eviction(&self, shard: &Arc<Shard>) {
        match self.expiry.method() {
            ExpiryMethod::Thread => {
                let repository = self.repository;
                let expiry = self.expiry.clone();
                let estimator = self.estimator;
                // Shard 在排程當下捕捉，任務在別的執行緒跑也不會跑錯庫。
                let shard = Arc::clone(shard);
                self.executor.submit("evict", move || {
                    expiry.evict(&repository, &shard, &estimator).map(|_| ())
                });
            }
            ExpiryMethod::Job => {
                let Some(ref queue) = self.job_queue else {
                    debug!("expiry method is job but no job queue is attached");
                    return;
                };
                let job = EvictionJob {
                    shard: shard.name().to_string(),
                    batch_size: self.expiry.batch_size(),
                    queue: self.expiry.queue().map(str::to_string),
                };
                if let Err(err) = queue.enqueue(job) {
                    warn!(error = %err, "failed to enqueue eviction job");
                }
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("shards", &self.dispatcher.shard_names())
            .field("clear_with", &self.clear_with)
            .field("max_key_bytesize", &self.max_key_bytesize)
            .field("job_queue", &self.job_queue.is_some())
            .finish()
    }
}

/// Encodes a caller value plus write options into the stored frame.
fn encode_entry(value: &[u8], options: &WriteOptions) -> Vec<u8> {
    let mut entry = CacheEntry::new(value.to_vec());
    if let Some(expires_in) = options.expires_in {
        entry = entry.with_expires_in(expires_in);
    }
    if let Some(ref version) = options.version {
        entry = entry.with_version(version.clone());
    }
    entry.encode()
}

/// Fallback integer parse for values written outside the entry framing.
fn raw_integer_parse(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
