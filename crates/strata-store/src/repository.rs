//! All SQL against the `entries` table.
//!
//! One row per key hash. The repository never routes: callers hand it the
//! [`Shard`] to operate on. Reads go through the connection's prepared
//! statement cache so each (operation, batch size) pair is planned once;
//! writes use one multi-row upsert per batch and bypass statement caching.

use std::ops::RangeInclusive;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, TransactionBehavior};
use strata_core::NormalizedKey;
use tracing::debug;

use crate::dispatcher::Shard;
use crate::StoreError;

/// Upper bound on rows touched by one SQL statement. Larger multi-reads and
/// multi-writes are chunked.
pub const MAX_BATCH: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash   INTEGER NOT NULL,
    key        BLOB NOT NULL,
    value      BLOB NOT NULL,
    byte_size  INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_key_hash ON entries (key_hash);
CREATE INDEX IF NOT EXISTS idx_entries_byte_size ON entries (byte_size);
";

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Executes the cache engine's SQL. Stateless apart from two settings, so
/// background tasks clone it freely.
#[derive(Debug, Clone, Copy)]
pub struct Repository {
    instrumentation: bool,
    row_overhead: u64,
}

impl Repository {
    /// Creates a repository.
    ///
    /// `row_overhead` is the constant added to `key.len() + value.len()`
    /// when declaring a row's `byte_size`; it differs when the storage
    /// layer encrypts values.
    #[must_use]
    pub fn new(instrumentation: bool, row_overhead: u64) -> Self {
        Self {
            instrumentation,
            row_overhead,
        }
    }

    /// Creates the `entries` schema on a shard and sizes its statement
    /// cache for the per-batch-size read templates.
    pub fn migrate(&self, shard: &Shard) -> Result<(), StoreError> {
        shard.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            conn.set_prepared_statement_cache_capacity(128);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Upserts the given `(key, encoded value)` pairs, in chunks of
    /// [`MAX_BATCH`]. On a `key_hash` conflict the row's key, value, size
    /// and creation time are replaced.
    pub fn write_multi(
        &self,
        shard: &Shard,
        rows: &[(NormalizedKey, Vec<u8>)],
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // 同一批內重複的 key 只保留最後一筆；單一 upsert 語句不能更新
        // 同一列兩次。
        let mut latest: std::collections::BTreeMap<i64, &(NormalizedKey, Vec<u8>)> =
            std::collections::BTreeMap::new();
        for row in rows {
            latest.insert(row.0.hash(), row);
        }
        let deduped: Vec<&(NormalizedKey, Vec<u8>)> = latest.into_values().collect();

        let now = now_secs();
        shard.with_conn(|conn| {
            for chunk in deduped.chunks(MAX_BATCH) {
                let sql = upsert_sql(chunk.len());
                let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 5);
                for row in chunk {
                    let (key, value) = (&row.0, &row.1);
                    values.push(Value::Integer(key.hash()));
                    values.push(Value::Blob(key.bytes().to_vec()));
                    values.push(Value::Blob(value.clone()));
                    values.push(Value::Integer(self.byte_size(key, value)));
                    values.push(Value::Integer(now));
                }
                // Plain prepare: write statements stay out of the cache.
                let mut stmt = conn.prepare(&sql)?;
                stmt.execute(params_from_iter(values))?;
            }
            if self.instrumentation {
                debug!(shard = shard.name(), rows = deduped.len(), "entries upserted");
            }
            Ok(deduped.len())
        })
    }

    /// Reads the stored `(key, value)` pairs for the given keys, in chunks
    /// of [`MAX_BATCH`].
    ///
    /// The result is keyed by the *returned* key bytes; on a 64-bit hash
    /// collision the returned key differs from the requested one and the
    /// caller filters it out.
    pub fn read_multi(
        &self,
        shard: &Shard,
        keys: &[&NormalizedKey],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        shard.with_conn(|conn| {
            let mut out = Vec::with_capacity(keys.len());
            for chunk in keys.chunks(MAX_BATCH) {
                // prepare_cached 以 SQL 字串為 key，等於每個 batch size 各快取一份模板。
                let sql = format!(
                    "SELECT key, value FROM entries WHERE key_hash IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let hashes: Vec<Value> =
                    chunk.iter().map(|k| Value::Integer(k.hash())).collect();
                let rows = stmt.query_map(params_from_iter(hashes), |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            if self.instrumentation {
                debug!(
                    shard = shard.name(),
                    requested = keys.len(),
                    found = out.len(),
                    "entries read"
                );
            }
            Ok(out)
        })
    }

    /// Deletes rows by key, returning the affected row count.
    pub fn delete_by_keys(
        &self,
        shard: &Shard,
        keys: &[&NormalizedKey],
    ) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        shard.with_conn(|conn| {
            let mut deleted = 0;
            for chunk in keys.chunks(MAX_BATCH) {
                let sql = format!(
                    "DELETE FROM entries WHERE key_hash IN ({})",
                    placeholders(chunk.len())
                );
                let hashes: Vec<Value> =
                    chunk.iter().map(|k| Value::Integer(k.hash())).collect();
                deleted += conn.execute(&sql, params_from_iter(hashes))?;
            }
            if self.instrumentation {
                debug!(shard = shard.name(), deleted, "entries deleted");
            }
            Ok(deleted)
        })
    }

    /// Empties the table in one statement, letting the backend take its
    /// truncate fast path. `AUTOINCREMENT` keeps ids from being reused
    /// afterwards, so the id-as-insertion-order invariant survives a clear.
    pub fn clear_truncate(&self, shard: &Shard) -> Result<(), StoreError> {
        shard.with_conn(|conn| {
            conn.execute("DELETE FROM entries", [])?;
            Ok(())
        })
    }

    /// Empties the table in bounded batches; safe where a truncate is not
    /// (transactional test harnesses).
    pub fn clear_delete(&self, shard: &Shard, batch: usize) -> Result<usize, StoreError> {
        shard.with_conn(|conn| {
            let mut total = 0;
            loop {
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE id IN (SELECT id FROM entries LIMIT ?1)",
                    params![batch as i64],
                )?;
                total += deleted;
                if deleted == 0 {
                    break;
                }
            }
            Ok(total)
        })
    }

    /// Read-modify-write under a row lock.
    ///
    /// Opens an immediate transaction (this backend's equivalent of
    /// `SELECT ... FOR UPDATE`), reads the current value, and passes it to
    /// `f`. A stored row whose key disagrees with the requested key is a
    /// 64-bit hash collision and is presented as "no existing value"; a
    /// subsequent write overwrites the collided row. If `f` returns a new
    /// value it is upserted before the transaction commits.
    ///
    /// Returns the new value, or `None` when `f` declined to write.
    pub fn lock_and_write<F>(
        &self,
        shard: &Shard,
        key: &NormalizedKey,
        f: F,
    ) -> Result<Option<Vec<u8>>, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Option<Vec<u8>>,
    {
        shard.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(Vec<u8>, Vec<u8>)> = tx
                .query_row(
                    "SELECT key, value FROM entries WHERE key_hash = ?1",
                    params![key.hash()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let current = match &row {
                Some((stored_key, value)) if stored_key == key.bytes() => Some(value.as_slice()),
                _ => None,
            };

            let new_value = f(current);
            if let Some(ref value) = new_value {
                tx.execute(
                    &upsert_sql(1),
                    params![
                        key.hash(),
                        key.bytes(),
                        value,
                        self.byte_size(key, value),
                        now_secs()
                    ],
                )?;
            }
            tx.commit()?;
            Ok(new_value)
        })
    }

    // -----------------------------------------------------------------------
    // Counting and estimation helpers
    // -----------------------------------------------------------------------

    /// `MAX(id) − MIN(id) + 1`: a cheap upper bound on the row count. It
    /// overestimates after deletes, which the callers tolerate.
    pub fn id_range(&self, shard: &Shard) -> Result<u64, StoreError> {
        shard.with_conn(|conn| {
            let range: Option<i64> = conn.query_row(
                "SELECT MAX(id) - MIN(id) + 1 FROM entries",
                [],
                |row| row.get(0),
            )?;
            Ok(range.unwrap_or(0).max(0) as u64)
        })
    }

    /// The `n` largest row sizes, descending.
    pub fn largest_byte_sizes(&self, shard: &Shard, n: usize) -> Result<Vec<i64>, StoreError> {
        shard.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT byte_size FROM entries ORDER BY byte_size DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![n as i64], |row| row.get(0))?;
            let mut out = Vec::with_capacity(n);
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Total declared byte size of rows whose `key_hash` falls in `range`.
    pub fn in_key_hash_range(
        &self,
        shard: &Shard,
        range: RangeInclusive<i64>,
    ) -> Result<i64, StoreError> {
        shard.with_conn(|conn| {
            let sum: Option<i64> = conn.query_row(
                "SELECT SUM(byte_size) FROM entries WHERE key_hash BETWEEN ?1 AND ?2",
                params![range.start(), range.end()],
                |row| row.get(0),
            )?;
            Ok(sum.unwrap_or(0))
        })
    }

    /// Like [`in_key_hash_range`](Self::in_key_hash_range), but only counts
    /// rows at or below the size cutoff.
    pub fn up_to_byte_size(
        &self,
        shard: &Shard,
        range: RangeInclusive<i64>,
        cutoff: i64,
    ) -> Result<i64, StoreError> {
        shard.with_conn(|conn| {
            let sum: Option<i64> = conn.query_row(
                "SELECT SUM(byte_size) FROM entries \
                 WHERE key_hash BETWEEN ?1 AND ?2 AND byte_size <= ?3",
                params![range.start(), range.end(), cutoff],
                |row| row.get(0),
            )?;
            Ok(sum.unwrap_or(0))
        })
    }

    // -----------------------------------------------------------------------
    // Eviction support
    // -----------------------------------------------------------------------

    /// The oldest `limit` rows by id ascending, as `(id, created_at)`.
    pub fn oldest_entries(
        &self,
        shard: &Shard,
        limit: usize,
    ) -> Result<Vec<(i64, i64)>, StoreError> {
        shard.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, created_at FROM entries ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let mut out = Vec::with_capacity(limit);
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Deletes rows by id, returning the affected count.
    pub fn delete_by_ids(&self, shard: &Shard, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        shard.with_conn(|conn| {
            let mut deleted = 0;
            for chunk in ids.chunks(MAX_BATCH) {
                let sql = format!(
                    "DELETE FROM entries WHERE id IN ({})",
                    placeholders(chunk.len())
                );
                let values: Vec<Value> = chunk.iter().map(|&id| Value::Integer(id)).collect();
                deleted += conn.execute(&sql, params_from_iter(values))?;
            }
            Ok(deleted)
        })
    }

    fn byte_size(&self, key: &NormalizedKey, value: &[u8]) -> i64 {
        (key.bytes().len() + value.len()) as i64 + self.row_overhead as i64
    }
}

/// `?,?,...` for an IN list of `n` placeholders.
fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

/// Multi-row upsert keyed on `key_hash`.
fn upsert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT INTO entries (key_hash, key, value, byte_size, created_at) VALUES ",
    );
    for i in 0..rows {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?,?,?,?)");
    }
    sql.push_str(
        " ON CONFLICT(key_hash) DO UPDATE SET \
         key = excluded.key, value = excluded.value, \
         byte_size = excluded.byte_size, created_at = excluded.created_at",
    );
    sql
}

/// Current wall-clock time as unix epoch seconds.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_shard() -> Shard {
        Shard::open(
            "test",
            None,
            Duration::from_millis(200),
            strata_core::config::JournalMode::Wal,
        )
        .unwrap()
    }

    fn repo() -> Repository {
        Repository::new(false, 140)
    }

    fn setup() -> (Repository, Shard) {
        let shard = test_shard();
        let repo = repo();
        repo.migrate(&shard).unwrap();
        (repo, shard)
    }

    fn key(s: &str) -> NormalizedKey {
        NormalizedKey::new(s, 1024)
    }

    fn rows(pairs: &[(&str, &[u8])]) -> Vec<(NormalizedKey, Vec<u8>)> {
        pairs
            .iter()
            .map(|(k, v)| (key(k), v.to_vec()))
            .collect()
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("alpha", b"one"), ("beta", b"two")]))
            .unwrap();

        let ka = key("alpha");
        let found = repo.read_multi(&shard, &[&ka]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, ka.bytes());
        assert_eq!(found[0].1, b"one");
    }

    #[test]
    fn read_missing_returns_empty() {
        let (repo, shard) = setup();
        let k = key("ghost");
        assert!(repo.read_multi(&shard, &[&k]).unwrap().is_empty());
    }

    #[test]
    fn upsert_overwrites_on_conflict() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("k", b"old")])).unwrap();
        repo.write_multi(&shard, &rows(&[("k", b"new")])).unwrap();

        let k = key("k");
        let found = repo.read_multi(&shard, &[&k]).unwrap();
        assert_eq!(found.len(), 1, "one row per key_hash");
        assert_eq!(found[0].1, b"new");
    }

    #[test]
    fn byte_size_includes_overhead() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("sized", b"12345")])).unwrap();

        let expected = ("sized".len() + 5) as i64 + 140;
        let sizes = repo.largest_byte_sizes(&shard, 10).unwrap();
        assert_eq!(sizes, vec![expected]);
    }

    #[test]
    fn delete_by_keys_reports_count() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("a", b"1"), ("b", b"2"), ("c", b"3")]))
            .unwrap();

        let ka = key("a");
        let kb = key("b");
        let kx = key("missing");
        assert_eq!(repo.delete_by_keys(&shard, &[&ka, &kb, &kx]).unwrap(), 2);
        assert_eq!(repo.id_range(&shard).unwrap(), 3, "id range overestimates after deletes");
    }

    #[test]
    fn clear_truncate_empties_table() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("a", b"1"), ("b", b"2")])).unwrap();
        repo.clear_truncate(&shard).unwrap();
        assert_eq!(repo.id_range(&shard).unwrap(), 0);
    }

    #[test]
    fn clear_delete_empties_table_in_batches() {
        let (repo, shard) = setup();
        let many: Vec<(NormalizedKey, Vec<u8>)> =
            (0..25).map(|i| (key(&format!("k{i}")), vec![1])).collect();
        repo.write_multi(&shard, &many).unwrap();

        let deleted = repo.clear_delete(&shard, 10).unwrap();
        assert_eq!(deleted, 25);
        assert_eq!(repo.id_range(&shard).unwrap(), 0);
    }

    #[test]
    fn ids_are_not_reused_after_truncate() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("a", b"1")])).unwrap();
        let before = repo.oldest_entries(&shard, 1).unwrap()[0].0;

        repo.clear_truncate(&shard).unwrap();
        repo.write_multi(&shard, &rows(&[("b", b"2")])).unwrap();
        let after = repo.oldest_entries(&shard, 1).unwrap()[0].0;

        assert!(after > before, "AUTOINCREMENT must not reuse ids");
    }

    #[test]
    fn lock_and_write_sees_current_value() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("n", b"5")])).unwrap();

        let k = key("n");
        let new = repo
            .lock_and_write(&shard, &k, |current| {
                assert_eq!(current, Some(b"5".as_slice()));
                Some(b"6".to_vec())
            })
            .unwrap();
        assert_eq!(new.as_deref(), Some(b"6".as_slice()));

        let found = repo.read_multi(&shard, &[&k]).unwrap();
        assert_eq!(found[0].1, b"6");
    }

    #[test]
    fn lock_and_write_declining_leaves_row_alone() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("keep", b"v")])).unwrap();

        let k = key("keep");
        let result = repo.lock_and_write(&shard, &k, |_| None).unwrap();
        assert!(result.is_none());

        let found = repo.read_multi(&shard, &[&k]).unwrap();
        assert_eq!(found[0].1, b"v");
    }

    #[test]
    fn lock_and_write_missing_row_sees_none() {
        let (repo, shard) = setup();
        let k = key("new");
        let new = repo
            .lock_and_write(&shard, &k, |current| {
                assert!(current.is_none());
                Some(b"created".to_vec())
            })
            .unwrap();
        assert_eq!(new.as_deref(), Some(b"created".as_slice()));
    }

    #[test]
    fn lock_and_write_treats_collision_as_missing() {
        let (repo, shard) = setup();
        let k = key("wanted");

        // 直接塞一列 key_hash 相同但 key 不同的資料，模擬 64-bit 碰撞。
        shard
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO entries (key_hash, key, value, byte_size, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![k.hash(), b"other".as_slice(), b"theirs".as_slice(), 150, now_secs()],
                )?;
                Ok(())
            })
            .unwrap();

        let new = repo
            .lock_and_write(&shard, &k, |current| {
                assert!(current.is_none(), "collided row must read as missing");
                Some(b"mine".to_vec())
            })
            .unwrap();
        assert_eq!(new.as_deref(), Some(b"mine".as_slice()));

        // 碰撞列被覆寫，現在儲存的是請求的 key。
        let found = repo.read_multi(&shard, &[&k]).unwrap();
        assert_eq!(found[0].0, k.bytes());
        assert_eq!(found[0].1, b"mine");
    }

    #[test]
    fn oldest_entries_orders_by_id() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("first", b"1")])).unwrap();
        repo.write_multi(&shard, &rows(&[("second", b"2")])).unwrap();
        repo.write_multi(&shard, &rows(&[("third", b"3")])).unwrap();

        let oldest = repo.oldest_entries(&shard, 2).unwrap();
        assert_eq!(oldest.len(), 2);
        assert!(oldest[0].0 < oldest[1].0);
    }

    #[test]
    fn delete_by_ids_removes_rows() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("a", b"1"), ("b", b"2"), ("c", b"3")]))
            .unwrap();
        let ids: Vec<i64> = repo
            .oldest_entries(&shard, 2)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(repo.delete_by_ids(&shard, &ids).unwrap(), 2);
    }

    #[test]
    fn size_helpers_cover_full_range() {
        let (repo, shard) = setup();
        repo.write_multi(&shard, &rows(&[("a", b"xx"), ("b", b"yyyy")])).unwrap();

        let total = repo
            .in_key_hash_range(&shard, i64::MIN..=i64::MAX)
            .unwrap();
        let sizes = repo.largest_byte_sizes(&shard, 10).unwrap();
        assert_eq!(total, sizes.iter().sum::<i64>());

        // cutoff 低於最小列時，範圍內總和應為 0。
        let smallest = *sizes.last().unwrap();
        let below = repo
            .up_to_byte_size(&shard, i64::MIN..=i64::MAX, smallest - 1)
            .unwrap();
        assert_eq!(below, 0);
    }

    #[test]
    fn empty_batches_are_noops() {
        let (repo, shard) = setup();
        assert_eq!(repo.write_multi(&shard, &[]).unwrap(), 0);
        assert!(repo.read_multi(&shard, &[]).unwrap().is_empty());
        assert_eq!(repo.delete_by_keys(&shard, &[]).unwrap(), 0);
        assert_eq!(repo.delete_by_ids(&shard, &[]).unwrap(), 0);
    }

    #[test]
    fn duplicate_keys_in_one_batch_keep_the_last_value() {
        let (repo, shard) = setup();
        let written = repo
            .write_multi(&shard, &rows(&[("dup", b"first"), ("dup", b"last")]))
            .unwrap();
        assert_eq!(written, 1);

        let k = key("dup");
        let found = repo.read_multi(&shard, &[&k]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, b"last");
    }

    #[test]
    fn large_write_is_chunked() {
        let (repo, shard) = setup();
        let many: Vec<(NormalizedKey, Vec<u8>)> = (0..MAX_BATCH + 50)
            .map(|i| (key(&format!("bulk{i}")), vec![i as u8]))
            .collect();
        assert_eq!(repo.write_multi(&shard, &many).unwrap(), MAX_BATCH + 50);
        assert_eq!(repo.id_range(&shard).unwrap() as usize, MAX_BATCH + 50);
    }
}
