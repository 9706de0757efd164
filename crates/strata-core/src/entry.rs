//! In-transit cache entry wrapper.
//!
//! The `value` column of the `entries` table holds an encoded [`CacheEntry`]:
//! the caller's payload bytes plus the metadata the read path filters on
//! (expiry time, version tag). The engine round-trips the payload byte-exact,
//! so the encoding is a small hand-rolled frame rather than a generic
//! serializer.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [0]      format tag (0x01)
//! [1]      flags: bit0 = expires_at present, bit1 = version present
//! [..8]    expires_at as epoch milliseconds (i64), if flagged
//! [..2+n]  version length (u16) + version bytes, if flagged
//! [rest]   payload bytes
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::CoreError;

const FORMAT_TAG: u8 = 0x01;
const FLAG_EXPIRES_AT: u8 = 0b0000_0001;
const FLAG_VERSION: u8 = 0b0000_0010;

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A cache entry in transit between the API surface and the `entries` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<i64>,
    version: Option<String>,
}

impl CacheEntry {
    /// Creates an entry holding `value` with no expiry and no version tag.
    #[must_use]
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            expires_at: None,
            version: None,
        }
    }

    /// Sets an absolute expiry time in epoch milliseconds.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets an expiry relative to now.
    #[must_use]
    pub fn with_expires_in(self, expires_in: Duration) -> Self {
        let at = epoch_millis(SystemTime::now()) + expires_in.as_millis() as i64;
        self.with_expires_at(at)
    }

    /// Sets the version tag.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The payload bytes.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consumes the entry, returning the payload bytes.
    #[must_use]
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Absolute expiry time in epoch milliseconds, if any.
    #[must_use]
    pub const fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    /// The version tag, if any.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns `true` if the entry's expiry time has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= epoch_millis(SystemTime::now()),
            None => false,
        }
    }

    /// Returns `true` if the entry's version disagrees with the requested
    /// version. Only a disagreement between two *present* versions counts;
    /// an untagged entry matches any request.
    #[must_use]
    pub fn mismatched(&self, requested: Option<&str>) -> bool {
        matches!((self.version.as_deref(), requested), (Some(v), Some(r)) if v != r)
    }

    /// Parses the payload as an ASCII decimal integer, as written by
    /// `increment`/`decrement`.
    #[must_use]
    pub fn value_as_int(&self) -> Option<i64> {
        std::str::from_utf8(&self.value).ok()?.trim().parse().ok()
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    /// Encodes the entry to its stored byte form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.expires_at.is_some() {
            flags |= FLAG_EXPIRES_AT;
        }
        if self.version.is_some() {
            flags |= FLAG_VERSION;
        }

        let version_len = self.version.as_ref().map_or(0, String::len);
        let mut out = Vec::with_capacity(2 + 8 + 2 + version_len + self.value.len());
        out.push(FORMAT_TAG);
        out.push(flags);
        if let Some(at) = self.expires_at {
            out.extend_from_slice(&at.to_be_bytes());
        }
        if let Some(ref version) = self.version {
            out.extend_from_slice(&(version.len() as u16).to_be_bytes());
            out.extend_from_slice(version.as_bytes());
        }
        out.extend_from_slice(&self.value);
        out
    }

    /// Decodes an entry from its stored byte form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryDecode`] on an unknown format tag or a
    /// truncated frame. Callers on the read path treat this as a droppable
    /// entry, not a fatal fault.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let tag = cursor.take_u8()?;
        if tag != FORMAT_TAG {
            return Err(CoreError::EntryDecode(format!(
                "unknown entry format tag {tag:#04x}"
            )));
        }
        let flags = cursor.take_u8()?;

        let expires_at = if flags & FLAG_EXPIRES_AT != 0 {
            Some(i64::from_be_bytes(cursor.take_array::<8>()?))
        } else {
            None
        };

        let version = if flags & FLAG_VERSION != 0 {
            let len = u16::from_be_bytes(cursor.take_array::<2>()?) as usize;
            let raw = cursor.take(len)?;
            Some(
                String::from_utf8(raw.to_vec())
                    .map_err(|e| CoreError::EntryDecode(format!("version not UTF-8: {e}")))?,
            )
        } else {
            None
        };

        Ok(Self {
            value: cursor.rest().to_vec(),
            expires_at,
            version,
        })
    }
}

/// Converts a `SystemTime` to epoch milliseconds (0 for pre-epoch times).
#[must_use]
pub fn epoch_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Minimal bounds-checked reader over the encoded frame.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(CoreError::EntryDecode(format!(
                "truncated entry: wanted {n} bytes at offset {}",
                self.pos
            ))),
        }
    }

    fn take_u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CoreError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
