//! Metadata kept for objects written into the internal store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One uploaded part of a multipart object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// Part number (1-based).
    pub part_number: u32,

    /// Size in bytes.
    pub size: i64,

    /// When this part landed.
    pub last_modified: DateTime<Utc>,

    /// ETag-equivalent returned by the backend for this part.
    pub etag: String,
}

/// Metadata for a single object, addressed by bucket and key.
///
/// The payload itself lives in a storage backend; this record is what the
/// service knows about it. Multipart objects carry their ordered part list
/// so a later upload session can keep appending to it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Owning bucket.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Storage backend holding the payload.
    pub backend: String,

    /// Size in bytes; the sum of all parts for multipart objects.
    pub size: i64,

    /// Timestamp when the object was last modified.
    pub last_modified: DateTime<Utc>,

    /// ETag of a whole-object upload; `None` for multipart objects.
    pub etag: Option<String>,

    /// Parts in the order they were recorded.
    pub parts: Vec<PartRecord>,
}

impl ObjectRecord {
    /// Record for an object written in a single upload.
    pub fn whole(
        bucket: impl Into<String>,
        key: impl Into<String>,
        backend: impl Into<String>,
        size: i64,
        etag: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            backend: backend.into(),
            size,
            last_modified: Utc::now(),
            etag,
            parts: Vec::new(),
        }
    }

    /// Record created by the first part of a multipart session.
    pub fn seeded(
        bucket: impl Into<String>,
        key: impl Into<String>,
        backend: impl Into<String>,
        part: PartRecord,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            backend: backend.into(),
            size: part.size,
            last_modified: part.last_modified,
            etag: None,
            parts: vec![part],
        }
    }

    /// Fold one more uploaded part into the record.
    pub fn append_part(&mut self, part: PartRecord) {
        self.size += part.size;
        self.last_modified = part.last_modified;
        self.parts.push(part);
    }
}
