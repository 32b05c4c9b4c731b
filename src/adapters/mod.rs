//! Per-provider implementations of the transfer contract.
//!
//! Every backend speaks the same capability set: whole-object download and
//! upload, ranged download, delete, listing, and a multipart sub-protocol
//! (init, upload part, complete, abort). The mover only ever sees
//! `dyn StorageAdapter`; `AdapterRegistry` picks the implementation from the
//! connector's storage type.

pub mod local;
pub mod s3;

use crate::models::{
    connector::{CONF_BUCKET_NAME, StorageType},
    message::WireConnector,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, fmt, io, path::PathBuf, sync::Arc};
use thiserror::Error;

pub use local::LocalAdapter;
pub use s3::S3Adapter;

/// Connector configuration keys understood by external adapters.
pub const CONF_ENDPOINT: &str = "endpoint";
pub const CONF_ACCESS: &str = "access";
pub const CONF_SECURITY: &str = "security";
pub const CONF_REGION: &str = "region";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucket { name: String, reason: String },
    #[error("no adapter for storage type `{0}`")]
    UnsupportedBackend(StorageType),
    #[error("connector is missing `{0}`")]
    MissingConfig(&'static str),
    #[error("multipart upload `{0}` is unknown or already finished")]
    UnknownUpload(String),
    #[error("part {0} was never uploaded")]
    MissingPart(u32),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Fully resolved address of a bucket on some backend.
#[derive(Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub storage_type: StorageType,
    pub bucket_name: String,
    pub endpoint: Option<String>,
    pub access: Option<String>,
    pub security: Option<String>,
    pub region: Option<String>,
}

impl LocationInfo {
    pub fn internal(bucket: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Internal,
            bucket_name: bucket.into(),
            endpoint: None,
            access: None,
            security: None,
            region: None,
        }
    }

    pub fn from_wire(conn: &WireConnector) -> AdapterResult<Self> {
        if !conn.stor_type.is_supported() {
            return Err(AdapterError::UnsupportedBackend(conn.stor_type));
        }
        if conn.stor_type == StorageType::Internal {
            if conn.bucket_name.is_empty() {
                return Err(AdapterError::MissingConfig("bucketName"));
            }
            return Ok(Self::internal(&conn.bucket_name));
        }

        let owned = |key: &str| conn.config(key).map(str::to_string);
        Ok(Self {
            storage_type: conn.stor_type,
            bucket_name: owned(CONF_BUCKET_NAME).ok_or(AdapterError::MissingConfig(CONF_BUCKET_NAME))?,
            endpoint: owned(CONF_ENDPOINT),
            access: owned(CONF_ACCESS),
            security: owned(CONF_SECURITY),
            region: owned(CONF_REGION),
        })
    }
}

impl fmt::Debug for LocationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationInfo")
            .field("storage_type", &self.storage_type)
            .field("bucket_name", &self.bucket_name)
            .field("endpoint", &self.endpoint)
            .field("access", &self.access)
            .field("security", &self.security.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// One object as reported by a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Provider-side handle of an open multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    pub upload_id: String,
}

/// A part the provider accepted, as it must be named on completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Objects in the bucket whose key starts with `prefix`.
    async fn list(&self, location: &LocationInfo, prefix: &str) -> AdapterResult<Vec<ObjectSummary>>;

    async fn download(&self, key: &str, location: &LocationInfo) -> AdapterResult<Bytes>;

    /// Bytes `start..=end` of the object.
    async fn download_range(
        &self,
        key: &str,
        location: &LocationInfo,
        start: u64,
        end: u64,
    ) -> AdapterResult<Bytes>;

    async fn upload(&self, key: &str, location: &LocationInfo, data: Bytes) -> AdapterResult<()>;

    async fn delete(&self, key: &str, location: &LocationInfo) -> AdapterResult<()>;

    async fn multipart_init(&self, key: &str, location: &LocationInfo) -> AdapterResult<MultipartSession>;

    /// Upload one part; `offset` is where `data` starts within the object.
    async fn upload_part(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        part_number: u32,
        offset: u64,
        data: Bytes,
    ) -> AdapterResult<CompletedPart>;

    /// Assemble the object. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> AdapterResult<()>;

    async fn abort_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
    ) -> AdapterResult<()>;
}

/// Storage type → adapter lookup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<StorageType, Arc<dyn StorageAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local disk for the internal store, `object_store` for S3-compatible
    /// providers.
    pub fn with_defaults(storage_dir: impl Into<PathBuf>) -> Self {
        let s3: Arc<dyn StorageAdapter> = Arc::new(S3Adapter::new());
        Self::new()
            .register(StorageType::Internal, Arc::new(LocalAdapter::new(storage_dir)))
            .register(StorageType::AwsS3, s3.clone())
            .register(StorageType::HwObs, s3.clone())
            .register(StorageType::CephS3, s3)
    }

    pub fn register(mut self, storage_type: StorageType, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapters.insert(storage_type, adapter);
        self
    }

    pub fn get(&self, storage_type: StorageType) -> AdapterResult<Arc<dyn StorageAdapter>> {
        self.adapters
            .get(&storage_type)
            .cloned()
            .ok_or(AdapterError::UnsupportedBackend(storage_type))
    }
}
