//! Byte movement for one job.
//!
//! Objects at or below the multipart threshold are copied whole. Larger
//! objects are streamed one part at a time: a ranged download fills a
//! buffer of at most `part_size` bytes, which is uploaded as one part of a
//! multipart session on the destination.

use crate::{
    adapters::{
        AdapterError, AdapterRegistry, CompletedPart, LocationInfo, MultipartSession, ObjectSummary,
        StorageAdapter,
    },
    models::{
        connector::StorageType,
        message::{RunJobRequest, WireConnector},
        object::{ObjectRecord, PartRecord},
    },
    services::metadata_store::{MetadataStore, StoreError},
};
use bytes::Bytes;
use chrono::Utc;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_PART_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid filter pattern: {0}")]
    InvalidFilter(#[from] regex::Error),
    #[error("part {part_number} failed after {attempts} attempts: {source}")]
    PartFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        source: AdapterError,
    },
}

pub type MoveResult<T> = Result<T, MoveError>;

#[derive(Clone, Copy, Debug)]
pub struct TransferSettings {
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub part_attempts: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            part_attempts: DEFAULT_PART_ATTEMPTS,
        }
    }
}

/// One open multipart session on a destination.
///
/// Parts may succeed in any order; `complete` hands the provider the
/// recorded parts sorted by part number.
pub struct MultipartTransfer<'a> {
    adapter: &'a dyn StorageAdapter,
    key: &'a str,
    location: &'a LocationInfo,
    session: MultipartSession,
    completed: Vec<CompletedPart>,
    max_attempts: u32,
}

impl<'a> MultipartTransfer<'a> {
    pub async fn begin(
        adapter: &'a dyn StorageAdapter,
        key: &'a str,
        location: &'a LocationInfo,
        max_attempts: u32,
    ) -> MoveResult<Self> {
        let session = adapter.multipart_init(key, location).await?;
        debug!(key, upload_id = %session.upload_id, "multipart session opened");
        Ok(Self {
            adapter,
            key,
            location,
            session,
            completed: Vec::new(),
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn session(&self) -> &MultipartSession {
        &self.session
    }

    pub async fn upload_part(&mut self, part_number: u32, offset: u64, data: Bytes) -> MoveResult<CompletedPart> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .adapter
                .upload_part(self.key, self.location, &self.session, part_number, offset, data.clone())
                .await
            {
                Ok(part) => {
                    self.completed.push(part.clone());
                    return Ok(part);
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(key = self.key, part_number, attempt, error = %err, "part upload failed, retrying");
                }
                Err(err) => {
                    warn!(key = self.key, part_number, attempt, error = %err, "part upload failed");
                    return Err(MoveError::PartFailed {
                        part_number,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    pub async fn complete(mut self) -> MoveResult<()> {
        self.completed.sort_by_key(|p| p.part_number);
        self.adapter
            .complete_multipart_upload(self.key, self.location, &self.session, &self.completed)
            .await?;
        Ok(())
    }

    pub async fn abort(self) -> MoveResult<()> {
        self.adapter
            .abort_multipart_upload(self.key, self.location, &self.session)
            .await?;
        Ok(())
    }
}

/// Counters for one job, written back onto the job record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub total_count: i64,
    pub passed_count: i64,
    pub total_capacity: i64,
    pub passed_capacity: i64,
    pub failures: Vec<String>,
}

impl TransferSummary {
    pub fn is_success(&self) -> bool {
        self.passed_count == self.total_count
    }

    fn passed(&mut self, size: i64) {
        self.passed_count += 1;
        self.passed_capacity += size;
    }
}

struct Endpoint {
    adapter: Arc<dyn StorageAdapter>,
    location: LocationInfo,
}

impl Endpoint {
    fn is_internal(&self) -> bool {
        self.location.storage_type == StorageType::Internal
    }
}

#[derive(Clone)]
pub struct Mover {
    adapters: AdapterRegistry,
    store: Arc<dyn MetadataStore>,
    settings: TransferSettings,
}

impl Mover {
    pub fn new(adapters: AdapterRegistry, store: Arc<dyn MetadataStore>, settings: TransferSettings) -> Self {
        Self {
            adapters,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    fn endpoint(&self, conn: &WireConnector) -> MoveResult<Endpoint> {
        let location = LocationInfo::from_wire(conn)?;
        let adapter = self.adapters.get(location.storage_type)?;
        Ok(Endpoint { adapter, location })
    }

    /// Move every object the request's filter selects. Errors returned here
    /// mean the job could not start; per-object failures land in the summary.
    pub async fn run_job(&self, req: &RunJobRequest) -> MoveResult<TransferSummary> {
        let src = self.endpoint(&req.source_conn)?;
        let dst = self.endpoint(&req.dest_conn)?;
        let pattern = req.filter.compile()?;
        let prefix = req.filter.key_prefix();

        let objects: Vec<ObjectSummary> = src
            .adapter
            .list(&src.location, prefix)
            .await?
            .into_iter()
            .filter(|o| req.filter.matches(&o.key, pattern.as_ref()))
            .collect();

        let existing: HashSet<String> = if req.over_write {
            HashSet::new()
        } else {
            dst.adapter
                .list(&dst.location, prefix)
                .await?
                .into_iter()
                .map(|o| o.key)
                .collect()
        };

        info!(
            job_id = %req.id,
            objects = objects.len(),
            src = %src.location.bucket_name,
            dst = %dst.location.bucket_name,
            "starting transfer"
        );

        let mut summary = TransferSummary::default();
        for object in &objects {
            let size = object.size as i64;
            summary.total_count += 1;
            summary.total_capacity += size;

            if existing.contains(&object.key) {
                debug!(job_id = %req.id, key = %object.key, "already at destination, skipping");
                summary.passed(size);
                continue;
            }

            match self.move_object(&src, &dst, object, req.remain_source).await {
                Ok(()) => summary.passed(size),
                Err(err) => {
                    error!(job_id = %req.id, key = %object.key, error = %err, "object transfer failed");
                    summary.failures.push(format!("{}: {}", object.key, err));
                }
            }
        }

        info!(
            job_id = %req.id,
            passed = summary.passed_count,
            total = summary.total_count,
            "transfer finished"
        );
        Ok(summary)
    }

    async fn move_object(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        object: &ObjectSummary,
        remain_source: bool,
    ) -> MoveResult<()> {
        if object.size <= self.settings.multipart_threshold {
            self.copy_whole(src, dst, object).await?;
        } else {
            self.copy_multipart(src, dst, object).await?;
        }

        if !remain_source {
            src.adapter.delete(&object.key, &src.location).await?;
            if src.is_internal() {
                self.store
                    .delete_object(&src.location.bucket_name, &object.key)
                    .await?;
            }
        }
        Ok(())
    }

    async fn copy_whole(&self, src: &Endpoint, dst: &Endpoint, object: &ObjectSummary) -> MoveResult<()> {
        let data = src.adapter.download(&object.key, &src.location).await?;
        let etag = format!("{:x}", md5::compute(&data));
        let size = data.len() as i64;
        dst.adapter.upload(&object.key, &dst.location, data).await?;

        if dst.is_internal() {
            let record = ObjectRecord::whole(
                &dst.location.bucket_name,
                &object.key,
                StorageType::Internal.as_str(),
                size,
                Some(etag),
            );
            if let Err(err) = self.store.put_object(&record).await {
                warn!(key = %object.key, error = %err, "object uploaded but metadata not recorded");
            }
        }
        Ok(())
    }

    async fn copy_multipart(&self, src: &Endpoint, dst: &Endpoint, object: &ObjectSummary) -> MoveResult<()> {
        let mut transfer = MultipartTransfer::begin(
            dst.adapter.as_ref(),
            &object.key,
            &dst.location,
            self.settings.part_attempts,
        )
        .await?;

        let mut pending = None;
        if let Err(err) = self.send_parts(src, dst, object, &mut transfer, &mut pending).await {
            abort_quietly(transfer, &object.key).await;
            return Err(err);
        }

        // Completion is part of the session; a refused completion still
        // leaves server-side parts behind.
        let session = transfer.session().clone();
        if let Err(err) = transfer.complete().await {
            if let Err(abort_err) = dst
                .adapter
                .abort_multipart_upload(&object.key, &dst.location, &session)
                .await
            {
                warn!(key = %object.key, error = %abort_err, "abort after failed completion failed");
            }
            return Err(err);
        }

        // The previous record stays authoritative until the new object exists.
        if let Some(record) = pending {
            if let Err(err) = self.store.put_object(&record).await {
                warn!(key = %object.key, error = %err, "object uploaded but metadata not recorded");
            }
        }
        Ok(())
    }

    async fn send_parts(
        &self,
        src: &Endpoint,
        dst: &Endpoint,
        object: &ObjectSummary,
        transfer: &mut MultipartTransfer<'_>,
        pending: &mut Option<ObjectRecord>,
    ) -> MoveResult<()> {
        let part_size = self.settings.part_size.max(1);
        let mut offset = 0u64;
        let mut part_number = 1u32;

        while offset < object.size {
            let end = (offset + part_size).min(object.size) - 1;
            let data = src
                .adapter
                .download_range(&object.key, &src.location, offset, end)
                .await?;
            let part = transfer.upload_part(part_number, offset, data.clone()).await?;

            if dst.is_internal() {
                reconcile_part(
                    pending,
                    &dst.location.bucket_name,
                    &object.key,
                    PartRecord {
                        part_number,
                        size: data.len() as i64,
                        last_modified: Utc::now(),
                        etag: part.etag,
                    },
                );
            }

            offset = end + 1;
            part_number += 1;
        }
        Ok(())
    }
}

/// Fold an uploaded part into the session's object record, seeding the
/// record on the first part.
fn reconcile_part(record: &mut Option<ObjectRecord>, bucket: &str, key: &str, part: PartRecord) {
    match record {
        Some(record) => record.append_part(part),
        None => {
            *record = Some(ObjectRecord::seeded(
                bucket,
                key,
                StorageType::Internal.as_str(),
                part,
            ))
        }
    }
}

async fn abort_quietly(transfer: MultipartTransfer<'_>, key: &str) {
    let upload_id = transfer.session().upload_id.clone();
    match transfer.abort().await {
        Ok(()) => info!(key, %upload_id, "multipart upload aborted"),
        Err(err) => warn!(key, %upload_id, error = %err, "multipart abort failed"),
    }
}
