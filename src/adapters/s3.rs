//! S3-compatible providers (AWS S3, Huawei OBS, Ceph RGW) via `object_store`.

use super::{
    AdapterError, AdapterResult, CONF_ACCESS, CONF_ENDPOINT, CONF_SECURITY, CompletedPart,
    LocationInfo, MultipartSession, ObjectSummary, StorageAdapter,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    ObjectStore, PutPayload,
    aws::{AmazonS3, AmazonS3Builder},
    multipart::{MultipartStore, PartId},
    path::Path,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";

/// One client per (endpoint, bucket, access key), built on first use.
#[derive(Default)]
pub struct S3Adapter {
    clients: Mutex<HashMap<(String, String, String), Arc<AmazonS3>>>,
}

impl S3Adapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, location: &LocationInfo) -> AdapterResult<Arc<AmazonS3>> {
        let endpoint = location
            .endpoint
            .as_deref()
            .ok_or(AdapterError::MissingConfig(CONF_ENDPOINT))?;
        let access = location
            .access
            .as_deref()
            .ok_or(AdapterError::MissingConfig(CONF_ACCESS))?;
        let secret = location
            .security
            .as_deref()
            .ok_or(AdapterError::MissingConfig(CONF_SECURITY))?;

        let cache_key = (
            endpoint.to_string(),
            location.bucket_name.clone(),
            access.to_string(),
        );
        if let Some(client) = self.clients.lock().get(&cache_key) {
            return Ok(client.clone());
        }

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_access_key_id(access)
            .with_secret_access_key(secret)
            .with_bucket_name(&location.bucket_name)
            .with_region(location.region.as_deref().unwrap_or(DEFAULT_REGION));
        if endpoint.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }
        let client = Arc::new(builder.build()?);
        debug!(endpoint, bucket = %location.bucket_name, "built s3 client");

        self.clients.lock().insert(cache_key, client.clone());
        Ok(client)
    }

    fn not_found(location: &LocationInfo, key: &str, err: object_store::Error) -> AdapterError {
        match err {
            object_store::Error::NotFound { .. } => AdapterError::NotFound {
                bucket: location.bucket_name.clone(),
                key: key.to_string(),
            },
            other => other.into(),
        }
    }

    /// `object_store` lists whole path segments; narrow to the directory
    /// part of `prefix` and filter the remainder by string match.
    fn list_root(prefix: &str) -> Option<Path> {
        let dir = prefix.trim_start_matches('/');
        let dir = match dir.rfind('/') {
            Some(idx) => &dir[..idx],
            None => "",
        };
        (!dir.is_empty()).then(|| Path::from(dir))
    }
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    async fn list(&self, location: &LocationInfo, prefix: &str) -> AdapterResult<Vec<ObjectSummary>> {
        let client = self.client(location)?;
        let root = Self::list_root(prefix);
        let objects: Vec<ObjectSummary> = client
            .list(root.as_ref())
            .try_filter(|meta| futures::future::ready(meta.location.as_ref().starts_with(prefix)))
            .map_ok(|meta| ObjectSummary {
                key: meta.location.to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .try_collect()
            .await?;
        debug!(bucket = %location.bucket_name, prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn download(&self, key: &str, location: &LocationInfo) -> AdapterResult<Bytes> {
        let client = self.client(location)?;
        let result = client
            .get(&Path::from(key))
            .await
            .map_err(|err| Self::not_found(location, key, err))?;
        Ok(result.bytes().await?)
    }

    async fn download_range(
        &self,
        key: &str,
        location: &LocationInfo,
        start: u64,
        end: u64,
    ) -> AdapterResult<Bytes> {
        let client = self.client(location)?;
        let range = start as usize..(end as usize + 1);
        client
            .get_range(&Path::from(key), range)
            .await
            .map_err(|err| Self::not_found(location, key, err))
    }

    async fn upload(&self, key: &str, location: &LocationInfo, data: Bytes) -> AdapterResult<()> {
        let client = self.client(location)?;
        client.put(&Path::from(key), PutPayload::from(data)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, location: &LocationInfo) -> AdapterResult<()> {
        let client = self.client(location)?;
        client
            .delete(&Path::from(key))
            .await
            .map_err(|err| Self::not_found(location, key, err))
    }

    async fn multipart_init(&self, key: &str, location: &LocationInfo) -> AdapterResult<MultipartSession> {
        let client = self.client(location)?;
        let upload_id = client.create_multipart(&Path::from(key)).await?;
        Ok(MultipartSession { upload_id })
    }

    async fn upload_part(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        part_number: u32,
        _offset: u64,
        data: Bytes,
    ) -> AdapterResult<CompletedPart> {
        let client = self.client(location)?;
        // object_store numbers parts from zero.
        let part_idx = part_number.saturating_sub(1) as usize;
        let part = client
            .put_part(&Path::from(key), &session.upload_id, part_idx, PutPayload::from(data))
            .await?;
        Ok(CompletedPart {
            part_number,
            etag: part.content_id,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> AdapterResult<()> {
        let client = self.client(location)?;
        let parts = parts
            .iter()
            .map(|p| PartId {
                content_id: p.etag.clone(),
            })
            .collect();
        client
            .complete_multipart(&Path::from(key), &session.upload_id, parts)
            .await?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
    ) -> AdapterResult<()> {
        let client = self.client(location)?;
        client
            .abort_multipart(&Path::from(key), &session.upload_id)
            .await?;
        Ok(())
    }
}
