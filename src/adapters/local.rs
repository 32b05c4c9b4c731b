//! Internal object store on local disk.
//!
//! Payloads live under `base_path/{bucket}/{shard}/{shard}/{key}`, where the
//! shards are the first two bytes of MD5(bucket/key). Writes go to a temp
//! file, are fsynced, then renamed into place. Multipart parts are staged
//! under `base_path/.multipart/{upload_id}/` and concatenated on completion.

use super::{
    AdapterError, AdapterResult, CompletedPart, LocationInfo, MultipartSession, ObjectSummary,
    StorageAdapter,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::Context;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MAX_LEN: usize = 63;
const STAGING_DIR: &str = ".multipart";
const TMP_PREFIX: &str = ".tmp-";
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalAdapter {
    base_path: PathBuf,
}

impl LocalAdapter {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> AdapterResult<()> {
        let bad = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.ends_with('/')
            || key.contains("..")
            || key.contains("//")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if bad {
            return Err(AdapterError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Bucket names become directory names: ASCII alphanumerics, `.`, `-`
    /// and `_`, at most 63 characters, not starting with a dot.
    fn ensure_bucket_safe(name: &str) -> AdapterResult<()> {
        let invalid = |reason: &str| AdapterError::InvalidBucket {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.is_empty() || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be between 1 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(invalid(
                "allowed characters are letters, digits, dots, hyphens and underscores",
            ));
        }
        if name.starts_with('.') || name.contains("..") {
            return Err(invalid("cannot start with a dot or contain consecutive dots"));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> AdapterResult<PathBuf> {
        Self::ensure_bucket_safe(bucket)?;
        Ok(self.base_path.join(bucket))
    }

    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> AdapterResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket)?;
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    fn staging_dir(&self, session: &MultipartSession) -> AdapterResult<PathBuf> {
        let upload_id = Uuid::parse_str(&session.upload_id)
            .map_err(|_| AdapterError::UnknownUpload(session.upload_id.clone()))?;
        Ok(self.base_path.join(STAGING_DIR).join(upload_id.to_string()))
    }

    fn part_path(staging: &Path, part_number: u32) -> PathBuf {
        staging.join(format!("part-{part_number:05}"))
    }

    fn not_found(location: &LocationInfo, key: &str) -> impl FnOnce(io::Error) -> AdapterError {
        let bucket = location.bucket_name.clone();
        let key = key.to_string();
        move |err| {
            if err.kind() == ErrorKind::NotFound {
                AdapterError::NotFound { bucket, key }
            } else {
                AdapterError::Io(err)
            }
        }
    }

    fn temp_path(dest: &Path) -> io::Result<(PathBuf, PathBuf)> {
        let parent = dest.parent().ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "object path missing parent directory")
        })?;
        Ok((
            parent.to_path_buf(),
            parent.join(format!("{TMP_PREFIX}{}", Uuid::new_v4())),
        ))
    }

    async fn finish(mut file: File, tmp_path: &Path, dest: &Path) -> io::Result<()> {
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(tmp_path, dest).await
    }

    /// Write `chunks` to `dest` through a fsynced temp file; returns the MD5.
    async fn write_atomically<'a, I>(dest: &Path, chunks: I) -> AdapterResult<String>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let (parent, tmp_path) = Self::temp_path(dest)?;
        fs::create_dir_all(&parent).await?;

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let mut digest = Context::new();
            for chunk in chunks {
                digest.consume(chunk);
                file.write_all(chunk).await?;
            }
            Self::finish(file, &tmp_path, dest).await?;
            Ok::<_, io::Error>(format!("{:x}", digest.compute()))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        Ok(result?)
    }

    /// Concatenate `sources` into `dest` through a fsynced temp file, one
    /// `COPY_CHUNK` buffer at a time; returns the MD5.
    async fn concat_atomically(dest: &Path, sources: &[PathBuf]) -> AdapterResult<String> {
        let (parent, tmp_path) = Self::temp_path(dest)?;
        fs::create_dir_all(&parent).await?;

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let mut digest = Context::new();
            let mut buf = vec![0u8; COPY_CHUNK];
            for source in sources {
                let mut part = File::open(source).await?;
                loop {
                    let n = part.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    digest.consume(&buf[..n]);
                    file.write_all(&buf[..n]).await?;
                }
            }
            Self::finish(file, &tmp_path, dest).await?;
            Ok::<_, io::Error>(format!("{:x}", digest.compute()))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        Ok(result?)
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    async fn list(&self, location: &LocationInfo, prefix: &str) -> AdapterResult<Vec<ObjectSummary>> {
        let root = self.bucket_root(&location.bucket_name)?;
        let mut objects = Vec::new();
        // (directory, depth below the bucket root)
        let mut pending = vec![(root.clone(), 0usize)];

        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(TMP_PREFIX) {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push((entry.path(), depth + 1));
                    continue;
                }
                // Files sit below the two shard levels.
                if depth < 2 {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root).map(Path::to_path_buf) else {
                    continue;
                };
                let key = relative
                    .components()
                    .skip(2)
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(ObjectSummary {
                    key,
                    size: meta.len(),
                    last_modified,
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn download(&self, key: &str, location: &LocationInfo) -> AdapterResult<Bytes> {
        let path = self.object_path(&location.bucket_name, key)?;
        let data = fs::read(&path).await.map_err(Self::not_found(location, key))?;
        Ok(Bytes::from(data))
    }

    async fn download_range(
        &self,
        key: &str,
        location: &LocationInfo,
        start: u64,
        end: u64,
    ) -> AdapterResult<Bytes> {
        if end < start {
            return Err(io::Error::new(ErrorKind::InvalidInput, "range end before start").into());
        }
        let path = self.object_path(&location.bucket_name, key)?;
        let mut file = File::open(&path).await.map_err(Self::not_found(location, key))?;
        file.seek(SeekFrom::Start(start)).await?;

        let len = end - start + 1;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        debug!(key, start, end, read = buf.len(), "ranged read");
        Ok(Bytes::from(buf))
    }

    async fn upload(&self, key: &str, location: &LocationInfo, data: Bytes) -> AdapterResult<()> {
        let path = self.object_path(&location.bucket_name, key)?;
        let etag = Self::write_atomically(&path, [data.as_ref()]).await?;
        debug!(key, bucket = %location.bucket_name, %etag, size = data.len(), "stored object");
        Ok(())
    }

    async fn delete(&self, key: &str, location: &LocationInfo) -> AdapterResult<()> {
        let path = self.object_path(&location.bucket_name, key)?;
        fs::remove_file(&path)
            .await
            .map_err(Self::not_found(location, key))?;
        debug!("removed physical file {}", path.display());

        if let Some(parent) = path.parent() {
            let root = self.bucket_root(&location.bucket_name)?;
            Self::prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }

    async fn multipart_init(&self, key: &str, location: &LocationInfo) -> AdapterResult<MultipartSession> {
        // Validate the target now rather than at completion.
        self.object_path(&location.bucket_name, key)?;
        let session = MultipartSession {
            upload_id: Uuid::new_v4().to_string(),
        };
        fs::create_dir_all(self.staging_dir(&session)?).await?;
        debug!(key, upload_id = %session.upload_id, "multipart upload initiated");
        Ok(session)
    }

    async fn upload_part(
        &self,
        key: &str,
        _location: &LocationInfo,
        session: &MultipartSession,
        part_number: u32,
        offset: u64,
        data: Bytes,
    ) -> AdapterResult<CompletedPart> {
        let staging = self.staging_dir(session)?;
        if !fs::try_exists(&staging).await? {
            return Err(AdapterError::UnknownUpload(session.upload_id.clone()));
        }
        let etag = Self::write_atomically(&Self::part_path(&staging, part_number), [data.as_ref()]).await?;
        debug!(key, part_number, offset, size = data.len(), "part staged");
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> AdapterResult<()> {
        let staging = self.staging_dir(session)?;
        if !fs::try_exists(&staging).await? {
            return Err(AdapterError::UnknownUpload(session.upload_id.clone()));
        }

        let mut sources = Vec::with_capacity(parts.len());
        for part in parts {
            let path = Self::part_path(&staging, part.part_number);
            match fs::metadata(&path).await {
                Ok(_) => sources.push(path),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(AdapterError::MissingPart(part.part_number));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let path = self.object_path(&location.bucket_name, key)?;
        let etag = Self::concat_atomically(&path, &sources).await?;
        fs::remove_dir_all(&staging).await?;
        debug!(key, parts = parts.len(), %etag, "multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        _location: &LocationInfo,
        session: &MultipartSession,
    ) -> AdapterResult<()> {
        let staging = self.staging_dir(session)?;
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        debug!(key, upload_id = %session.upload_id, "multipart upload aborted");
        Ok(())
    }
}
