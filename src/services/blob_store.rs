//! src/services/blob_store.rs
//!
//! Byte storage for committed documents. `FsBlobStore` keeps payloads on
//! local disk sharded beneath `base_path/{shard}/{shard}/{digest}-{nonce}`,
//! where the shards come from the MD5 of the content.

use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_LOCATION_LEN: usize = 256;

/// Narrow contract over the physical byte store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` and return an opaque location string.
    async fn put(&self, bytes: Bytes) -> ServiceResult<String>;

    /// Read the payload at `location`; `NotFound` if it is missing.
    async fn get(&self, location: &str) -> ServiceResult<Bytes>;

    /// Remove the payload at `location`. Missing payloads are not an error.
    async fn delete(&self, location: &str) -> ServiceResult<()>;
}

/// Local-disk blob store.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Two-level shard identifiers from the first two digest bytes.
    fn shards(digest: &md5::Digest) -> (String, String) {
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Reject locations that could escape `base_path`.
    fn resolve(&self, location: &str) -> ServiceResult<PathBuf> {
        let valid = !location.is_empty()
            && location.len() <= MAX_LOCATION_LEN
            && !location.starts_with('/')
            && !location.contains("..")
            && location
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'/' || b == b'-');
        if !valid {
            return Err(ServiceError::Validation(format!(
                "invalid blob location `{}`",
                location
            )));
        }
        Ok(self.base_path.join(location))
    }

    /// Remove empty shard directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
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
impl BlobStore for FsBlobStore {
    /// Writes to a temp file, fsyncs, then renames into place. Identical
    /// payloads still get distinct locations so each document owns its blob.
    async fn put(&self, bytes: Bytes) -> ServiceResult<String> {
        let digest = md5::compute(&bytes);
        let (shard_a, shard_b) = Self::shards(&digest);
        let location = format!("{}/{}/{:x}-{}", shard_a, shard_b, digest, Uuid::new_v4().simple());

        let file_path = self.base_path.join(&location);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ServiceError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ServiceError::Io(err));
        }

        debug!(location = %location, size = bytes.len(), "stored blob");
        Ok(location)
    }

    async fn get(&self, location: &str) -> ServiceResult<Bytes> {
        let path = self.resolve(location)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ServiceError::NotFound(format!("blob `{}`", location)))
            }
            Err(err) => Err(ServiceError::Io(err)),
        }
    }

    async fn delete(&self, location: &str) -> ServiceResult<()> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
            }
            Err(err) => return Err(ServiceError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}
