//! Temporary on-disk storage for chunks of in-flight uploads, laid out as
//! `root/{user}/{file_identifier}/{index}.chunk`.

use crate::models::UserId;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ChunkSpool {
    root: PathBuf,
}

impl ChunkSpool {
    /// `file_identifier` values reaching the spool must already be validated
    /// as a single safe path segment.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, user_id: UserId, file_identifier: &str) -> PathBuf {
        self.root.join(user_id.to_string()).join(file_identifier)
    }

    fn chunk_path(&self, user_id: UserId, file_identifier: &str, index: u32) -> PathBuf {
        self.session_dir(user_id, file_identifier)
            .join(format!("{}.chunk", index))
    }

    /// Write one chunk through a temp file so a crashed write never leaves a
    /// truncated `{index}.chunk` behind.
    pub async fn write_chunk(
        &self,
        user_id: UserId,
        file_identifier: &str,
        index: u32,
        data: &[u8],
    ) -> io::Result<()> {
        let dir = self.session_dir(user_id, file_identifier);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let final_path = self.chunk_path(user_id, file_identifier, index);

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            fs::rename(&tmp_path, &final_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        debug!(user_id, file_identifier, index, size = data.len(), "spooled chunk");
        Ok(())
    }

    pub async fn read_chunk(
        &self,
        user_id: UserId,
        file_identifier: &str,
        index: u32,
    ) -> io::Result<Bytes> {
        let data = fs::read(self.chunk_path(user_id, file_identifier, index)).await?;
        Ok(Bytes::from(data))
    }

    /// Remove every chunk of one session. Failures are logged, not returned:
    /// the session is already terminal by the time this runs.
    ///
    /// The per-user directory is left in place. Another session of the same
    /// user may be creating its directory beneath it; `purge` clears it at
    /// the next start.
    pub async fn discard(&self, user_id: UserId, file_identifier: &str) {
        let dir = self.session_dir(user_id, file_identifier);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed spool directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove spool directory {}: {}", dir.display(), err),
        }
    }

    /// Drop everything left by a previous process. Sessions are held in
    /// memory, so leftover chunks can never be completed.
    pub async fn purge(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        fs::create_dir_all(&self.root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_round_trip_and_discard_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ChunkSpool::new(dir.path().join("spool"));

        spool.write_chunk(4, "file-1", 1, b"world").await.unwrap();
        spool.write_chunk(4, "file-1", 0, b"hello ").await.unwrap();
        assert_eq!(spool.read_chunk(4, "file-1", 0).await.unwrap(), Bytes::from_static(b"hello "));

        spool.discard(4, "file-1").await;
        assert!(!spool.session_dir(4, "file-1").exists());
        assert!(spool.read_chunk(4, "file-1", 1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn discard_does_not_race_sibling_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ChunkSpool::new(dir.path().join("spool"));

        let churn = {
            let spool = spool.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    let id = format!("short-{}", round);
                    spool.write_chunk(9, &id, 0, b"x").await.unwrap();
                    spool.discard(9, &id).await;
                }
            })
        };
        let writer = {
            let spool = spool.clone();
            tokio::spawn(async move {
                for round in 0..200u32 {
                    let id = format!("long-{}", round);
                    spool.write_chunk(9, &id, round, b"y").await.unwrap();
                }
            })
        };
        churn.await.unwrap();
        writer.await.unwrap();

        assert!(spool.root().join("9").is_dir());
        assert!(!spool.session_dir(9, "short-0").exists());
        assert_eq!(spool.read_chunk(9, "long-7", 7).await.unwrap(), Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn purge_leaves_an_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let spool = ChunkSpool::new(dir.path().join("spool"));
        spool.write_chunk(1, "stale", 0, b"x").await.unwrap();

        spool.purge().await.unwrap();
        assert!(spool.root().exists());
        assert!(std::fs::read_dir(spool.root()).unwrap().next().is_none());
    }
}
