//! Chunked upload sessions and the request/response shapes around them.

use crate::models::{UserId, document::Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle of a chunked upload session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Reserved, first chunk not yet spooled.
    New,
    /// Accepting chunks.
    Receiving,
    /// Every chunk arrived; merge in progress.
    Complete,
    /// Merged into a committed document.
    Merged,
    /// Cancelled by the client or aborted after a failed merge.
    Cancelled,
    /// Swept after outliving its expiry.
    Expired,
}

/// Chunk metadata supplied alongside every chunk body.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    /// Client-chosen identifier, unique per user for one logical file.
    pub file_identifier: String,
    /// Zero-based chunk index.
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub filename: String,
    pub folder_id: Option<i64>,
}

/// Reply to a chunk upload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub file_identifier: String,
    pub chunk_index: u32,
    pub completed: bool,
    pub uploaded_chunks: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    pub progress: f64,
}

/// In-progress chunked upload, keyed by (user, file identifier).
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub user_id: UserId,
    pub file_identifier: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub original_filename: String,
    pub target_folder_id: Option<i64>,
    pub received: BTreeSet<u32>,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Received indexes in ascending order.
    pub fn uploaded_chunks(&self) -> Vec<u32> {
        self.received.iter().copied().collect()
    }

    pub fn progress(&self) -> f64 {
        self.received.len() as f64 * 100.0 / self.total_chunks as f64
    }

    /// Describe the first field where `meta` disagrees with this session.
    pub fn mismatch(&self, meta: &ChunkMeta) -> Option<String> {
        if meta.total_chunks != self.total_chunks {
            return Some(format!(
                "totalChunks {} != {}",
                meta.total_chunks, self.total_chunks
            ));
        }
        if meta.total_size != self.total_size {
            return Some(format!("totalSize {} != {}", meta.total_size, self.total_size));
        }
        if meta.filename != self.original_filename {
            return Some(format!(
                "filename `{}` != `{}`",
                meta.filename, self.original_filename
            ));
        }
        None
    }
}
