//! Represents a stored document (file) owned by a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata for a committed document.
///
/// The struct stores metadata only; the payload lives in the blob store at
/// `location`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Row id assigned by the metadata store.
    pub id: i64,

    /// User that owns this document.
    pub owner_id: i64,

    /// Folder holding the document, `None` for the root.
    pub folder_id: Option<i64>,

    /// Unique stored name (`{stem}_{uuid}.{ext}`).
    pub filename: String,

    /// Name supplied by the uploader.
    pub original_filename: String,

    /// Lower-case extension, e.g. `pdf`.
    pub file_type: String,

    /// Opaque blob store location.
    #[serde(skip_serializing, default)]
    pub location: String,

    /// Size in bytes of the persisted payload.
    pub size_bytes: i64,

    /// MD5 hex digest of the payload.
    pub checksum: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a new document row.
#[derive(Clone, Debug)]
pub struct NewDocument {
    pub owner_id: i64,
    pub folder_id: Option<i64>,
    pub filename: String,
    pub original_filename: String,
    pub file_type: String,
    pub location: String,
    pub size_bytes: i64,
    pub checksum: String,
}

/// Filters and paging for a document listing. Results are newest first.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuery {
    /// Only documents directly inside this folder.
    pub folder_id: Option<i64>,
    /// Only documents of this type, compared case-insensitively.
    pub file_type: Option<String>,
    /// Substring of the original filename.
    pub keyword: Option<String>,
    /// Zero-based page number.
    #[serde(default)]
    pub page: u32,
    /// Page size, clamped to `1..=MAX_PAGE_SIZE`. Zero selects the default.
    #[serde(default)]
    pub size: u32,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

impl DocumentQuery {
    pub fn page_size(&self) -> u32 {
        match self.size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        }
    }
}

/// One page of a document listing.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPage {
    pub items: Vec<Document>,
    /// Matching documents across all pages.
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

/// Rename and/or move a document. Absent fields are left unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    pub filename: Option<String>,
    pub folder_id: Option<i64>,
}
