//! src/services/document_service.rs
//!
//! Single-document pipeline shared by chunk merges and batch items:
//! validate → reserve → put blob → create record → commit. A reservation
//! handed to `finish_upload` is always settled: committed on success,
//! released on every failure path.

use crate::{
    config::UploadLimits,
    errors::{ServiceError, ServiceResult},
    models::{
        UserId,
        document::{Document, DocumentPage, DocumentQuery, DocumentUpdate, NewDocument},
        folder::Folder,
        quota::StorageInfo,
    },
    services::{
        blob_store::BlobStore,
        metadata_store::MetadataStore,
        quota_ledger::{QuotaLedger, ReservationToken},
    },
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 255;

/// Validated description of a payload about to be committed.
#[derive(Clone, Debug)]
pub struct PendingUpload {
    pub owner_id: UserId,
    pub original_filename: String,
    pub file_type: String,
    pub folder_id: Option<i64>,
}

pub struct DocumentService {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<QuotaLedger>,
    limits: UploadLimits,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<QuotaLedger>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            store,
            blobs,
            ledger,
            limits,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Check name, format and size; returns the lower-case file type.
    pub fn validate_upload(&self, filename: &str, size: u64) -> ServiceResult<String> {
        if filename.trim().is_empty() {
            return Err(ServiceError::Validation("filename must not be empty".into()));
        }
        if filename.len() > MAX_FILENAME_LEN {
            return Err(ServiceError::Validation(format!(
                "filename longer than {} bytes",
                MAX_FILENAME_LEN
            )));
        }

        let file_type = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
            _ => return Err(ServiceError::Unsupported(filename.to_string())),
        };
        if !self.limits.allowed_extensions.iter().any(|ext| *ext == file_type) {
            return Err(ServiceError::Unsupported(file_type));
        }

        if size == 0 {
            return Err(ServiceError::Validation(format!("`{}` is empty", filename)));
        }
        if size > self.limits.max_file_size {
            return Err(ServiceError::Validation(format!(
                "`{}` is {:.2} MB, the limit is {:.2} MB",
                filename,
                size as f64 / (1024.0 * 1024.0),
                self.limits.max_file_size as f64 / (1024.0 * 1024.0)
            )));
        }
        Ok(file_type)
    }

    /// Fail with `NotFound` unless `folder_id` is absent or owned by the user.
    pub async fn ensure_folder(&self, user_id: UserId, folder_id: Option<i64>) -> ServiceResult<()> {
        let Some(id) = folder_id else {
            return Ok(());
        };
        if self.store.folder_exists(id, user_id).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!("folder {}", id)))
        }
    }

    /// Upload one complete document.
    pub async fn upload_document(
        &self,
        user_id: UserId,
        filename: &str,
        folder_id: Option<i64>,
        bytes: Bytes,
    ) -> ServiceResult<Document> {
        let size = bytes.len() as u64;
        let file_type = self.validate_upload(filename, size)?;
        self.ensure_folder(user_id, folder_id).await?;

        let token = self.ledger.reserve(user_id, size).await?;
        let pending = PendingUpload {
            owner_id: user_id,
            original_filename: filename.to_string(),
            file_type,
            folder_id,
        };
        self.finish_upload(token, pending, bytes).await
    }

    /// Persist `bytes` against an existing reservation. The token is settled
    /// before this returns, whatever the outcome.
    pub async fn finish_upload(
        &self,
        token: ReservationToken,
        pending: PendingUpload,
        bytes: Bytes,
    ) -> ServiceResult<Document> {
        match self.persist(&token, &pending, bytes).await {
            Ok(document) => {
                info!(
                    user_id = pending.owner_id,
                    document_id = document.id,
                    size = document.size_bytes,
                    "document stored"
                );
                Ok(document)
            }
            Err(err) => {
                warn!(
                    user_id = pending.owner_id,
                    filename = %pending.original_filename,
                    error = %err,
                    "upload failed, releasing reservation"
                );
                self.release_quietly(&token).await;
                Err(err)
            }
        }
    }

    async fn persist(
        &self,
        token: &ReservationToken,
        pending: &PendingUpload,
        bytes: Bytes,
    ) -> ServiceResult<Document> {
        let size = bytes.len() as u64;
        if size != token.bytes() {
            return Err(ServiceError::FileCorrupted {
                filename: pending.original_filename.clone(),
                reason: format!("{} bytes received, {} reserved", size, token.bytes()),
            });
        }

        let checksum = format!("{:x}", md5::compute(&bytes));
        let location = self.blobs.put(bytes).await?;

        let record = NewDocument {
            owner_id: pending.owner_id,
            folder_id: pending.folder_id,
            filename: unique_filename(&pending.original_filename, &pending.file_type),
            original_filename: pending.original_filename.clone(),
            file_type: pending.file_type.clone(),
            location: location.clone(),
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            checksum,
        };
        let document = match self.store.create_document(record).await {
            Ok(document) => document,
            Err(err) => {
                self.delete_blob_quietly(&location).await;
                return Err(err);
            }
        };

        if let Err(err) = self.ledger.commit(token).await {
            if let Err(undo) = self.store.delete_document(document.id, pending.owner_id).await {
                error!(document_id = document.id, error = %undo, "failed to roll back document");
            }
            self.delete_blob_quietly(&location).await;
            return Err(err);
        }

        Ok(document)
    }

    /// Release a reservation on a failure path, logging instead of masking
    /// the original error.
    pub async fn release_quietly(&self, token: &ReservationToken) {
        if let Err(err) = self.ledger.release(token).await {
            error!(reservation = %token, error = %err, "failed to release reservation");
        }
    }

    async fn delete_blob_quietly(&self, location: &str) {
        if let Err(err) = self.blobs.delete(location).await {
            warn!(location, error = %err, "failed to remove orphaned blob");
        }
    }

    /// Delete a document owned by `user_id` and give its bytes back.
    pub async fn delete_document(&self, user_id: UserId, document_id: i64) -> ServiceResult<Document> {
        let document = self
            .store
            .delete_document(document_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))?;

        self.delete_blob_quietly(&document.location).await;
        let size = u64::try_from(document.size_bytes).unwrap_or(0);
        if let Err(err) = self.ledger.reclaim(user_id, size).await {
            // the record is already gone; report the deletion and flag the drift
            error!(user_id, document_id, size, error = %err, "failed to reclaim quota");
        }
        info!(user_id, document_id, "document deleted");
        Ok(document)
    }

    /// Fetch a document and its payload.
    pub async fn read_document(&self, user_id: UserId, document_id: i64) -> ServiceResult<(Document, Bytes)> {
        let document = self
            .store
            .get_document(document_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))?;
        let bytes = self.blobs.get(&document.location).await?;
        Ok((document, bytes))
    }

    /// Metadata of one document.
    pub async fn get_document(&self, user_id: UserId, document_id: i64) -> ServiceResult<Document> {
        self.store
            .get_document(document_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))
    }

    /// Page through the caller's documents. A folder filter must name one of
    /// the caller's folders.
    pub async fn list_documents(
        &self,
        user_id: UserId,
        query: &DocumentQuery,
    ) -> ServiceResult<DocumentPage> {
        self.ensure_folder(user_id, query.folder_id).await?;
        self.store.list_documents(user_id, query).await
    }

    /// Rename and/or move a document. Size and payload are untouched, so the
    /// quota is not involved.
    pub async fn update_document(
        &self,
        user_id: UserId,
        document_id: i64,
        update: DocumentUpdate,
    ) -> ServiceResult<Document> {
        let filename = match update.filename.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(name) if name.len() > MAX_FILENAME_LEN => {
                return Err(ServiceError::Validation(format!(
                    "filename longer than {} bytes",
                    MAX_FILENAME_LEN
                )));
            }
            Some(name) => Some(name.to_string()),
        };
        self.ensure_folder(user_id, update.folder_id).await?;

        let update = DocumentUpdate {
            filename,
            folder_id: update.folder_id,
        };
        let document = self
            .store
            .update_document(document_id, user_id, &update)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))?;
        info!(
            user_id,
            document_id,
            folder_id = ?document.folder_id,
            "document updated"
        );
        Ok(document)
    }

    pub async fn create_folder(
        &self,
        user_id: UserId,
        name: &str,
        parent_id: Option<i64>,
    ) -> ServiceResult<Folder> {
        let name = folder_name(name)?;
        self.store.create_folder(user_id, name, parent_id).await
    }

    pub async fn get_folder(&self, user_id: UserId, folder_id: i64) -> ServiceResult<Folder> {
        self.store
            .get_folder(folder_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("folder {}", folder_id)))
    }

    /// Child folders of `parent_id`, or the root folders when `None`.
    pub async fn list_folders(
        &self,
        user_id: UserId,
        parent_id: Option<i64>,
    ) -> ServiceResult<Vec<Folder>> {
        self.ensure_folder(user_id, parent_id).await?;
        self.store.list_folders(user_id, parent_id).await
    }

    pub async fn rename_folder(
        &self,
        user_id: UserId,
        folder_id: i64,
        name: &str,
    ) -> ServiceResult<Folder> {
        let name = folder_name(name)?;
        self.store
            .rename_folder(folder_id, user_id, name)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("folder {}", folder_id)))
    }

    /// Delete an empty folder owned by `user_id`.
    pub async fn delete_folder(&self, user_id: UserId, folder_id: i64) -> ServiceResult<Folder> {
        let folder = self
            .store
            .delete_folder(folder_id, user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("folder {}", folder_id)))?;
        info!(user_id, folder_id, "folder deleted");
        Ok(folder)
    }

    pub async fn storage_info(&self, user_id: UserId) -> ServiceResult<StorageInfo> {
        self.ledger.current_info(user_id).await
    }
}

fn folder_name(name: &str) -> ServiceResult<&str> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_FILENAME_LEN || name.contains('/') {
        return Err(ServiceError::Validation(format!("invalid folder name `{}`", name)));
    }
    Ok(name)
}

/// `{stem}_{uuid}.{ext}`, keeping stored names unique across uploads.
fn unique_filename(original: &str, file_type: &str) -> String {
    let stem = original
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(original);
    format!("{}_{}.{}", stem, Uuid::new_v4().simple(), file_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::harness;

    #[tokio::test]
    async fn moving_a_document_requires_an_owned_folder() {
        let h = harness().await;
        let doc = h
            .documents
            .upload_document(1, "plan.txt", None, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let foreign = h.documents.create_folder(2, "theirs", None).await.unwrap();

        let err = h
            .documents
            .update_document(
                1,
                doc.id,
                DocumentUpdate {
                    filename: None,
                    folder_id: Some(foreign.id),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let mine = h.documents.create_folder(1, "mine", None).await.unwrap();
        let moved = h
            .documents
            .update_document(
                1,
                doc.id,
                DocumentUpdate {
                    filename: Some("  plan-v2.txt ".into()),
                    folder_id: Some(mine.id),
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.original_filename, "plan-v2.txt");
        assert_eq!(moved.folder_id, Some(mine.id));
        assert_eq!(h.documents.storage_info(1).await.unwrap().used_space, 5);

        let listed = h
            .documents
            .list_documents(
                1,
                &DocumentQuery {
                    folder_id: Some(mine.id),
                    ..DocumentQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listed.items, vec![moved]);
    }

    #[tokio::test]
    async fn folder_operations_are_owner_scoped() {
        let h = harness().await;
        let folder = h.documents.create_folder(1, "reports", None).await.unwrap();

        assert!(matches!(
            h.documents.get_folder(2, folder.id).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            h.documents.list_folders(2, Some(folder.id)).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            h.documents.rename_folder(1, folder.id, " ").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            h.documents.delete_folder(2, folder.id).await,
            Err(ServiceError::NotFound(_))
        ));

        h.documents.delete_folder(1, folder.id).await.unwrap();
        assert!(h.documents.list_folders(1, None).await.unwrap().is_empty());
    }

    #[test]
    fn unique_filenames_keep_stem_and_type() {
        let first = unique_filename("Report.Final.PDF", "pdf");
        let second = unique_filename("Report.Final.PDF", "pdf");
        assert!(first.starts_with("Report.Final_"));
        assert!(first.ends_with(".pdf"));
        assert_ne!(first, second);
    }
}
