//! Shared application state handed to every handler.

use crate::{
    config::UploadLimits,
    services::{
        batch_executor::BatchExecutor,
        blob_store::{BlobStore, FsBlobStore},
        chunk_spool::ChunkSpool,
        chunked_upload::ChunkedUploadCoordinator,
        document_service::DocumentService,
        metadata_store::{MetadataStore, SqliteMetadataStore},
        quota_ledger::QuotaLedger,
    },
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    /// Root directory of the blob store, probed by readiness checks.
    pub storage_dir: PathBuf,
    pub documents: Arc<DocumentService>,
    pub uploads: Arc<ChunkedUploadCoordinator>,
    pub batches: Arc<BatchExecutor>,
}

impl AppState {
    /// Wire the services over one pool, one blob directory and one spool.
    pub fn new(
        db: Arc<SqlitePool>,
        storage_dir: impl Into<PathBuf>,
        spool: ChunkSpool,
        limits: UploadLimits,
    ) -> Self {
        let storage_dir = storage_dir.into();
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db.clone()));
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(storage_dir.clone()));
        let ledger = Arc::new(QuotaLedger::new(store.clone(), limits.default_quota_bytes));
        let concurrency = limits.batch_concurrency;
        let documents = Arc::new(DocumentService::new(store, blobs, ledger, limits));
        let uploads = Arc::new(ChunkedUploadCoordinator::new(documents.clone(), spool));
        let batches = Arc::new(BatchExecutor::new(documents.clone(), concurrency));

        Self {
            db,
            storage_dir,
            documents,
            uploads,
            batches,
        }
    }
}
