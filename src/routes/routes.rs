//! Defines routes for uploads, documents, folders and storage accounting.
//!
//! ## Structure
//! - **Chunked uploads**
//!   - `POST   /uploads/chunks` - upload one chunk (multipart)
//!   - `GET    /uploads/{fileIdentifier}/chunks` - indexes received so far
//!   - `DELETE /uploads/{fileIdentifier}` - cancel and release the reservation
//!
//! - **Documents**
//!   - `POST   /documents` - single upload (multipart)
//!   - `POST   /documents/batch` - multi-file upload with per-file outcomes
//!   - `GET    /documents` - filtered, paged listing
//!   - `POST   /documents/batch-delete` - multi-id delete with per-id outcomes
//!   - `GET    /documents/{id}` - metadata
//!   - `PATCH  /documents/{id}` - rename or move
//!   - `DELETE /documents/{id}` - delete one document
//!   - `GET    /documents/{id}/content` - download the payload
//!
//! - **Folders & storage**
//!   - `POST   /folders`, `GET /folders?parentId=`
//!   - `GET    /folders/{id}`, `PATCH /folders/{id}`, `DELETE /folders/{id}`
//!   - `GET    /folders/{id}/documents`
//!   - `GET    /storage`, `PUT /storage/quota`
//!
//! Every route except the health probes requires the `x-user-id` header.

use crate::{
    config::UploadLimits,
    handlers::{
        document_handlers::{
            batch_delete, batch_upload, create_folder, delete_document, delete_folder,
            download_document, folder_documents, get_document, get_folder, list_documents,
            list_folders, rename_folder, storage_info, update_document, update_quota,
            upload_document,
        },
        health_handlers::{healthz, readyz},
        upload_handlers::{cancel_upload, get_uploaded_chunks, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Room for multipart boundaries and text fields around the file parts.
const FORM_OVERHEAD: u64 = 1024 * 1024;

/// Build the router. Body limits follow the configured upload limits.
pub fn routes(limits: &UploadLimits) -> Router<AppState> {
    let single_limit = body_limit(limits.max_file_size);
    let batch_limit = body_limit(limits.default_quota_bytes.max(limits.max_file_size));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // chunked uploads
        .route(
            "/uploads/chunks",
            post(upload_chunk).layer(DefaultBodyLimit::max(single_limit)),
        )
        .route("/uploads/{file_identifier}/chunks", get(get_uploaded_chunks))
        .route("/uploads/{file_identifier}", delete(cancel_upload))
        // documents
        .route(
            "/documents",
            post(upload_document)
                .layer(DefaultBodyLimit::max(single_limit))
                .get(list_documents),
        )
        .route(
            "/documents/batch",
            post(batch_upload).layer(DefaultBodyLimit::max(batch_limit)),
        )
        .route("/documents/batch-delete", post(batch_delete))
        .route(
            "/documents/{id}",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
        .route("/documents/{id}/content", get(download_document))
        // folders & storage
        .route("/folders", post(create_folder).get(list_folders))
        .route(
            "/folders/{id}",
            get(get_folder).patch(rename_folder).delete(delete_folder),
        )
        .route("/folders/{id}/documents", get(folder_documents))
        .route("/storage", get(storage_info))
        .route("/storage/quota", put(update_quota))
}

fn body_limit(payload: u64) -> usize {
    usize::try_from(payload.saturating_add(FORM_OVERHEAD)).unwrap_or(usize::MAX)
}
