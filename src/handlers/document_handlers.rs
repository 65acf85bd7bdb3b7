//! HTTP handlers for documents, folders and storage accounting.
//! Parsing and status mapping only; the services own every rule.

use crate::{
    errors::AppError,
    handlers::{identity::Caller, upload_handlers::parse_optional},
    models::{
        batch::BatchResult,
        document::{Document, DocumentPage, DocumentQuery, DocumentUpdate},
        folder::Folder,
        quota::StorageInfo,
    },
    services::batch_executor::UploadItem,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteRequest {
    pub document_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RenameFolderRequest {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderListQuery {
    pub parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuotaRequest {
    pub total_quota: u64,
}

/// Files and text fields of a multipart form. Any part carrying a file name
/// is treated as a file.
struct UploadForm {
    files: Vec<UploadItem>,
    fields: HashMap<String, String>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm {
        files: Vec::new(),
        fields: HashMap::new(),
    };
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let bytes = field.bytes().await?;
                form.files.push(UploadItem { filename, bytes });
            }
            None => {
                form.fields.insert(name, field.text().await?);
            }
        }
    }
    Ok(form)
}

/// `POST /documents`
pub async fn upload_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let mut form = read_form(multipart).await?;
    let folder_id = parse_optional(&form.fields, "folderId")?;
    if form.files.len() != 1 {
        return Err(AppError::bad_request("expected exactly one file part"));
    }
    let UploadItem { filename, bytes } = form.files.remove(0);

    let document = state
        .documents
        .upload_document(user_id, &filename, folder_id, bytes)
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// `POST /documents/batch`
pub async fn batch_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    multipart: Multipart,
) -> Result<Json<BatchResult>, AppError> {
    let form = read_form(multipart).await?;
    let folder_id = parse_optional(&form.fields, "folderId")?;
    if form.files.is_empty() {
        return Err(AppError::bad_request("no files supplied"));
    }

    let result = state
        .batches
        .batch_upload(user_id, form.files, folder_id)
        .await;
    Ok(Json(result))
}

/// `POST /documents/batch-delete`
pub async fn batch_delete(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(request): Json<BatchDeleteRequest>,
) -> Json<BatchResult> {
    Json(
        state
            .batches
            .batch_delete(user_id, request.document_ids)
            .await,
    )
}

/// `GET /documents?folderId=&fileType=&keyword=&page=&size=`
pub async fn list_documents(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<DocumentPage>, AppError> {
    Ok(Json(state.documents.list_documents(user_id, &query).await?))
}

/// `GET /documents/{id}`
pub async fn get_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(state.documents.get_document(user_id, id).await?))
}

/// `PATCH /documents/{id}` - rename and/or move.
pub async fn update_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
    Json(update): Json<DocumentUpdate>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(state.documents.update_document(user_id, id, update).await?))
}

/// `DELETE /documents/{id}`
pub async fn delete_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.documents.delete_document(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /documents/{id}/content`
pub async fn download_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let (document, bytes) = state.documents.read_document(user_id, id).await?;

    let mut response = Body::from(bytes).into_response();
    set_document_headers(response.headers_mut(), &document);
    Ok(response)
}

/// `POST /folders`
pub async fn create_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(request): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let folder = state
        .documents
        .create_folder(user_id, &request.name, request.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// `GET /folders?parentId=`
pub async fn list_folders(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Query(query): Query<FolderListQuery>,
) -> Result<Json<Vec<Folder>>, AppError> {
    Ok(Json(state.documents.list_folders(user_id, query.parent_id).await?))
}

/// `GET /folders/{id}`
pub async fn get_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<Json<Folder>, AppError> {
    Ok(Json(state.documents.get_folder(user_id, id).await?))
}

/// `PATCH /folders/{id}`
pub async fn rename_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
    Json(request): Json<RenameFolderRequest>,
) -> Result<Json<Folder>, AppError> {
    Ok(Json(
        state
            .documents
            .rename_folder(user_id, id, &request.name)
            .await?,
    ))
}

/// `DELETE /folders/{id}`
pub async fn delete_folder(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.documents.delete_folder(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /folders/{id}/documents`
pub async fn folder_documents(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<i64>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<DocumentPage>, AppError> {
    let query = DocumentQuery {
        folder_id: Some(id),
        ..query
    };
    Ok(Json(state.documents.list_documents(user_id, &query).await?))
}

/// `GET /storage`
pub async fn storage_info(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> Result<Json<StorageInfo>, AppError> {
    Ok(Json(state.documents.storage_info(user_id).await?))
}

/// `PUT /storage/quota`
pub async fn update_quota(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(request): Json<UpdateQuotaRequest>,
) -> Result<Json<StorageInfo>, AppError> {
    let info = state
        .documents
        .ledger()
        .update_quota(user_id, request.total_quota)
        .await?;
    Ok(Json(info))
}

fn set_document_headers(headers: &mut HeaderMap, document: &Document) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(document.size_bytes));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", document.checksum)) {
        headers.insert(header::ETAG, value);
    }

    // Quotes and non-ASCII bytes cannot go in a plain quoted filename.
    let safe_name: String = document
        .original_filename
        .chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"') || c == ' ' { c } else { '_' })
        .collect();
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
