//! HTTP handlers for chunked uploads.

use crate::{
    errors::AppError,
    handlers::identity::Caller,
    models::upload::{ChunkMeta, ChunkUploadResponse},
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
};
use bytes::Bytes;
use std::{collections::HashMap, str::FromStr};

/// `POST /uploads/chunks`
///
/// Multipart body with the chunk in a `file` part and the metadata as text
/// parts: `fileIdentifier`, `chunkIndex`, `totalChunks`, `totalSize`,
/// `filename` (defaults to the file part's name) and optional `folderId`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let mut fields = HashMap::new();
    let mut chunk: Option<(Option<String>, Bytes)> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().map(str::to_string);
            chunk = Some((file_name, field.bytes().await?));
        } else {
            fields.insert(name, field.text().await?);
        }
    }

    let (file_name, body) = chunk.ok_or_else(|| AppError::bad_request("missing `file` part"))?;
    let filename = fields
        .remove("filename")
        .or(file_name)
        .ok_or_else(|| AppError::bad_request("missing `filename`"))?;

    let meta = ChunkMeta {
        file_identifier: required(&fields, "fileIdentifier")?,
        chunk_index: parse_required(&fields, "chunkIndex")?,
        total_chunks: parse_required(&fields, "totalChunks")?,
        total_size: parse_required(&fields, "totalSize")?,
        filename,
        folder_id: parse_optional(&fields, "folderId")?,
    };

    let response = state.uploads.upload_chunk(user_id, body, meta).await?;
    Ok(Json(response))
}

/// `GET /uploads/{fileIdentifier}/chunks`
pub async fn get_uploaded_chunks(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(file_identifier): Path<String>,
) -> Json<Vec<u32>> {
    Json(
        state
            .uploads
            .get_uploaded_chunks(user_id, &file_identifier)
            .await,
    )
}

/// `DELETE /uploads/{fileIdentifier}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(file_identifier): Path<String>,
) -> StatusCode {
    state
        .uploads
        .cancel_chunked_upload(user_id, &file_identifier)
        .await;
    StatusCode::NO_CONTENT
}

pub(crate) fn required(fields: &HashMap<String, String>, key: &str) -> Result<String, AppError> {
    fields
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("missing `{}`", key)))
}

fn parse_required<T: FromStr>(fields: &HashMap<String, String>, key: &str) -> Result<T, AppError> {
    required(fields, key)?
        .parse()
        .map_err(|_| AppError::bad_request(format!("`{}` is not a valid number", key)))
}

/// Absent or blank means `None`.
pub(crate) fn parse_optional<T: FromStr>(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match fields.get(key).map(|value| value.trim()) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("`{}` is not a valid number", key))),
    }
}
