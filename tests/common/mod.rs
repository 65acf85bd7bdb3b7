//! Common test utilities: an app over an in-memory database and scratch
//! directories, plus request builders for JSON and multipart bodies.
#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use doc_store::{
    config::UploadLimits, db, routes::routes::routes, services::chunk_spool::ChunkSpool,
    state::AppState,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "doc-store-test-boundary";

pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    _dir: TempDir,
}

impl TestServer {
    /// Server with a `quota` byte default quota and otherwise default limits.
    pub async fn with_quota(quota: u64) -> Self {
        Self::with_limits(UploadLimits {
            default_quota_bytes: quota,
            ..UploadLimits::default()
        })
        .await
    }

    pub async fn with_limits(limits: UploadLimits) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = db::memory_pool().await.expect("in-memory database");
        let spool = ChunkSpool::new(dir.path().join("spool"));
        let state = AppState::new(
            Arc::new(pool),
            dir.path().join("objects"),
            spool,
            limits.clone(),
        );
        let router = routes(&limits).with_state(state.clone());
        Self {
            router,
            state,
            _dir: dir,
        }
    }

    pub async fn response(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    /// Send and decode the body as JSON (`Null` when empty).
    pub async fn send_json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = self.send(request).await;
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

/// One part of a multipart form.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        filename: &'a str,
        data: &'a [u8],
    },
}

pub fn file<'a>(filename: &'a str, data: &'a [u8]) -> Part<'a> {
    Part::File {
        name: "file",
        filename,
        data,
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                filename,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_request(uri: &str, user_id: i64, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-user-id", user_id.to_string())
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, user_id: i64, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", user_id.to_string());
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Multipart request for one chunk of `filename`.
pub fn chunk_request(
    user_id: i64,
    file_identifier: &str,
    index: u32,
    total_chunks: u32,
    total_size: u64,
    filename: &str,
    data: &[u8],
) -> Request<Body> {
    let index = index.to_string();
    let total_chunks = total_chunks.to_string();
    let total_size = total_size.to_string();
    multipart_request(
        "/uploads/chunks",
        user_id,
        &[
            Part::Text("fileIdentifier", file_identifier),
            Part::Text("chunkIndex", &index),
            Part::Text("totalChunks", &total_chunks),
            Part::Text("totalSize", &total_size),
            Part::Text("filename", filename),
            file(filename, data),
        ],
    )
}
