//! Chunked and batch uploads competing for one account must never overrun
//! its quota or leave reservations behind.

mod common;

use bytes::Bytes;
use common::TestServer;
use doc_store::{
    AppState,
    config::UploadLimits,
    db,
    errors::ServiceError,
    models::upload::ChunkMeta,
    services::{batch_executor::UploadItem, chunk_spool::ChunkSpool},
};
use std::sync::Arc;

fn meta(id: &str, index: u32) -> ChunkMeta {
    ChunkMeta {
        file_identifier: id.to_string(),
        chunk_index: index,
        total_chunks: 2,
        total_size: 200,
        filename: "part.pdf".into(),
        folder_id: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_uploads_never_overrun_the_quota() {
    let server = TestServer::with_quota(1000).await;
    let state = server.state.clone();

    let mut tasks = Vec::new();
    for n in 0..6 {
        let uploads = state.uploads.clone();
        tasks.push(tokio::spawn(async move {
            let id = format!("session-{}", n);
            match uploads
                .upload_chunk(1, Bytes::from(vec![1; 100]), meta(&id, 1))
                .await
            {
                Ok(_) => {
                    let last = uploads
                        .upload_chunk(1, Bytes::from(vec![0; 100]), meta(&id, 0))
                        .await
                        .unwrap();
                    assert!(last.completed);
                    200
                }
                Err(ServiceError::QuotaExceeded { .. }) => 0,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }));
    }

    let batches = state.batches.clone();
    let batch = tokio::spawn(async move {
        let items = (0..5)
            .map(|n| UploadItem {
                filename: format!("batch-{}.txt", n),
                bytes: Bytes::from(vec![2; 150]),
            })
            .collect();
        batches.batch_upload(1, items, None).await
    });

    let mut chunked_bytes = 0u64;
    for task in tasks {
        chunked_bytes += task.await.unwrap();
    }
    let result = batch.await.unwrap();
    assert_eq!(result.success_count + result.failure_count, 5);
    assert!(result
        .errors
        .iter()
        .all(|e| e.error_code == "QUOTA_EXCEEDED"));

    let batch_bytes = result.success_count as u64 * 150;
    let info = state.documents.storage_info(1).await.unwrap();
    assert_eq!(info.used_space, chunked_bytes + batch_bytes);
    assert!(info.used_space <= 1000);
    assert_eq!(state.documents.ledger().pending_bytes(1).await, 0);
    assert_eq!(state.uploads.active_sessions(), 0);
}

#[tokio::test]
async fn expired_sessions_return_their_space() {
    let server = TestServer::with_quota(1000).await;
    let state = &server.state;

    state
        .uploads
        .upload_chunk(1, Bytes::from(vec![1; 100]), meta("stale", 0))
        .await
        .unwrap();
    assert_eq!(state.documents.storage_info(1).await.unwrap().remaining_space, 800);

    let later = chrono::Utc::now() + chrono::Duration::days(2);
    assert_eq!(state.uploads.sweep_expired_at(later).await, 1);
    assert_eq!(state.documents.storage_info(1).await.unwrap().remaining_space, 1000);

    // the identifier is free again
    let fresh = state
        .uploads
        .upload_chunk(1, Bytes::from(vec![1; 100]), meta("stale", 1))
        .await
        .unwrap();
    assert_eq!(fresh.uploaded_chunks, vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_first_uploads_share_a_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("meta.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let state = AppState::new(
        Arc::new(pool),
        dir.path().join("objects"),
        ChunkSpool::new(dir.path().join("spool")),
        UploadLimits {
            default_quota_bytes: 1000,
            ..UploadLimits::default()
        },
    );

    let mut tasks = Vec::new();
    for user in 1..=40i64 {
        let documents = state.documents.clone();
        tasks.push(tokio::spawn(async move {
            documents
                .upload_document(user, "notes.txt", None, Bytes::from(vec![3; 100]))
                .await
        }));
    }

    let mut failures = Vec::new();
    for task in tasks {
        if let Err(err) = task.await.unwrap() {
            failures.push(err.to_string());
        }
    }
    assert!(failures.is_empty(), "failed uploads: {:?}", failures);

    for user in 1..=40i64 {
        let info = state.documents.storage_info(user).await.unwrap();
        assert_eq!(info.used_space, 100);
        assert_eq!(state.documents.ledger().pending_bytes(user).await, 0);
    }
}
