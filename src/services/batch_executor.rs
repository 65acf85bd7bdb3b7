//! src/services/batch_executor.rs
//!
//! Runs many independent document operations with bounded concurrency and
//! reports per-item outcomes. One item failing never affects another, and
//! results come back in input order.

use crate::{
    errors::ServiceError,
    models::{
        UserId,
        batch::{BatchResult, OperationError},
    },
    services::document_service::DocumentService,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::{future::Future, sync::Arc};
use tokio::task::JoinError;
use tracing::{info, warn};

const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// One file of a batch upload.
#[derive(Clone, Debug)]
pub struct UploadItem {
    pub filename: String,
    pub bytes: Bytes,
}

pub struct BatchExecutor {
    documents: Arc<DocumentService>,
    concurrency: usize,
}

impl BatchExecutor {
    pub fn new(documents: Arc<DocumentService>, concurrency: usize) -> Self {
        Self {
            documents,
            concurrency: concurrency.max(1),
        }
    }

    /// Upload every item into `folder_id` independently.
    pub async fn batch_upload(
        &self,
        user_id: UserId,
        items: Vec<UploadItem>,
        folder_id: Option<i64>,
    ) -> BatchResult {
        let total = items.len();
        let outcomes = self
            .run(items, |documents, item: UploadItem| async move {
                documents
                    .upload_document(user_id, &item.filename, folder_id, item.bytes)
                    .await
            })
            .await;

        let mut result = BatchResult::default();
        for (item, outcome) in outcomes {
            match outcome {
                Ok(Ok(document)) => result.push_document(document),
                Ok(Err(err)) => result.push_error(OperationError {
                    document_id: None,
                    filename: Some(item.filename),
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                }),
                Err(join) => result.push_error(OperationError {
                    document_id: None,
                    filename: Some(item.filename),
                    error_code: INTERNAL_ERROR.to_string(),
                    error_message: join_message(&join),
                }),
            }
        }
        info!(
            user_id,
            total,
            succeeded = result.success_count,
            failed = result.failure_count,
            "batch upload finished"
        );
        result
    }

    /// Delete every id independently. Ids the user does not own count as
    /// not found.
    pub async fn batch_delete(&self, user_id: UserId, ids: Vec<i64>) -> BatchResult {
        let total = ids.len();
        let outcomes = self
            .run(ids, |documents, id: i64| async move {
                documents.delete_document(user_id, id).await
            })
            .await;

        let mut result = BatchResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Ok(_)) => result.push_id(id),
                Ok(Err(err)) => result.push_error(OperationError {
                    document_id: Some(id),
                    filename: None,
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                }),
                Err(join) => result.push_error(OperationError {
                    document_id: Some(id),
                    filename: None,
                    error_code: INTERNAL_ERROR.to_string(),
                    error_message: join_message(&join),
                }),
            }
        }
        info!(
            user_id,
            total,
            succeeded = result.success_count,
            failed = result.failure_count,
            "batch delete finished"
        );
        result
    }

    /// Spawn one task per item, at most `concurrency` at a time, and pair
    /// each outcome with its input in the original order.
    async fn run<I, F, Fut, T>(
        &self,
        items: Vec<I>,
        op: F,
    ) -> Vec<(I, Result<Result<T, ServiceError>, JoinError>)>
    where
        I: Clone + Send + 'static,
        F: Fn(Arc<DocumentService>, I) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut outcomes: Vec<_> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let task = tokio::spawn(op(self.documents.clone(), item.clone()));
                async move { (index, item, task.await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _, _)| *index);
        outcomes
            .into_iter()
            .map(|(_, item, outcome)| {
                if let Err(join) = &outcome {
                    warn!(error = %join, "batch item task failed");
                }
                (item, outcome)
            })
            .collect()
    }
}

fn join_message(err: &JoinError) -> String {
    if err.is_panic() {
        "item processing panicked".to_string()
    } else {
        "item processing was cancelled".to_string()
    }
}
