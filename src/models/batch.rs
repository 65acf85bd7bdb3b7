//! Partial-success reporting for multi-item operations.

use crate::models::document::Document;
use serde::{Deserialize, Serialize};

/// Failure record for a single batch item.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// Document id for delete items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<i64>,

    /// Original filename for upload items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    pub error_code: String,
    pub error_message: String,
}

/// Outcome of a batch call.
///
/// `success_count + failure_count` always equals the number of input items,
/// and both lists keep the input order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub success_ids: Vec<i64>,
    pub success_documents: Vec<Document>,
    pub errors: Vec<OperationError>,
}

impl BatchResult {
    pub fn push_document(&mut self, document: Document) {
        self.success_count += 1;
        self.success_ids.push(document.id);
        self.success_documents.push(document);
    }

    pub fn push_id(&mut self, id: i64) {
        self.success_count += 1;
        self.success_ids.push(id);
    }

    pub fn push_error(&mut self, error: OperationError) {
        self.failure_count += 1;
        self.errors.push(error);
    }
}
