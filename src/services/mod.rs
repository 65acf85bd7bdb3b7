pub mod batch_executor;
pub mod blob_store;
pub mod chunk_spool;
pub mod chunked_upload;
pub mod document_service;
pub mod metadata_store;
pub mod quota_ledger;
