//! Core data models for the document store.
//!
//! Persistent records (`Document`, `Folder`, `QuotaRecord`) map onto SQLite
//! rows via `sqlx::FromRow`; the rest are request/response shapes shared by
//! the services and the HTTP layer.

pub mod batch;
pub mod document;
pub mod folder;
pub mod quota;
pub mod upload;

/// Numeric identity of an already-authenticated caller.
pub type UserId = i64;
