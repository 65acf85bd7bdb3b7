//! Document storage with chunked uploads, per-user quotas and batch
//! operations, served over HTTP by the `doc-store` binary.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;
