pub mod document_handlers;
pub mod health_handlers;
pub mod identity;
pub mod upload_handlers;
