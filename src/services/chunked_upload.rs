//! src/services/chunked_upload.rs
//!
//! Chunked upload coordinator. Sessions are keyed by (user, file identifier)
//! and each key owns an async mutex, so chunks for one file are applied one
//! at a time while different files upload in parallel. The caller that adds
//! the last missing index performs the merge and commit; nobody else can see
//! the session complete because the slot is retired under the same lock.
//!
//! The session's quota reservation is taken when the first chunk arrives and
//! settled exactly once: committed by the merge, or released on cancel,
//! expiry, or any failed merge.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        UserId,
        document::Document,
        upload::{ChunkMeta, ChunkUploadResponse, UploadSession, UploadState},
    },
    services::{
        chunk_spool::ChunkSpool,
        document_service::{DocumentService, PendingUpload},
        quota_ledger::ReservationToken,
    },
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MAX_IDENTIFIER_LEN: usize = 128;

type SessionKey = (UserId, String);

struct SessionEntry {
    session: UploadSession,
    reservation: ReservationToken,
    file_type: String,
    received_bytes: u64,
}

/// Per-key slot. A retired slot has been removed from the map; tasks that
/// were queued on its lock must look the key up again.
#[derive(Default)]
struct SessionSlot {
    entry: Option<SessionEntry>,
    retired: bool,
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

pub struct ChunkedUploadCoordinator {
    documents: Arc<DocumentService>,
    spool: ChunkSpool,
    sessions: DashMap<SessionKey, SharedSlot>,
    session_ttl: chrono::Duration,
    max_lifetime: chrono::Duration,
}

impl ChunkedUploadCoordinator {
    pub fn new(documents: Arc<DocumentService>, spool: ChunkSpool) -> Self {
        let limits = documents.limits();
        let session_ttl = to_chrono(limits.session_ttl);
        let max_lifetime = to_chrono(limits.max_session_lifetime);
        Self {
            documents,
            spool,
            sessions: DashMap::new(),
            session_ttl,
            max_lifetime,
        }
    }

    /// Number of sessions currently holding a reservation.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Accept one chunk, merging and committing the document when it is the
    /// last missing index.
    pub async fn upload_chunk(
        &self,
        user_id: UserId,
        chunk: Bytes,
        meta: ChunkMeta,
    ) -> ServiceResult<ChunkUploadResponse> {
        let file_type = self.validate_chunk(&chunk, &meta)?;
        debug!(
            user_id,
            file_identifier = %meta.file_identifier,
            chunk_index = meta.chunk_index,
            total_chunks = meta.total_chunks,
            "received chunk"
        );

        let key = (user_id, meta.file_identifier.clone());
        loop {
            let slot = self.slot(&key);
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            return self
                .accept_chunk(&key, &slot, &mut guard, chunk, meta, file_type)
                .await;
        }
    }

    async fn accept_chunk(
        &self,
        key: &SessionKey,
        slot: &SharedSlot,
        guard: &mut SessionSlot,
        chunk: Bytes,
        meta: ChunkMeta,
        file_type: String,
    ) -> ServiceResult<ChunkUploadResponse> {
        let user_id = key.0;
        let now = Utc::now();

        let mut entry = match guard.entry.take() {
            Some(entry) => {
                if let Some(reason) = entry.session.mismatch(&meta) {
                    guard.entry = Some(entry);
                    return Err(ServiceError::SessionMismatch {
                        file_identifier: meta.file_identifier,
                        reason,
                    });
                }
                if entry.session.is_expired_at(now) {
                    self.terminate(entry, UploadState::Expired).await;
                    self.retire(key, slot, guard);
                    return Err(ServiceError::SessionExpired(meta.file_identifier));
                }
                entry
            }
            None => match self.open_session(user_id, &meta, file_type, now).await {
                Ok(entry) => entry,
                Err(err) => {
                    self.retire(key, slot, guard);
                    return Err(err);
                }
            },
        };

        let index = meta.chunk_index;
        if entry.session.received.contains(&index) {
            debug!(user_id, file_identifier = %meta.file_identifier, chunk_index = index, "duplicate chunk ignored");
        } else {
            let size = chunk.len() as u64;
            if entry.received_bytes + size > entry.session.total_size {
                let err = ServiceError::Validation(format!(
                    "chunk {} would grow `{}` past its declared {} bytes",
                    index, meta.file_identifier, entry.session.total_size
                ));
                self.park_or_abort(key, slot, guard, entry).await;
                return Err(err);
            }
            if let Err(err) = self
                .spool
                .write_chunk(user_id, &meta.file_identifier, index, &chunk)
                .await
            {
                warn!(user_id, file_identifier = %meta.file_identifier, chunk_index = index, error = %err, "failed to spool chunk");
                self.park_or_abort(key, slot, guard, entry).await;
                return Err(ServiceError::Io(err));
            }
            entry.session.received.insert(index);
            entry.received_bytes += size;
            entry.session.state = UploadState::Receiving;
        }
        entry.session.expires_at = self.next_expiry(entry.session.created_at, now);

        if !entry.session.is_complete() {
            let response = ChunkUploadResponse {
                file_identifier: meta.file_identifier,
                chunk_index: index,
                completed: false,
                uploaded_chunks: entry.session.uploaded_chunks(),
                document: None,
                progress: entry.session.progress(),
            };
            guard.entry = Some(entry);
            return Ok(response);
        }

        // Last missing index: this caller owns the merge.
        entry.session.state = UploadState::Complete;
        let uploaded_chunks = entry.session.uploaded_chunks();
        let outcome = self.merge_and_commit(entry).await;
        self.retire(key, slot, guard);
        let document = outcome?;

        Ok(ChunkUploadResponse {
            file_identifier: meta.file_identifier,
            chunk_index: index,
            completed: true,
            uploaded_chunks,
            document: Some(document),
            progress: 100.0,
        })
    }

    /// First chunk for a key: check the folder and reserve the declared size
    /// before any session state exists.
    async fn open_session(
        &self,
        user_id: UserId,
        meta: &ChunkMeta,
        file_type: String,
        now: DateTime<Utc>,
    ) -> ServiceResult<SessionEntry> {
        self.documents.ensure_folder(user_id, meta.folder_id).await?;
        let reservation = self
            .documents
            .ledger()
            .reserve(user_id, meta.total_size)
            .await?;

        info!(
            user_id,
            file_identifier = %meta.file_identifier,
            total_chunks = meta.total_chunks,
            total_size = meta.total_size,
            "opened chunked upload"
        );
        Ok(SessionEntry {
            session: UploadSession {
                user_id,
                file_identifier: meta.file_identifier.clone(),
                total_chunks: meta.total_chunks,
                total_size: meta.total_size,
                original_filename: meta.filename.clone(),
                target_folder_id: meta.folder_id,
                received: BTreeSet::new(),
                state: UploadState::New,
                created_at: now,
                expires_at: self.next_expiry(now, now),
            },
            reservation,
            file_type,
            received_bytes: 0,
        })
    }

    /// Put a session back after a rejected chunk, or tear it down while it is
    /// still `New`, that is when the rejected chunk was the one that opened it.
    async fn park_or_abort(
        &self,
        key: &SessionKey,
        slot: &SharedSlot,
        guard: &mut SessionSlot,
        entry: SessionEntry,
    ) {
        if entry.session.state == UploadState::New {
            self.terminate(entry, UploadState::Cancelled).await;
            self.retire(key, slot, guard);
        } else {
            guard.entry = Some(entry);
        }
    }

    async fn merge_and_commit(&self, entry: SessionEntry) -> ServiceResult<Document> {
        let SessionEntry {
            mut session,
            reservation,
            file_type,
            ..
        } = entry;

        let merged = match self.merge(&session).await {
            Ok(merged) => merged,
            Err(err) => {
                warn!(
                    user_id = session.user_id,
                    file_identifier = %session.file_identifier,
                    received = ?session.received,
                    total_chunks = session.total_chunks,
                    total_size = session.total_size,
                    error = %err,
                    "chunk merge failed"
                );
                self.documents.release_quietly(&reservation).await;
                self.spool
                    .discard(session.user_id, &session.file_identifier)
                    .await;
                session.state = UploadState::Cancelled;
                return Err(err);
            }
        };

        let pending = PendingUpload {
            owner_id: session.user_id,
            original_filename: session.original_filename.clone(),
            file_type,
            folder_id: session.target_folder_id,
        };
        let outcome = self
            .documents
            .finish_upload(reservation, pending, merged)
            .await;
        self.spool
            .discard(session.user_id, &session.file_identifier)
            .await;

        session.state = if outcome.is_ok() {
            UploadState::Merged
        } else {
            UploadState::Cancelled
        };
        info!(
            user_id = session.user_id,
            file_identifier = %session.file_identifier,
            state = ?session.state,
            "chunked upload finished"
        );
        outcome
    }

    /// Concatenate chunks `0..total_chunks` in index order and check the
    /// result against the declared size.
    async fn merge(&self, session: &UploadSession) -> ServiceResult<Bytes> {
        let mut merged = BytesMut::with_capacity(session.total_size as usize);
        for index in 0..session.total_chunks {
            let chunk = self
                .spool
                .read_chunk(session.user_id, &session.file_identifier, index)
                .await
                .map_err(|err| ServiceError::FileCorrupted {
                    filename: session.original_filename.clone(),
                    reason: format!("chunk {} unreadable: {}", index, err),
                })?;
            merged.extend_from_slice(&chunk);
        }

        if merged.len() as u64 != session.total_size {
            return Err(ServiceError::FileCorrupted {
                filename: session.original_filename.clone(),
                reason: format!(
                    "merged length {} does not match declared size {}",
                    merged.len(),
                    session.total_size
                ),
            });
        }
        Ok(merged.freeze())
    }

    /// Sorted indexes received so far; empty when no session exists.
    pub async fn get_uploaded_chunks(&self, user_id: UserId, file_identifier: &str) -> Vec<u32> {
        let Some(slot) = self.existing_slot(user_id, file_identifier) else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        guard
            .entry
            .as_ref()
            .map(|entry| entry.session.uploaded_chunks())
            .unwrap_or_default()
    }

    /// Release the reservation and drop the chunks of an open session.
    /// Unknown sessions are ignored.
    pub async fn cancel_chunked_upload(&self, user_id: UserId, file_identifier: &str) {
        let key = (user_id, file_identifier.to_string());
        let Some(slot) = self.existing_slot(user_id, file_identifier) else {
            debug!(user_id, file_identifier, "cancel for unknown upload ignored");
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.entry.take() {
            self.terminate(entry, UploadState::Cancelled).await;
            self.retire(&key, &slot, &mut guard);
        }
    }

    /// Expire every session whose deadline has passed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire every session whose deadline is before `now`; returns the
    /// number of sessions expired.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let candidates: Vec<(SessionKey, SharedSlot)> = self
            .sessions
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut expired = 0;
        for (key, slot) in candidates {
            let mut guard = slot.lock().await;
            let is_due = guard
                .entry
                .as_ref()
                .is_some_and(|entry| entry.session.is_expired_at(now));
            if !is_due {
                continue;
            }
            if let Some(entry) = guard.entry.take() {
                self.terminate(entry, UploadState::Expired).await;
                self.retire(&key, &slot, &mut guard);
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "swept expired chunked uploads");
        }
        expired
    }

    /// Settle a session that ends without a document.
    async fn terminate(&self, entry: SessionEntry, state: UploadState) {
        let SessionEntry {
            mut session,
            reservation,
            ..
        } = entry;
        self.documents.release_quietly(&reservation).await;
        self.spool
            .discard(session.user_id, &session.file_identifier)
            .await;
        session.state = state;
        info!(
            user_id = session.user_id,
            file_identifier = %session.file_identifier,
            received = session.received.len(),
            total_chunks = session.total_chunks,
            state = ?session.state,
            "chunked upload closed"
        );
    }

    fn slot(&self, key: &SessionKey) -> SharedSlot {
        self.sessions.entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, user_id: UserId, file_identifier: &str) -> Option<SharedSlot> {
        self.sessions
            .get(&(user_id, file_identifier.to_string()))
            .map(|item| item.value().clone())
    }

    /// Remove `slot` from the map while its lock is held.
    fn retire(&self, key: &SessionKey, slot: &SharedSlot, guard: &mut SessionSlot) {
        guard.entry = None;
        guard.retired = true;
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Idle deadline after activity at `now`, capped by the hard lifetime.
    fn next_expiry(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let idle = now + self.session_ttl;
        let hard = created_at + self.max_lifetime;
        idle.min(hard)
    }

    fn validate_chunk(&self, chunk: &Bytes, meta: &ChunkMeta) -> ServiceResult<String> {
        validate_identifier(&meta.file_identifier)?;
        if meta.total_chunks == 0 {
            return Err(ServiceError::Validation(
                "totalChunks must be at least 1".into(),
            ));
        }
        if meta.chunk_index >= meta.total_chunks {
            return Err(ServiceError::Validation(format!(
                "chunkIndex {} out of range for {} chunks",
                meta.chunk_index, meta.total_chunks
            )));
        }
        if chunk.is_empty() {
            return Err(ServiceError::Validation("chunk body is empty".into()));
        }
        self.documents.validate_upload(&meta.filename, meta.total_size)
    }
}

/// File identifiers become a spool directory name, so they are restricted to
/// one safe path segment.
fn validate_identifier(identifier: &str) -> ServiceResult<()> {
    let valid = !identifier.is_empty()
        && identifier.len() <= MAX_IDENTIFIER_LEN
        && !identifier.starts_with('.')
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "invalid file identifier `{}`",
            identifier
        )))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
