//! src/services/quota_ledger.rs
//!
//! Per-user storage accounting with a three-phase protocol:
//! `reserve` takes bytes out of the remaining allowance, then exactly one of
//! `commit` (bytes become used) or `release` (bytes return) settles the
//! reservation. Committed usage and the account total are persisted through
//! the metadata store; pending reservations live here.
//!
//! Every operation for one user runs under that user's own async mutex, so
//! the quota check and the pending update are linearized per account while
//! different users never contend.

use crate::{
    errors::{ServiceError, ServiceResult},
    models::{
        UserId,
        quota::{QuotaRecord, StorageInfo},
    },
    services::metadata_store::MetadataStore,
};
use dashmap::DashMap;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle for bytes provisionally deducted from a user's quota.
///
/// Only the ledger that issued a token can settle it.
#[derive(Clone, PartialEq, Eq)]
pub struct ReservationToken {
    ledger_id: Uuid,
    user_id: UserId,
    seq: u64,
    bytes: u64,
}

impl ReservationToken {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Debug for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reservation({}#{}, {}B)", self.user_id, self.seq, self.bytes)
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user_id, self.seq)
    }
}

#[derive(Default, Debug)]
struct AccountState {
    /// Outstanding reservations by sequence number.
    pending: HashMap<u64, u64>,
    pending_bytes: u64,
    /// Next sequence number; every lower number was issued by this ledger.
    next_seq: u64,
}

pub struct QuotaLedger {
    id: Uuid,
    store: Arc<dyn MetadataStore>,
    default_quota: u64,
    accounts: DashMap<UserId, Arc<Mutex<AccountState>>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn MetadataStore>, default_quota: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            default_quota,
            accounts: DashMap::new(),
        }
    }

    fn account(&self, user_id: UserId) -> Arc<Mutex<AccountState>> {
        self.accounts.entry(user_id).or_default().clone()
    }

    /// Account for a token, rejecting tokens this ledger never issued.
    fn account_for(&self, token: &ReservationToken) -> ServiceResult<Arc<Mutex<AccountState>>> {
        if token.ledger_id != self.id {
            return Err(ServiceError::InvalidReservation(token.to_string()));
        }
        self.accounts
            .get(&token.user_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::InvalidReservation(token.to_string()))
    }

    /// Atomically check `used + pending + bytes <= total` and, if it holds,
    /// add `bytes` to the pending total.
    pub async fn reserve(&self, user_id: UserId, bytes: u64) -> ServiceResult<ReservationToken> {
        if bytes == 0 {
            return Err(ServiceError::Validation(
                "reservation size must be greater than zero".into(),
            ));
        }

        let account = self.account(user_id);
        let mut state = account.lock().await;
        let record = self.store.load_quota(user_id, self.default_quota).await?;
        let used = non_negative(record.used_bytes);
        let total = non_negative(record.total_quota_bytes);

        let committed = used.saturating_add(state.pending_bytes);
        let fits = committed
            .checked_add(bytes)
            .is_some_and(|after| after <= total);
        if !fits {
            let remaining = total.saturating_sub(committed);
            warn!(
                user_id,
                requested = bytes,
                remaining,
                "storage quota exceeded"
            );
            return Err(ServiceError::QuotaExceeded {
                requested: bytes,
                remaining,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(seq, bytes);
        state.pending_bytes += bytes;
        debug!(user_id, seq, bytes, pending = state.pending_bytes, "reserved quota");

        Ok(ReservationToken {
            ledger_id: self.id,
            user_id,
            seq,
            bytes,
        })
    }

    /// Move the reserved bytes into committed usage. Settling a token twice
    /// is a no-op.
    pub async fn commit(&self, token: &ReservationToken) -> ServiceResult<()> {
        let account = self.account_for(token)?;
        let mut state = account.lock().await;
        let Some(bytes) = outstanding(&state, token)? else {
            debug!(reservation = %token, "commit of settled reservation ignored");
            return Ok(());
        };

        let delta = to_i64(bytes);
        self.store
            .update_quota(
                token.user_id,
                self.default_quota,
                Box::new(move |record: &mut QuotaRecord| {
                    record.used_bytes = record.used_bytes.saturating_add(delta)
                }),
            )
            .await?;

        state.pending.remove(&token.seq);
        state.pending_bytes -= bytes;
        debug!(reservation = %token, bytes, "committed quota");
        Ok(())
    }

    /// Return the reserved bytes to the allowance without touching usage.
    /// Settling a token twice is a no-op.
    pub async fn release(&self, token: &ReservationToken) -> ServiceResult<()> {
        let account = self.account_for(token)?;
        let mut state = account.lock().await;
        let Some(bytes) = outstanding(&state, token)? else {
            debug!(reservation = %token, "release of settled reservation ignored");
            return Ok(());
        };

        state.pending.remove(&token.seq);
        state.pending_bytes -= bytes;
        debug!(reservation = %token, bytes, "released quota");
        Ok(())
    }

    /// Permanently reduce committed usage after a document is deleted.
    pub async fn reclaim(&self, user_id: UserId, bytes: u64) -> ServiceResult<()> {
        let account = self.account(user_id);
        let _state = account.lock().await;
        let delta = to_i64(bytes);
        self.store
            .update_quota(
                user_id,
                self.default_quota,
                Box::new(move |record: &mut QuotaRecord| {
                    record.used_bytes = record.used_bytes.saturating_sub(delta).max(0)
                }),
            )
            .await?;
        debug!(user_id, bytes, "reclaimed quota");
        Ok(())
    }

    pub async fn current_info(&self, user_id: UserId) -> ServiceResult<StorageInfo> {
        let account = self.account(user_id);
        let state = account.lock().await;
        let record = self.store.load_quota(user_id, self.default_quota).await?;
        Ok(StorageInfo::from_usage(
            non_negative(record.used_bytes),
            state.pending_bytes,
            non_negative(record.total_quota_bytes),
        ))
    }

    /// Change the account total. Outstanding reservations stay valid; only
    /// later reserves see the new limit.
    pub async fn update_quota(&self, user_id: UserId, new_total: u64) -> ServiceResult<StorageInfo> {
        if new_total == 0 {
            return Err(ServiceError::Validation(
                "quota must be greater than zero".into(),
            ));
        }

        let account = self.account(user_id);
        let state = account.lock().await;
        let total = to_i64(new_total);
        let record = self
            .store
            .update_quota(
                user_id,
                self.default_quota,
                Box::new(move |record: &mut QuotaRecord| record.total_quota_bytes = total),
            )
            .await?;
        tracing::info!(user_id, new_total, "updated storage quota");

        Ok(StorageInfo::from_usage(
            non_negative(record.used_bytes),
            state.pending_bytes,
            non_negative(record.total_quota_bytes),
        ))
    }

    /// Sum of the user's outstanding reservations.
    pub async fn pending_bytes(&self, user_id: UserId) -> u64 {
        match self.accounts.get(&user_id).map(|entry| entry.value().clone()) {
            Some(account) => account.lock().await.pending_bytes,
            None => 0,
        }
    }
}

/// Bytes still held by `token`, `None` if it was already settled.
fn outstanding(state: &AccountState, token: &ReservationToken) -> ServiceResult<Option<u64>> {
    if token.seq >= state.next_seq {
        return Err(ServiceError::InvalidReservation(token.to_string()));
    }
    Ok(state.pending.get(&token.seq).copied())
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
