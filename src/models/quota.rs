//! Quota account records and the storage summary reported to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Usage percentage at which an account is reported as near its limit.
pub const NEAR_LIMIT_PERCENT: f64 = 90.0;

/// Persisted half of a quota account. Pending reservations are held by the
/// ledger and never written here.
#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct QuotaRecord {
    pub user_id: i64,
    pub used_bytes: i64,
    pub total_quota_bytes: i64,
    pub updated_at: DateTime<Utc>,
}

/// Storage summary for one user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub used_space: u64,
    pub total_quota: u64,
    pub remaining_space: u64,
    pub usage_percentage: f64,
    pub near_limit: bool,
}

impl StorageInfo {
    /// Build a summary from committed usage, in-flight reservations and the
    /// account total. Reserved bytes count against `remaining_space` only.
    pub fn from_usage(used: u64, pending: u64, total: u64) -> Self {
        let remaining_space = total.saturating_sub(used.saturating_add(pending));
        let usage_percentage = if total > 0 {
            used as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        Self {
            used_space: used,
            total_quota: total,
            remaining_space,
            usage_percentage,
            near_limit: usage_percentage >= NEAR_LIMIT_PERCENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_limit_starts_at_ninety_percent() {
        let info = StorageInfo::from_usage(900, 0, 1000);
        assert!(info.near_limit);
        assert_eq!(info.remaining_space, 100);

        let info = StorageInfo::from_usage(899, 0, 1000);
        assert!(!info.near_limit);
    }

    #[test]
    fn pending_bytes_reduce_remaining_but_not_usage() {
        let info = StorageInfo::from_usage(200, 300, 1000);
        assert_eq!(info.used_space, 200);
        assert_eq!(info.remaining_space, 500);
        assert!((info.usage_percentage - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn remaining_never_underflows_after_quota_shrinks() {
        let info = StorageInfo::from_usage(800, 100, 500);
        assert_eq!(info.remaining_space, 0);
        assert!(info.near_limit);
    }
}
