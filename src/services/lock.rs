//! Cluster-wide "this plan is being run" lock.
//!
//! Every scheduler replica fires the same triggers; the lock makes sure only
//! one of them turns a firing into a job. Locks are leases: a holder that
//! crashes without unlocking loses the plan once the lease runs out.

use super::metadata_store::{SqliteStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub enum LockOutcome {
    Success,
    /// Someone else holds a live lease on the plan.
    Busy,
    Error(StoreError),
}

#[async_trait]
pub trait SchedLock: Send + Sync {
    async fn lock_sched(&self, plan_id: Uuid) -> LockOutcome;
    async fn unlock_sched(&self, plan_id: Uuid) -> Result<(), StoreError>;
}

/// Lease lock stored in the `sched_locks` table of the shared database.
#[derive(Clone, Debug)]
pub struct LeaseLock {
    store: SqliteStore,
    holder: String,
    lease: Duration,
}

impl LeaseLock {
    pub fn new(store: SqliteStore, holder: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            holder: holder.into(),
            lease,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl SchedLock for LeaseLock {
    async fn lock_sched(&self, plan_id: Uuid) -> LockOutcome {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lease.as_millis() as i64;

        // Insert a fresh lease, or take over one whose holder let it lapse.
        let result = sqlx::query(
            "INSERT INTO sched_locks (plan_id, holder, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(plan_id) DO UPDATE SET
                 holder = excluded.holder,
                 expires_at = excluded.expires_at
             WHERE sched_locks.expires_at <= ?",
        )
        .bind(plan_id)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(self.store.pool())
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                debug!(%plan_id, holder = %self.holder, "schedule lock acquired");
                LockOutcome::Success
            }
            Ok(_) => LockOutcome::Busy,
            Err(err) => LockOutcome::Error(StoreError::Sqlx(err)),
        }
    }

    async fn unlock_sched(&self, plan_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sched_locks WHERE plan_id = ? AND holder = ?")
            .bind(plan_id)
            .bind(&self.holder)
            .execute(self.store.pool())
            .await?;
        debug!(%plan_id, holder = %self.holder, "schedule lock released");
        Ok(())
    }
}
