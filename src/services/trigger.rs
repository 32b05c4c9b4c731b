//! Recurring plan firings.
//!
//! `TriggerManager` owns one timer task per registered plan. It is built
//! explicitly at process start and torn down with `shutdown`.

use crate::models::policy::Schedule;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("plan {0} already has a trigger")]
    AlreadyRegistered(Uuid),
    #[error("trigger manager is shut down")]
    ShutDown,
}

/// Work fired on every tick of a schedule.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self);
}

pub trait TriggerRegistry: Send + Sync {
    fn add(&self, plan_id: Uuid, schedule: Schedule, executor: Arc<dyn Executor>) -> Result<(), TriggerError>;

    /// Returns whether a registration existed.
    fn remove(&self, plan_id: Uuid) -> bool;
}

struct Entry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TriggerManager {
    entries: Mutex<HashMap<Uuid, Entry>>,
    cancel: CancellationToken,
}

impl Default for TriggerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_registered(&self, plan_id: Uuid) -> bool {
        self.entries.lock().contains_key(&plan_id)
    }

    /// Stop every timer and wait for the timer tasks to exit. Runs already
    /// spawned by a tick finish on their own. Returns how many timer tasks
    /// had ended abnormally.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let entries: Vec<(Uuid, Entry)> = self.entries.lock().drain().collect();
        let count = entries.len();
        let mut failed = 0;
        for (plan_id, entry) in entries {
            entry.cancel.cancel();
            if let Err(err) = entry.handle.await {
                warn!(%plan_id, error = %err, "trigger task ended abnormally");
                failed += 1;
            }
        }
        info!(triggers = count, failed, "trigger manager stopped");
        failed
    }
}

async fn tick_loop(plan_id: Uuid, schedule: Schedule, executor: Arc<dyn Executor>, cancel: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + schedule.every, schedule.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!(%plan_id, "trigger fired");
                let executor = executor.clone();
                tokio::spawn(async move { executor.run().await });
            }
        }
    }
    debug!(%plan_id, "trigger stopped");
}

impl TriggerRegistry for TriggerManager {
    fn add(&self, plan_id: Uuid, schedule: Schedule, executor: Arc<dyn Executor>) -> Result<(), TriggerError> {
        if self.cancel.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&plan_id) {
            return Err(TriggerError::AlreadyRegistered(plan_id));
        }

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(tick_loop(plan_id, schedule, executor, cancel.clone()));
        entries.insert(plan_id, Entry { cancel, handle });
        info!(%plan_id, every_secs = schedule.every.as_secs(), "trigger registered");
        Ok(())
    }

    fn remove(&self, plan_id: Uuid) -> bool {
        match self.entries.lock().remove(&plan_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(%plan_id, "trigger removed");
                true
            }
            None => false,
        }
    }
}
