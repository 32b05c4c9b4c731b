//! Plan lifecycle and the run path.
//!
//! `PlanService` validates and persists plans and keeps the trigger
//! registry in step with each plan's policy. Running a plan lives in
//! `PlanRunner` so trigger executors can hold it without holding the
//! service (and through it, the registry that owns them).

use super::{
    dispatcher::Dispatcher,
    lock::{LockOutcome, SchedLock},
    metadata_store::{MetadataStore, StoreError},
    trigger::{Executor, TriggerError, TriggerRegistry},
};
use crate::models::{
    job::Job,
    message::{RunJobRequest, WireConnector},
    plan::{Plan, PlanUpdate, is_valid_plan_name},
    policy::{Policy, Schedule},
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lock acquisition attempts per run.
pub const LOCK_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid plan name `{0}`")]
    InvalidPlanName(String),
    #[error("source and destination connectors are the same bucket")]
    DestSrcConnEqual,
    #[error("policy `{0}` not found")]
    PolicyNotFound(String),
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid filter pattern: {0}")]
    InvalidFilter(#[source] regex::Error),
    #[error("plan {0} not found")]
    NotFound(Uuid),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("plan {0} is already running")]
    RunPlanBusy(Uuid),
    #[error("{0}")]
    InnerError(String),
    #[error("schedule lock: {0}")]
    Lock(#[source] StoreError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PlanError {
    fn plan_lookup(id: Uuid) -> impl FnOnce(StoreError) -> PlanError {
        move |err| {
            if err.is_not_found() {
                PlanError::NotFound(id)
            } else {
                PlanError::Store(err)
            }
        }
    }
}

/// Takes a plan from "locked" to "job persisted and dispatched".
pub struct PlanRunner {
    store: Arc<dyn MetadataStore>,
    lock: Arc<dyn SchedLock>,
    dispatcher: Dispatcher,
}

impl PlanRunner {
    pub fn new(store: Arc<dyn MetadataStore>, lock: Arc<dyn SchedLock>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            lock,
            dispatcher,
        }
    }

    /// Start one job for the plan and return its id without waiting for
    /// the transfer.
    pub async fn run(&self, plan_id: Uuid) -> Result<Uuid, PlanError> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await
            .map_err(PlanError::plan_lookup(plan_id))?;

        self.acquire(plan_id).await?;
        let result = self.start_job(&plan).await;
        if let Err(err) = self.lock.unlock_sched(plan_id).await {
            warn!(%plan_id, error = %err, "failed to release schedule lock");
        }
        result
    }

    async fn acquire(&self, plan_id: Uuid) -> Result<(), PlanError> {
        let mut last_err = None;
        for attempt in 1..=LOCK_ATTEMPTS {
            match self.lock.lock_sched(plan_id).await {
                LockOutcome::Success => return Ok(()),
                // Whoever holds it is running the plan right now.
                LockOutcome::Busy => return Err(PlanError::RunPlanBusy(plan_id)),
                LockOutcome::Error(err) => {
                    warn!(%plan_id, attempt, error = %err, "schedule lock attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.map_or_else(
            || PlanError::InnerError("schedule lock was never attempted".into()),
            PlanError::Lock,
        ))
    }

    async fn start_job(&self, plan: &Plan) -> Result<Uuid, PlanError> {
        let source = plan.source_conn.location().ok_or_else(|| {
            PlanError::InnerError(format!(
                "cannot resolve source location for storage type `{}`",
                plan.source_conn.stor_type
            ))
        })?;
        let dest = plan.dest_conn.location().ok_or_else(|| {
            PlanError::InnerError(format!(
                "cannot resolve destination location for storage type `{}`",
                plan.dest_conn.stor_type
            ))
        })?;

        let job = Job::pending(plan, source, dest);
        match self.store.create_job(&job).await {
            Ok(()) => {
                info!(plan_id = %plan.id, job_id = %job.id, "job created");
                self.dispatcher.dispatch(RunJobRequest {
                    id: job.id.to_string(),
                    over_write: plan.over_write,
                    remain_source: plan.remain_source,
                    source_conn: WireConnector::from(&plan.source_conn),
                    dest_conn: WireConnector::from(&plan.dest_conn),
                    filter: plan.filter.clone(),
                });
            }
            // The caller still gets the id; nothing was dispatched for it.
            Err(err) => error!(plan_id = %plan.id, job_id = %job.id, error = %err, "job not persisted"),
        }
        Ok(job.id)
    }

    pub async fn record_fired(&self, plan_id: Uuid) {
        if let Err(err) = self
            .store
            .set_last_sched_time(plan_id, Utc::now().timestamp())
            .await
        {
            warn!(%plan_id, error = %err, "failed to record schedule time");
        }
    }
}

/// What a trigger fires for one plan.
pub struct PlanExecutor {
    plan_id: Uuid,
    runner: Arc<PlanRunner>,
}

impl PlanExecutor {
    pub fn new(plan_id: Uuid, runner: Arc<PlanRunner>) -> Self {
        Self { plan_id, runner }
    }
}

#[async_trait]
impl Executor for PlanExecutor {
    async fn run(&self) {
        match self.runner.run(self.plan_id).await {
            Ok(job_id) => {
                info!(plan_id = %self.plan_id, %job_id, "scheduled run started");
                self.runner.record_fired(self.plan_id).await;
            }
            Err(PlanError::RunPlanBusy(_)) => {
                debug!(plan_id = %self.plan_id, "scheduled run skipped, another scheduler holds the plan");
            }
            Err(err) => error!(plan_id = %self.plan_id, error = %err, "scheduled run failed"),
        }
    }
}

pub struct PlanService {
    store: Arc<dyn MetadataStore>,
    triggers: Arc<dyn TriggerRegistry>,
    runner: Arc<PlanRunner>,
}

impl PlanService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        lock: Arc<dyn SchedLock>,
        triggers: Arc<dyn TriggerRegistry>,
        dispatcher: Dispatcher,
    ) -> Self {
        let runner = Arc::new(PlanRunner::new(store.clone(), lock, dispatcher));
        Self {
            store,
            triggers,
            runner,
        }
    }

    pub fn runner(&self) -> Arc<PlanRunner> {
        self.runner.clone()
    }

    /// Check everything a stored plan must satisfy and resolve its schedule.
    async fn validate(&self, plan: &Plan) -> Result<Option<Schedule>, PlanError> {
        if !is_valid_plan_name(&plan.name) {
            return Err(PlanError::InvalidPlanName(plan.name.clone()));
        }
        if plan.source_conn.is_same_endpoint(&plan.dest_conn) {
            return Err(PlanError::DestSrcConnEqual);
        }
        plan.filter.compile().map_err(PlanError::InvalidFilter)?;

        let Some(raw) = plan.policy_id.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        let policy_id = Uuid::parse_str(raw).map_err(|_| PlanError::PolicyNotFound(raw.to_string()))?;
        match self.store.get_policy(policy_id).await {
            Ok(policy) => Ok(Some(policy.schedule())),
            Err(err) if err.is_not_found() => Err(PlanError::PolicyNotFound(raw.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn register(&self, plan_id: Uuid, schedule: Schedule) -> Result<(), PlanError> {
        let executor = Arc::new(PlanExecutor::new(plan_id, self.runner.clone()));
        self.triggers.add(plan_id, schedule, executor)?;
        Ok(())
    }

    /// Put back a registration removed by a failed update.
    fn reinstate(&self, plan_id: Uuid, previous: Option<Schedule>) {
        if let Some(schedule) = previous {
            if let Err(err) = self.register(plan_id, schedule) {
                warn!(%plan_id, error = %err, "previous trigger not restored");
            }
        }
    }

    pub async fn create(&self, mut plan: Plan) -> Result<Plan, PlanError> {
        let schedule = self.validate(&plan).await?;

        if plan.id.is_nil() {
            plan.id = Uuid::new_v4();
        }
        if plan.policy_id.as_deref() == Some("") {
            plan.policy_id = None;
        }
        plan.created_at = Utc::now();
        plan.last_sched_time = 0;

        let registered = match (plan.wants_trigger(), schedule) {
            (true, Some(schedule)) => {
                self.register(plan.id, schedule)?;
                true
            }
            _ => false,
        };
        if let Err(err) = self.store.create_plan(&plan).await {
            if registered {
                self.triggers.remove(plan.id);
            }
            return Err(err.into());
        }
        info!(plan_id = %plan.id, name = %plan.name, "plan created");
        Ok(plan)
    }

    pub async fn update(&self, id: Uuid, update: PlanUpdate) -> Result<Plan, PlanError> {
        let current = self
            .store
            .get_plan(id)
            .await
            .map_err(PlanError::plan_lookup(id))?;

        let mut next = current.clone();
        if let Some(name) = update.name.clone() {
            next.name = name;
        }
        if let Some(description) = update.description.clone() {
            next.description = description;
        }
        if let Some(conn) = update.source_conn.clone() {
            next.source_conn = conn;
        }
        if let Some(conn) = update.dest_conn.clone() {
            next.dest_conn = conn;
        }
        if let Some(filter) = update.filter.clone() {
            next.filter = filter;
        }
        if let Some(enabled) = update.policy_enabled {
            next.policy_enabled = enabled;
        }
        if let Some(policy_id) = update.policy_id.clone() {
            next.policy_id = (!policy_id.is_empty()).then_some(policy_id);
        }
        if let Some(over_write) = update.over_write {
            next.over_write = over_write;
        }
        if let Some(remain_source) = update.remain_source {
            next.remain_source = remain_source;
        }

        let schedule = self.validate(&next).await?;

        // Registration changes happen before the write; a failed write puts
        // the old registration back.
        let mut previous = None;
        if update.touches_schedule() {
            let current_schedule = if current.wants_trigger() {
                self.validate(&current).await.ok().flatten()
            } else {
                None
            };
            // `add` rejects a plan that is still registered.
            if self.triggers.remove(id) {
                previous = current_schedule;
            }
            if let (true, Some(schedule)) = (next.wants_trigger(), schedule) {
                if let Err(err) = self.register(id, schedule) {
                    self.reinstate(id, previous);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.store.update_plan(&next).await {
            if update.touches_schedule() {
                self.triggers.remove(id);
                self.reinstate(id, previous);
            }
            return Err(PlanError::plan_lookup(id)(err));
        }
        info!(plan_id = %id, "plan updated");
        Ok(next)
    }

    /// Deleting a plan that does not exist succeeds.
    pub async fn delete(&self, id: Uuid) -> Result<(), PlanError> {
        match self.store.get_plan(id).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        self.triggers.remove(id);
        match self.store.delete_plan(id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        info!(plan_id = %id, "plan deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Plan, PlanError> {
        self.store.get_plan(id).await.map_err(PlanError::plan_lookup(id))
    }

    pub async fn list(&self) -> Result<Vec<Plan>, PlanError> {
        Ok(self.store.list_plans().await?)
    }

    pub async fn run(&self, id: Uuid) -> Result<Uuid, PlanError> {
        self.runner.run(id).await
    }

    /// Register every plan whose policy is enabled. Called once when the
    /// scheduler starts.
    pub async fn restore_triggers(&self) -> Result<usize, PlanError> {
        let mut restored = 0;
        for plan in self.store.list_plans().await? {
            if !plan.wants_trigger() {
                continue;
            }
            let schedule = match self.validate(&plan).await {
                Ok(Some(schedule)) => schedule,
                Ok(None) => continue,
                Err(err) => {
                    warn!(plan_id = %plan.id, error = %err, "plan not rescheduled");
                    continue;
                }
            };
            match self.register(plan.id, schedule) {
                Ok(()) => restored += 1,
                Err(PlanError::Trigger(TriggerError::AlreadyRegistered(_))) => {}
                Err(err) => return Err(err),
            }
        }
        info!(restored, "plan triggers restored");
        Ok(restored)
    }

    pub async fn create_policy(&self, mut policy: Policy) -> Result<Policy, PlanError> {
        if policy.name.trim().is_empty() {
            return Err(PlanError::InvalidPolicy("name must not be empty".into()));
        }
        if policy.interval_secs == 0 {
            return Err(PlanError::InvalidPolicy("intervalSecs must be positive".into()));
        }
        if policy.id.is_nil() {
            policy.id = Uuid::new_v4();
        }
        policy.created_at = Utc::now();
        self.store.create_policy(&policy).await?;
        Ok(policy)
    }

    pub async fn get_policy(&self, id: Uuid) -> Result<Policy, PlanError> {
        self.store.get_policy(id).await.map_err(|err| {
            if err.is_not_found() {
                PlanError::PolicyNotFound(id.to_string())
            } else {
                err.into()
            }
        })
    }

    pub async fn list_policies(&self) -> Result<Vec<Policy>, PlanError> {
        Ok(self.store.list_policies().await?)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, PlanError> {
        self.store.get_job(id).await.map_err(|err| {
            if err.is_not_found() {
                PlanError::JobNotFound(id)
            } else {
                err.into()
            }
        })
    }

    pub async fn list_jobs(&self, plan_id: Option<Uuid>) -> Result<Vec<Job>, PlanError> {
        Ok(self.store.list_jobs(plan_id).await?)
    }
}
