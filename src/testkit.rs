//! In-memory fakes for the async seams, shared by the unit tests.

use crate::{
    adapters::{
        AdapterError, AdapterResult, CompletedPart, LocationInfo, MultipartSession, ObjectSummary,
        StorageAdapter,
    },
    models::{
        job::Job,
        object::ObjectRecord,
        plan::Plan,
        policy::{Policy, Schedule},
    },
    services::{
        broker::{BrokerError, Producer},
        lock::{LockOutcome, SchedLock},
        metadata_store::{MetadataStore, StoreError, StoreResult},
        trigger::{Executor, TriggerError, TriggerRegistry},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    pub plans: Mutex<HashMap<Uuid, Plan>>,
    pub policies: Mutex<HashMap<Uuid, Policy>>,
    pub jobs: Mutex<HashMap<Uuid, Job>>,
    pub objects: Mutex<HashMap<(String, String), ObjectRecord>>,
    /// When set, `create_job` waits for a permit.
    job_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_job_writes: AtomicBool,
    fail_plan_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gate_job_creation(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.job_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn fail_job_writes(&self) {
        self.fail_job_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_plan_writes(&self) {
        self.fail_plan_writes.store(true, Ordering::SeqCst);
    }

    fn plan_write(&self) -> StoreResult<()> {
        if self.fail_plan_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlx(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.plan_write()?;
        self.plans.lock().insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan> {
        self.plans
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("plan", id))
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let mut plans: Vec<_> = self.plans.lock().values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    async fn update_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.plan_write()?;
        match self.plans.lock().get_mut(&plan.id) {
            Some(slot) => {
                *slot = plan.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("plan", plan.id)),
        }
    }

    async fn delete_plan(&self, id: Uuid) -> StoreResult<()> {
        self.plans
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("plan", id))
    }

    async fn set_last_sched_time(&self, id: Uuid, at: i64) -> StoreResult<()> {
        match self.plans.lock().get_mut(&id) {
            Some(plan) => {
                plan.last_sched_time = at;
                Ok(())
            }
            None => Err(StoreError::not_found("plan", id)),
        }
    }

    async fn create_policy(&self, policy: &Policy) -> StoreResult<()> {
        self.policies.lock().insert(policy.id, policy.clone());
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> StoreResult<Policy> {
        self.policies
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("policy", id))
    }

    async fn list_policies(&self) -> StoreResult<Vec<Policy>> {
        Ok(self.policies.lock().values().cloned().collect())
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let gate = self.job_gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlx(sqlx::Error::PoolClosed));
        }
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        self.jobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job", id))
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        if self.fail_job_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlx(sqlx::Error::PoolClosed));
        }
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn list_jobs(&self, plan_id: Option<Uuid>) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|j| plan_id.is_none_or(|id| j.plan_id == id))
            .cloned()
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectRecord>> {
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn put_object(&self, record: &ObjectRecord) -> StoreResult<()> {
        self.objects
            .lock()
            .insert((record.bucket.clone(), record.key.clone()), record.clone());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Lock that behaves like a real one unless outcomes are scripted.
#[derive(Default)]
pub struct FakeLock {
    held: Mutex<HashSet<Uuid>>,
    script: Mutex<VecDeque<LockOutcome>>,
    pub attempts: AtomicUsize,
    pub unlocks: AtomicUsize,
}

impl FakeLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = LockOutcome>) -> Arc<Self> {
        let lock = Self::default();
        lock.script.lock().extend(outcomes);
        Arc::new(lock)
    }

    pub fn is_held(&self, plan_id: Uuid) -> bool {
        self.held.lock().contains(&plan_id)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedLock for FakeLock {
    async fn lock_sched(&self, plan_id: Uuid) -> LockOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().pop_front() {
            if matches!(outcome, LockOutcome::Success) {
                self.held.lock().insert(plan_id);
            }
            return outcome;
        }
        if self.held.lock().insert(plan_id) {
            LockOutcome::Success
        } else {
            LockOutcome::Busy
        }
    }

    async fn unlock_sched(&self, plan_id: Uuid) -> Result<(), StoreError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        self.held.lock().remove(&plan_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingProducer {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let producer = Self::default();
        producer.fail.store(true, Ordering::SeqCst);
        Arc::new(producer)
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Sqlx(sqlx::Error::PoolClosed));
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterCall {
    Upload(String),
    Delete(String),
    Init(String),
    UploadPart(u32),
    Complete(Vec<u32>),
    Abort(String),
}

/// In-memory bucket store that records every call and can fail parts.
#[derive(Default)]
pub struct ScriptedAdapter {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    staged: Mutex<HashMap<String, BTreeMap<u32, Bytes>>>,
    failing_parts: Mutex<HashSet<u32>>,
    pub calls: Mutex<Vec<AdapterCall>>,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn fail_part(&self, part_number: u32) {
        self.failing_parts.lock().insert(part_number);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&AdapterCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn lookup(&self, location: &LocationInfo, key: &str) -> AdapterResult<Bytes> {
        self.get(&location.bucket_name, key)
            .ok_or_else(|| AdapterError::NotFound {
                bucket: location.bucket_name.clone(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl StorageAdapter for ScriptedAdapter {
    async fn list(&self, location: &LocationInfo, prefix: &str) -> AdapterResult<Vec<ObjectSummary>> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((bucket, key), _)| *bucket == location.bucket_name && key.starts_with(prefix))
            .map(|((_, key), data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as u64,
                last_modified: Utc::now(),
            })
            .collect())
    }

    async fn download(&self, key: &str, location: &LocationInfo) -> AdapterResult<Bytes> {
        self.lookup(location, key)
    }

    async fn download_range(
        &self,
        key: &str,
        location: &LocationInfo,
        start: u64,
        end: u64,
    ) -> AdapterResult<Bytes> {
        let data = self.lookup(location, key)?;
        let end = (end as usize + 1).min(data.len());
        Ok(data.slice(start as usize..end))
    }

    async fn upload(&self, key: &str, location: &LocationInfo, data: Bytes) -> AdapterResult<()> {
        self.calls.lock().push(AdapterCall::Upload(key.to_string()));
        self.put(&location.bucket_name, key, data);
        Ok(())
    }

    async fn delete(&self, key: &str, location: &LocationInfo) -> AdapterResult<()> {
        self.calls.lock().push(AdapterCall::Delete(key.to_string()));
        self.objects
            .lock()
            .remove(&(location.bucket_name.clone(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| AdapterError::NotFound {
                bucket: location.bucket_name.clone(),
                key: key.to_string(),
            })
    }

    async fn multipart_init(&self, key: &str, _location: &LocationInfo) -> AdapterResult<MultipartSession> {
        self.calls.lock().push(AdapterCall::Init(key.to_string()));
        let upload_id = Uuid::new_v4().to_string();
        self.staged.lock().insert(upload_id.clone(), BTreeMap::new());
        Ok(MultipartSession { upload_id })
    }

    async fn upload_part(
        &self,
        _key: &str,
        _location: &LocationInfo,
        session: &MultipartSession,
        part_number: u32,
        _offset: u64,
        data: Bytes,
    ) -> AdapterResult<CompletedPart> {
        self.calls.lock().push(AdapterCall::UploadPart(part_number));
        if self.failing_parts.lock().contains(&part_number) {
            return Err(AdapterError::Io(std::io::Error::other("injected part failure")));
        }
        let etag = format!("{:x}", md5::compute(&data));
        self.staged
            .lock()
            .get_mut(&session.upload_id)
            .ok_or_else(|| AdapterError::UnknownUpload(session.upload_id.clone()))?
            .insert(part_number, data);
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        location: &LocationInfo,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> AdapterResult<()> {
        self.calls
            .lock()
            .push(AdapterCall::Complete(parts.iter().map(|p| p.part_number).collect()));
        let staged = self
            .staged
            .lock()
            .remove(&session.upload_id)
            .ok_or_else(|| AdapterError::UnknownUpload(session.upload_id.clone()))?;
        let mut assembled = Vec::new();
        for part in parts {
            let data = staged
                .get(&part.part_number)
                .ok_or(AdapterError::MissingPart(part.part_number))?;
            assembled.extend_from_slice(data);
        }
        self.put(&location.bucket_name, key, assembled);
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        _location: &LocationInfo,
        session: &MultipartSession,
    ) -> AdapterResult<()> {
        self.calls.lock().push(AdapterCall::Abort(key.to_string()));
        self.staged.lock().remove(&session.upload_id);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerCall {
    Add(Uuid),
    Remove(Uuid),
}

/// Registry that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingTriggers {
    registered: Mutex<HashMap<Uuid, Schedule>>,
    pub calls: Mutex<Vec<TriggerCall>>,
    refuse_adds: AtomicBool,
}

impl RecordingTriggers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<TriggerCall> {
        self.calls.lock().clone()
    }

    pub fn schedule_of(&self, plan_id: Uuid) -> Option<Schedule> {
        self.registered.lock().get(&plan_id).copied()
    }

    /// Make every later `add` fail as if the registry were shut down.
    pub fn refuse_adds(&self, refuse: bool) {
        self.refuse_adds.store(refuse, Ordering::SeqCst);
    }
}

impl TriggerRegistry for RecordingTriggers {
    fn add(&self, plan_id: Uuid, schedule: Schedule, _executor: Arc<dyn Executor>) -> Result<(), TriggerError> {
        self.calls.lock().push(TriggerCall::Add(plan_id));
        if self.refuse_adds.load(Ordering::SeqCst) {
            return Err(TriggerError::ShutDown);
        }
        let mut registered = self.registered.lock();
        if registered.contains_key(&plan_id) {
            return Err(TriggerError::AlreadyRegistered(plan_id));
        }
        registered.insert(plan_id, schedule);
        Ok(())
    }

    fn remove(&self, plan_id: Uuid) -> bool {
        self.calls.lock().push(TriggerCall::Remove(plan_id));
        self.registered.lock().remove(&plan_id).is_some()
    }
}
