//! Consumer side of job dispatch.
//!
//! The loop takes a pool permit before it pulls the next message, so at
//! most `concurrency` jobs are in flight per process and a saturated worker
//! leaves the backlog in the broker. Claiming a message commits it: a
//! crash mid-transfer loses that job (at-most-once delivery). On a clean
//! shutdown the one message the broker may have claimed ahead still runs.

use super::{
    broker::{Consumer, Delivery},
    metadata_store::{MetadataStore, StoreError},
    mover::Mover,
};
use crate::models::{
    job::{Job, JobStatus},
    message::RunJobRequest,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Failure messages kept on a job record.
const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job id `{0}` is not a uuid")]
    BadId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub topic: String,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
}

/// Runs one job end to end and keeps its record current.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn MetadataStore>,
    mover: Mover,
}

impl JobRunner {
    pub fn new(store: Arc<dyn MetadataStore>, mover: Mover) -> Self {
        Self { store, mover }
    }

    pub async fn process(&self, req: &RunJobRequest) -> Result<Job, JobError> {
        let job_id = Uuid::parse_str(&req.id).map_err(|_| JobError::BadId(req.id.clone()))?;
        let mut job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            warn!(%job_id, status = job.status.as_str(), "job already finished, ignoring");
            return Ok(job);
        }

        job.status = JobStatus::Running;
        job.start_time = Some(Utc::now());
        if let Err(err) = self.store.update_job(&job).await {
            warn!(%job_id, error = %err, "could not mark job running");
        }

        match self.mover.run_job(req).await {
            Ok(summary) => {
                job.total_count = summary.total_count;
                job.passed_count = summary.passed_count;
                job.total_capacity = summary.total_capacity;
                job.passed_capacity = summary.passed_capacity;
                if summary.is_success() {
                    job.status = JobStatus::Succeeded;
                } else {
                    job.status = JobStatus::Failed;
                    let shown: Vec<_> = summary.failures.iter().take(MAX_REPORTED_FAILURES).cloned().collect();
                    job.message = Some(format!(
                        "{} of {} objects failed: {}",
                        summary.total_count - summary.passed_count,
                        summary.total_count,
                        shown.join("; ")
                    ));
                }
            }
            Err(err) => {
                error!(%job_id, error = %err, "job could not run");
                job.status = JobStatus::Failed;
                job.message = Some(err.to_string());
            }
        }
        job.end_time = Some(Utc::now());

        self.store.update_job(&job).await?;
        info!(%job_id, status = job.status.as_str(), passed = job.passed_count, total = job.total_count, "job finished");
        Ok(job)
    }
}

pub struct Worker {
    runner: JobRunner,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(runner: JobRunner, settings: WorkerSettings) -> Self {
        Self { runner, settings }
    }

    /// Consume until `cancel` fires or the broker closes the stream, then
    /// leave the group and give in-flight jobs the grace period to finish.
    pub async fn run(&self, mut consumer: Consumer, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        info!(
            topic = %self.settings.topic,
            member = consumer.member_id(),
            concurrency = self.settings.concurrency,
            "worker started"
        );

        loop {
            while let Some(done) = tasks.try_join_next() {
                if let Err(err) = done {
                    error!(error = %err, "job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(err) = consumer.errors.recv() => warn!(error = %err, "broker error"),
                Some(rebalance) = consumer.notifications.recv() => {
                    info!(group = %rebalance.group, members = rebalance.members, "consumer group rebalanced");
                }
                delivery = consumer.messages.recv() => match delivery {
                    Some(delivery) => self.handle(delivery, permit, &mut tasks),
                    None => {
                        warn!("broker stream closed");
                        break;
                    }
                },
            }
        }

        if let Err(err) = consumer.stop().await {
            warn!(error = %err, "fetch task did not stop cleanly");
        }
        // A claim is a commit: a message the fetch task already handed over
        // still runs, or it would be lost.
        while let Ok(delivery) = consumer.messages.try_recv() {
            match time::timeout(self.settings.shutdown_grace, permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => self.handle(delivery, permit, &mut tasks),
                _ => error!(seq = delivery.seq, "no capacity for claimed message, dropped"),
            }
        }
        if let Err(err) = consumer.close().await {
            warn!(error = %err, "consumer did not close cleanly");
        }

        let in_flight = tasks.len();
        let drained = time::timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "grace period over, aborting jobs");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!(in_flight, "worker stopped");
    }

    fn handle(&self, delivery: Delivery, permit: OwnedSemaphorePermit, tasks: &mut JoinSet<()>) {
        if delivery.topic != self.settings.topic {
            warn!(topic = %delivery.topic, seq = delivery.seq, "message on unknown topic ignored");
            return;
        }
        let req: RunJobRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(req) => req,
            Err(err) => {
                warn!(seq = delivery.seq, error = %err, "undecodable run request dropped");
                return;
            }
        };

        debug!(job_id = %req.id, seq = delivery.seq, "run request received");
        let runner = self.runner.clone();
        tasks.spawn(async move {
            let _permit = permit;
            if let Err(err) = runner.process(&req).await {
                error!(job_id = %req.id, error = %err, "job bookkeeping failed");
            }
        });
    }
}
