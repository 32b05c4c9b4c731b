//! Durable system of record for plans, policies, jobs and object metadata.
//!
//! `MetadataStore` is the seam the core depends on; `SqliteStore` is the
//! SQLite implementation. Connector, filter and part lists are stored as
//! JSON text columns.

use crate::models::{
    connector::{Connector, Filter},
    job::{Job, JobStatus},
    object::{ObjectRecord, PartRecord},
    plan::{Plan, PlanType},
    policy::Policy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("corrupt {column} column: {source}")]
    Codec {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_plan(&self, plan: &Plan) -> StoreResult<()>;
    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan>;
    async fn list_plans(&self) -> StoreResult<Vec<Plan>>;
    async fn update_plan(&self, plan: &Plan) -> StoreResult<()>;
    async fn delete_plan(&self, id: Uuid) -> StoreResult<()>;
    async fn set_last_sched_time(&self, id: Uuid, at: i64) -> StoreResult<()>;

    async fn create_policy(&self, policy: &Policy) -> StoreResult<()>;
    async fn get_policy(&self, id: Uuid) -> StoreResult<Policy>;
    async fn list_policies(&self) -> StoreResult<Vec<Policy>>;

    async fn create_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, id: Uuid) -> StoreResult<Job>;
    async fn update_job(&self, job: &Job) -> StoreResult<()>;
    async fn list_jobs(&self, plan_id: Option<Uuid>) -> StoreResult<Vec<Job>>;

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectRecord>>;
    async fn put_object(&self, record: &ObjectRecord) -> StoreResult<()>;
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Cheap connectivity probe used by readiness checks.
    async fn ping(&self) -> StoreResult<()>;
}

/// SQLite-backed metadata store. Cloning shares the pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn apply_schema(&self) -> StoreResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        debug!("applying {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(column: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Codec { column, source })
}

fn from_json<T: serde::de::DeserializeOwned>(column: &'static str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|source| StoreError::Codec { column, source })
}

fn not_found_as(kind: &'static str, id: impl ToString) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| match err {
        sqlx::Error::RowNotFound => StoreError::not_found(kind, id),
        other => StoreError::Sqlx(other),
    }
}

#[derive(FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    description: String,
    plan_type: String,
    source_conn: String,
    dest_conn: String,
    filter: String,
    policy_id: Option<String>,
    policy_enabled: bool,
    over_write: bool,
    remain_source: bool,
    last_sched_time: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> StoreResult<Self> {
        Ok(Plan {
            id: row.id,
            name: row.name,
            description: row.description,
            plan_type: PlanType::parse(&row.plan_type),
            source_conn: from_json::<Connector>("source_conn", &row.source_conn)?,
            dest_conn: from_json::<Connector>("dest_conn", &row.dest_conn)?,
            filter: from_json::<Filter>("filter", &row.filter)?,
            policy_id: row.policy_id,
            policy_enabled: row.policy_enabled,
            over_write: row.over_write,
            remain_source: row.remain_source,
            last_sched_time: row.last_sched_time,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct PolicyRow {
    id: Uuid,
    name: String,
    interval_secs: i64,
    created_at: DateTime<Utc>,
}

impl From<PolicyRow> for Policy {
    fn from(row: PolicyRow) -> Self {
        Policy {
            id: row.id,
            name: row.name,
            interval_secs: row.interval_secs.max(0) as u64,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    plan_id: Uuid,
    plan_name: String,
    plan_type: String,
    source_location: String,
    dest_location: String,
    status: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    over_write: bool,
    remain_source: bool,
    total_count: i64,
    passed_count: i64,
    total_capacity: i64,
    passed_capacity: i64,
    message: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            plan_id: row.plan_id,
            plan_name: row.plan_name,
            plan_type: PlanType::parse(&row.plan_type),
            source_location: row.source_location,
            dest_location: row.dest_location,
            status: JobStatus::parse(&row.status),
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            over_write: row.over_write,
            remain_source: row.remain_source,
            total_count: row.total_count,
            passed_count: row.passed_count,
            total_capacity: row.total_capacity,
            passed_capacity: row.passed_capacity,
            message: row.message,
        }
    }
}

#[derive(FromRow)]
struct ObjectRow {
    bucket: String,
    key: String,
    backend: String,
    size: i64,
    last_modified: DateTime<Utc>,
    etag: Option<String>,
    parts: String,
}

impl TryFrom<ObjectRow> for ObjectRecord {
    type Error = StoreError;

    fn try_from(row: ObjectRow) -> StoreResult<Self> {
        Ok(ObjectRecord {
            bucket: row.bucket,
            key: row.key,
            backend: row.backend,
            size: row.size,
            last_modified: row.last_modified,
            etag: row.etag,
            parts: from_json::<Vec<PartRecord>>("parts", &row.parts)?,
        })
    }
}

const PLAN_COLUMNS: &str = "id, name, description, plan_type, source_conn, dest_conn, filter, \
     policy_id, policy_enabled, over_write, remain_source, last_sched_time, created_at";

const JOB_COLUMNS: &str = "id, plan_id, plan_name, plan_type, source_location, dest_location, \
     status, create_time, start_time, end_time, over_write, remain_source, total_count, \
     passed_count, total_capacity, passed_capacity, message";

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn create_plan(&self, plan: &Plan) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO plans (id, name, description, plan_type, source_conn, dest_conn, filter,
                                policy_id, policy_enabled, over_write, remain_source,
                                last_sched_time, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.plan_type.as_str())
        .bind(to_json("source_conn", &plan.source_conn)?)
        .bind(to_json("dest_conn", &plan.dest_conn)?)
        .bind(to_json("filter", &plan.filter)?)
        .bind(plan.policy_id.as_deref())
        .bind(plan.policy_enabled)
        .bind(plan.over_write)
        .bind(plan.remain_source)
        .bind(plan.last_sched_time)
        .bind(plan.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_as("plan", id))?;
        row.try_into()
    }

    async fn list_plans(&self) -> StoreResult<Vec<Plan>> {
        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Plan::try_from).collect()
    }

    async fn update_plan(&self, plan: &Plan) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE plans SET name = ?, description = ?, plan_type = ?, source_conn = ?,
                              dest_conn = ?, filter = ?, policy_id = ?, policy_enabled = ?,
                              over_write = ?, remain_source = ?, last_sched_time = ?
             WHERE id = ?",
        )
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.plan_type.as_str())
        .bind(to_json("source_conn", &plan.source_conn)?)
        .bind(to_json("dest_conn", &plan.dest_conn)?)
        .bind(to_json("filter", &plan.filter)?)
        .bind(plan.policy_id.as_deref())
        .bind(plan.policy_enabled)
        .bind(plan.over_write)
        .bind(plan.remain_source)
        .bind(plan.last_sched_time)
        .bind(plan.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("plan", plan.id));
        }
        Ok(())
    }

    async fn delete_plan(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM plans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("plan", id));
        }
        Ok(())
    }

    async fn set_last_sched_time(&self, id: Uuid, at: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE plans SET last_sched_time = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("plan", id));
        }
        Ok(())
    }

    async fn create_policy(&self, policy: &Policy) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO policies (id, name, interval_secs, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(policy.interval_secs as i64)
        .bind(policy.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> StoreResult<Policy> {
        sqlx::query_as::<_, PolicyRow>(
            "SELECT id, name, interval_secs, created_at FROM policies WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map(Policy::from)
        .map_err(not_found_as("policy", id))
    }

    async fn list_policies(&self) -> StoreResult<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT id, name, interval_secs, created_at FROM policies ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Policy::from).collect())
    }

    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(job.id)
        .bind(job.plan_id)
        .bind(&job.plan_name)
        .bind(job.plan_type.as_str())
        .bind(&job.source_location)
        .bind(&job.dest_location)
        .bind(job.status.as_str())
        .bind(job.create_time)
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(job.over_write)
        .bind(job.remain_source)
        .bind(job.total_count)
        .bind(job.passed_count)
        .bind(job.total_capacity)
        .bind(job.passed_capacity)
        .bind(job.message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map(Job::from)
            .map_err(not_found_as("job", id))
    }

    async fn update_job(&self, job: &Job) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, start_time = ?, end_time = ?, total_count = ?,
                             passed_count = ?, total_capacity = ?, passed_capacity = ?,
                             message = ?
             WHERE id = ?",
        )
        .bind(job.status.as_str())
        .bind(job.start_time)
        .bind(job.end_time)
        .bind(job.total_count)
        .bind(job.passed_count)
        .bind(job.total_capacity)
        .bind(job.passed_capacity)
        .bind(job.message.as_deref())
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("job", job.id));
        }
        Ok(())
    }

    async fn list_jobs(&self, plan_id: Option<Uuid>) -> StoreResult<Vec<Job>> {
        let rows = match plan_id {
            Some(plan_id) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE plan_id = ? ORDER BY create_time ASC"
                ))
                .bind(plan_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY create_time ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectRecord>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT bucket, key, backend, size, last_modified, etag, parts
             FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ObjectRecord::try_from).transpose()
    }

    async fn put_object(&self, record: &ObjectRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (bucket, key, backend, size, last_modified, etag, parts)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                backend = excluded.backend,
                size = excluded.size,
                last_modified = excluded.last_modified,
                etag = excluded.etag,
                parts = excluded.parts
            "#,
        )
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(&record.backend)
        .bind(record.size)
        .bind(record.last_modified)
        .bind(record.etag.as_deref())
        .bind(to_json("parts", &record.parts)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        connector::{KeyValue, StorageType},
        object::PartRecord,
    };

    fn sample_plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "nightly".into(),
            description: String::new(),
            plan_type: PlanType::Migration,
            source_conn: Connector::internal("bucketA"),
            dest_conn: Connector::external(
                StorageType::AwsS3,
                vec![KeyValue::new("bucketName", "bucketB")],
            ),
            filter: Filter::default(),
            policy_id: None,
            policy_enabled: false,
            over_write: true,
            remain_source: true,
            last_sched_time: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn plan_crud() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut plan = sample_plan();
        store.create_plan(&plan).await.unwrap();

        let loaded = store.get_plan(plan.id).await.unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.dest_conn, plan.dest_conn);
        assert!(loaded.over_write);

        plan.name = "weekly".into();
        plan.filter.prefix = "/logs/".into();
        store.update_plan(&plan).await.unwrap();
        let loaded = store.get_plan(plan.id).await.unwrap();
        assert_eq!(loaded.name, "weekly");
        assert_eq!(loaded.filter.prefix, "/logs/");

        store.set_last_sched_time(plan.id, 1_700_000_000).await.unwrap();
        assert_eq!(
            store.get_plan(plan.id).await.unwrap().last_sched_time,
            1_700_000_000
        );

        assert_eq!(store.list_plans().await.unwrap().len(), 1);
        store.delete_plan(plan.id).await.unwrap();
        assert!(store.get_plan(plan.id).await.unwrap_err().is_not_found());
        assert!(store.delete_plan(plan.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn job_lifecycle_round_trips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let plan = sample_plan();
        let mut job = Job::pending(&plan, "bucketA".into(), "bucketB".into());
        store.create_job(&job).await.unwrap();

        job.status = JobStatus::Succeeded;
        job.start_time = Some(Utc::now());
        job.end_time = Some(Utc::now());
        job.total_count = 3;
        job.passed_count = 3;
        job.total_capacity = 300;
        job.passed_capacity = 300;
        store.update_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Succeeded);
        assert_eq!(loaded.passed_capacity, 300);
        assert_eq!(loaded.plan_id, plan.id);

        assert_eq!(store.list_jobs(Some(plan.id)).await.unwrap().len(), 1);
        assert!(store.list_jobs(Some(Uuid::new_v4())).await.unwrap().is_empty());
        assert!(store.get_job(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn object_record_upsert_keeps_parts() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.get_object("bkt", "k").await.unwrap().is_none());

        let part = PartRecord {
            part_number: 1,
            size: 10,
            last_modified: Utc::now(),
            etag: "e1".into(),
        };
        let mut record = ObjectRecord::seeded("bkt", "k", "internal", part.clone());
        store.put_object(&record).await.unwrap();

        record.append_part(PartRecord {
            part_number: 2,
            etag: "e2".into(),
            ..part
        });
        store.put_object(&record).await.unwrap();

        let loaded = store.get_object("bkt", "k").await.unwrap().unwrap();
        assert_eq!(loaded.size, 20);
        assert_eq!(loaded.parts.len(), 2);

        store.delete_object("bkt", "k").await.unwrap();
        assert!(store.get_object("bkt", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn policies_are_looked_up_by_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let policy = Policy {
            id: Uuid::new_v4(),
            name: "hourly".into(),
            interval_secs: 3600,
            created_at: Utc::now(),
        };
        store.create_policy(&policy).await.unwrap();
        assert_eq!(store.get_policy(policy.id).await.unwrap().interval_secs, 3600);
        assert!(store.get_policy(Uuid::new_v4()).await.unwrap_err().is_not_found());
        assert_eq!(store.list_policies().await.unwrap().len(), 1);
    }
}
