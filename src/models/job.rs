//! One execution of a plan.

use super::plan::{Plan, PlanType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub source_location: String,
    pub dest_location: String,
    pub status: JobStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub over_write: bool,
    pub remain_source: bool,
    pub total_count: i64,
    pub passed_count: i64,
    pub total_capacity: i64,
    pub passed_capacity: i64,
    pub message: Option<String>,
}

impl Job {
    /// A fresh pending job for `plan` between two resolved locations.
    pub fn pending(plan: &Plan, source_location: String, dest_location: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            plan_type: plan.plan_type,
            source_location,
            dest_location,
            status: JobStatus::Pending,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            over_write: plan.over_write,
            remain_source: plan.remain_source,
            total_count: 0,
            passed_count: 0,
            total_capacity: 0,
            passed_capacity: 0,
            message: None,
        }
    }
}
