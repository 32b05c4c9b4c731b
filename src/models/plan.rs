//! A plan is the declared migration intent; jobs are its executions.

use super::connector::{Connector, Filter};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

/// Name reserved by the API for "every plan".
pub const RESERVED_PLAN_NAME: &str = "all";

static PLAN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[[:alnum:]_.-]+$").expect("plan name pattern compiles")
});

/// Plan names are non-empty runs of alphanumerics, `-`, `_` and `.`, and
/// never the reserved word `all`.
pub fn is_valid_plan_name(name: &str) -> bool {
    name != RESERVED_PLAN_NAME && PLAN_NAME.is_match(name)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    /// Run on demand only.
    #[default]
    Migration,
    /// Run on demand and on the cadence of its policy.
    Scheduled,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Migration => "migration",
            PlanType::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => PlanType::Scheduled,
            _ => PlanType::Migration,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub plan_type: PlanType,
    pub source_conn: Connector,
    pub dest_conn: Connector,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub policy_enabled: bool,
    #[serde(default)]
    pub over_write: bool,
    #[serde(default)]
    pub remain_source: bool,
    /// Unix seconds of the last scheduled firing, 0 when never fired.
    #[serde(default)]
    pub last_sched_time: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Whether this plan should hold a trigger registration.
    pub fn wants_trigger(&self) -> bool {
        self.policy_enabled && self.policy_id.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Fields a caller may change on an existing plan. Absent fields stay as
/// they are; `policy_id: Some("")` detaches the policy.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source_conn: Option<Connector>,
    pub dest_conn: Option<Connector>,
    pub filter: Option<Filter>,
    pub policy_enabled: Option<bool>,
    pub policy_id: Option<String>,
    pub over_write: Option<bool>,
    pub remain_source: Option<bool>,
}

impl PlanUpdate {
    /// True when the update touches the plan's trigger registration.
    pub fn touches_schedule(&self) -> bool {
        self.policy_enabled.is_some() || self.policy_id.is_some()
    }
}
