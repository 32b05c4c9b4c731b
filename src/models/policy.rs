//! Recurring schedules that plans reference through `policyId`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    /// Seconds between two firings.
    pub interval_secs: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Policy {
    pub fn schedule(&self) -> Schedule {
        Schedule::every(Duration::from_secs(self.interval_secs.max(1)))
    }
}

/// Fire cadence handed to the trigger manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub every: Duration,
}

impl Schedule {
    pub fn every(every: Duration) -> Self {
        Self { every }
    }
}
