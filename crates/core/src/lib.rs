//! Nomon core types: the per-job record and the published cluster snapshot.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{ClusterConfig, ConfigError};

/// Desired and running instance counts of one task group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Task {
    pub expected: u64,
    pub running: u64,
}

/// Status of the most recent deployment of a job.
///
/// `Unknown` is the default and the fallback whenever a job has no
/// deployment in the history or the history could not be fetched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Successful,
    Failed,
    Running,
    Pending,
    Paused,
    Blocked,
    Unblocking,
    Initializing,
    Cancelled,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Successful => "successful",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Paused => "paused",
            DeploymentStatus::Blocked => "blocked",
            DeploymentStatus::Unblocking => "unblocking",
            DeploymentStatus::Initializing => "initializing",
            DeploymentStatus::Cancelled => "cancelled",
            DeploymentStatus::Unknown => "unknown",
        }
    }

    /// Parse a status as reported by the orchestrator. Unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "successful" => DeploymentStatus::Successful,
            "failed" => DeploymentStatus::Failed,
            "running" => DeploymentStatus::Running,
            "pending" => DeploymentStatus::Pending,
            "paused" => DeploymentStatus::Paused,
            "blocked" => DeploymentStatus::Blocked,
            "unblocking" => DeploymentStatus::Unblocking,
            "initializing" => DeploymentStatus::Initializing,
            "cancelled" => DeploymentStatus::Cancelled,
            _ => DeploymentStatus::Unknown,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One job as of a single refresh cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    /// Orchestrator job ID; addresses per-job endpoints and deployments.
    pub id: String,
    pub name: String,
    pub status: String,
    /// Scheduler class (service, batch, system, sysbatch).
    #[serde(rename = "type")]
    pub job_type: String,
    pub deployment: DeploymentStatus,
    /// Task groups keyed (and therefore ordered) by name.
    pub tasks: BTreeMap<String, Task>,
}

impl Job {
    pub fn expected_total(&self) -> u64 {
        self.tasks.values().map(|t| t.expected).sum()
    }

    pub fn running_total(&self) -> u64 {
        self.tasks.values().map(|t| t.running).sum()
    }
}

/// Lookups that failed during the cycle which produced a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Degraded {
    /// Jobs whose scale lookup failed and fell back to summary counts.
    pub scale_failures: usize,
    /// The deployment history could not be fetched; every job reads `unknown`.
    pub deployments_unavailable: bool,
}

impl Degraded {
    pub fn is_clean(&self) -> bool {
        self.scale_failures == 0 && !self.deployments_unavailable
    }
}

/// Complete, immutable view of a cluster as of one refresh cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterSnapshot {
    /// Publish counter; 0 means nothing has been published yet.
    pub epoch: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refresh_duration: Duration,
    pub degraded: Degraded,
    pub jobs: BTreeMap<String, Job>,
}

impl ClusterSnapshot {
    pub fn get(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub mod prelude {
    pub use super::{ClusterConfig, ClusterSnapshot, Degraded, DeploymentStatus, Job, Task};
}
