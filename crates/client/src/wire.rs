//! Wire shapes of the Nomad endpoints we read. Only the fields we use are kept;
//! everything else in the payload is ignored.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Entry of `GET /v1/jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JobListStub {
    #[serde(rename = "ID", default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "Type", default)]
    pub job_type: String,
    #[serde(default)]
    pub job_summary: Option<JobSummaryStub>,
}

impl JobListStub {
    /// Job ID, falling back to the name when the listing omits it.
    pub fn job_id(&self) -> &str {
        if self.id.is_empty() { &self.name } else { &self.id }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JobSummaryStub {
    #[serde(default)]
    pub summary: BTreeMap<String, TaskGroupSummary>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroupSummary {
    #[serde(default)]
    pub running: u64,
}

/// Entry of `GET /v1/deployments`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentStub {
    /// Empty when the entry carries no job; such entries match nothing.
    #[serde(rename = "JobID", default)]
    pub job_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub create_index: u64,
}

/// Body of `GET /v1/job/{id}/scale`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JobScaleStatus {
    #[serde(default)]
    pub task_groups: BTreeMap<String, TaskGroupScale>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroupScale {
    #[serde(default)]
    pub desired: u64,
    #[serde(default)]
    pub running: u64,
}
