//! The three fetch stages of a refresh cycle and the rules that merge their
//! results into per-job records.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::time::Instant;

use futures::{stream, StreamExt};
use metrics::counter;
use nomon_client::{ClientError, DeploymentStub, JobListStub, JobScaleStatus, NomadApi};
use nomon_core::{DeploymentStatus, Job, Task};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// One job as reported by the job listing, before scale and deployment lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub job_type: String,
    /// Task group -> running count, sorted by task group name.
    pub running: BTreeMap<String, u64>,
}

impl From<JobListStub> for JobSummary {
    fn from(stub: JobListStub) -> Self {
        let id = stub.job_id().to_string();
        let running = stub
            .job_summary
            .map(|s| s.summary.into_iter().map(|(tg, v)| (tg, v.running)).collect())
            .unwrap_or_default();
        Self { id, name: stub.name, status: stub.status, job_type: stub.job_type, running }
    }
}

/// Fetch the job list. A failure here aborts the whole cycle.
pub async fn list_jobs(api: &dyn NomadApi) -> Result<Vec<JobSummary>, ClientError> {
    let t0 = Instant::now();
    let stubs = api.list_jobs().await?;
    let jobs: Vec<JobSummary> = stubs.into_iter().map(JobSummary::from).collect();
    debug!(count = jobs.len(), took_ms = %t0.elapsed().as_millis(), "lister: jobs listed");
    Ok(jobs)
}

/// Fetch the deployment history and reduce it to the latest status per job ID.
pub async fn resolve_deployments(api: &dyn NomadApi) -> Result<FxHashMap<String, DeploymentStatus>, ClientError> {
    let t0 = Instant::now();
    let list = api.list_deployments().await?;
    let total = list.len();
    let latest = latest_per_job(list);
    debug!(deployments = total, jobs = latest.len(), took_ms = %t0.elapsed().as_millis(), "deployments: resolved");
    Ok(latest)
}

/// Keep the deployment with the greatest `CreateIndex` per job. Equal (or
/// missing) indexes fall back to list order: the later entry wins. Entries
/// without a job ID are skipped.
pub fn latest_per_job(list: Vec<DeploymentStub>) -> FxHashMap<String, DeploymentStatus> {
    let mut best: FxHashMap<String, (u64, DeploymentStatus)> = FxHashMap::default();
    for d in list {
        if d.job_id.is_empty() {
            continue;
        }
        let status = DeploymentStatus::parse(&d.status);
        match best.entry(d.job_id) {
            Entry::Vacant(e) => {
                e.insert((d.create_index, status));
            }
            Entry::Occupied(mut e) => {
                if d.create_index >= e.get().0 {
                    e.insert((d.create_index, status));
                }
            }
        }
    }
    best.into_iter().map(|(job, (_, status))| (job, status)).collect()
}

/// Result of the scale fan-out. Each job lands in exactly one of the two sets.
#[derive(Debug, Default)]
pub struct ScaleOutcome {
    /// Job ID -> task groups with desired/running from the scale endpoint.
    pub resolved: FxHashMap<String, BTreeMap<String, Task>>,
    /// Job IDs whose lookup failed, sorted by ID.
    pub failed: Vec<(String, ClientError)>,
}

impl ScaleOutcome {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Fetch scale status for every job, at most `limit` requests in flight.
/// Returns once every request has completed; per-job failures are collected,
/// never propagated.
pub async fn resolve_scale(api: &dyn NomadApi, job_ids: &[String], limit: usize) -> ScaleOutcome {
    let t0 = Instant::now();
    let mut outcome = ScaleOutcome::default();
    let mut results = stream::iter(job_ids.iter().cloned())
        .map(|id| async move {
            let res = api.job_scale(&id).await;
            (id, res)
        })
        .buffer_unordered(limit.max(1));

    while let Some((id, res)) = results.next().await {
        match res {
            Ok(scale) => {
                outcome.resolved.insert(id, tasks_from_scale(&scale));
            }
            Err(e) => {
                warn!(job = %id, kind = e.kind(), error = %e, "scale: lookup failed; keeping summary counts");
                counter!("nomon_scale_failures_total", "kind" => e.kind()).increment(1);
                outcome.failed.push((id, e));
            }
        }
    }
    outcome.failed.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(
        jobs = job_ids.len(),
        failed = outcome.failed.len(),
        took_ms = %t0.elapsed().as_millis(),
        "scale: fan-out done"
    );
    outcome
}

fn tasks_from_scale(scale: &JobScaleStatus) -> BTreeMap<String, Task> {
    scale
        .task_groups
        .iter()
        .map(|(tg, s)| (tg.clone(), Task { expected: s.desired, running: s.running }))
        .collect()
}

/// Fresh per-job records from the listing: running counts from the summary,
/// nothing expected yet, deployment unknown.
pub fn scaffold(summaries: &[JobSummary]) -> BTreeMap<String, Job> {
    let mut jobs = BTreeMap::new();
    for s in summaries {
        let tasks = s.running.iter().map(|(tg, running)| (tg.clone(), Task { expected: 0, running: *running })).collect();
        let job = Job {
            id: s.id.clone(),
            name: s.name.clone(),
            status: s.status.clone(),
            job_type: s.job_type.clone(),
            deployment: DeploymentStatus::Unknown,
            tasks,
        };
        if jobs.insert(s.name.clone(), job).is_some() {
            warn!(job = %s.name, "lister: duplicate job name; keeping the last entry");
        }
    }
    jobs
}

/// Set every job's deployment from `latest`; jobs without an entry read `unknown`.
pub fn apply_deployments(jobs: &mut BTreeMap<String, Job>, latest: &FxHashMap<String, DeploymentStatus>) {
    for job in jobs.values_mut() {
        job.deployment = latest.get(&job.id).copied().unwrap_or_default();
    }
}

/// Overwrite task groups with scale results. Groups only the summary knows
/// keep their summary counts; jobs without a result are left untouched.
pub fn apply_scale(jobs: &mut BTreeMap<String, Job>, outcome: &ScaleOutcome) {
    for job in jobs.values_mut() {
        if let Some(groups) = outcome.resolved.get(&job.id) {
            for (tg, task) in groups {
                job.tasks.insert(tg.clone(), *task);
            }
        }
    }
}
