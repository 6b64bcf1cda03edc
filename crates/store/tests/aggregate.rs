#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nomon_client::{
    ClientError, DeploymentStub, JobListStub, JobScaleStatus, JobSummaryStub, NomadApi, TaskGroupScale, TaskGroupSummary,
};
use nomon_core::{DeploymentStatus, Task};
use nomon_store::{Aggregator, RefreshError, RefreshPhase};

/// In-memory Nomad: jobs/deployments are `None` to fail, scale lookups for
/// unknown jobs fail with a gateway timeout.
#[derive(Default)]
struct MockApi {
    jobs: Mutex<Option<Vec<JobListStub>>>,
    deployments: Mutex<Option<Vec<DeploymentStub>>>,
    scales: Mutex<HashMap<String, JobScaleStatus>>,
    scale_delay: Mutex<Duration>,
    list_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    scale_calls: AtomicUsize,
}

impl MockApi {
    fn set_jobs(&self, jobs: Option<Vec<JobListStub>>) {
        *self.jobs.lock().unwrap() = jobs;
    }
    fn set_deployments(&self, deps: Option<Vec<DeploymentStub>>) {
        *self.deployments.lock().unwrap() = deps;
    }
    fn set_scale(&self, job: &str, groups: &[(&str, u64, u64)]) {
        let task_groups = groups
            .iter()
            .map(|(tg, desired, running)| (tg.to_string(), TaskGroupScale { desired: *desired, running: *running }))
            .collect();
        self.scales.lock().unwrap().insert(job.to_string(), JobScaleStatus { task_groups });
    }
    fn clear_scale(&self, job: &str) {
        self.scales.lock().unwrap().remove(job);
    }
}

#[async_trait::async_trait]
impl NomadApi for MockApi {
    async fn list_jobs(&self) -> Result<Vec<JobListStub>, ClientError> {
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let jobs = self.jobs.lock().unwrap().clone();
        jobs.ok_or_else(|| ClientError::Status { url: "mock:/v1/jobs".into(), status: 500, message: "no cluster leader".into() })
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentStub>, ClientError> {
        let deps = self.deployments.lock().unwrap().clone();
        deps.ok_or_else(|| ClientError::Status { url: "mock:/v1/deployments".into(), status: 500, message: "boom".into() })
    }

    async fn job_scale(&self, job_id: &str) -> Result<JobScaleStatus, ClientError> {
        self.scale_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.scale_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let res = self.scales.lock().unwrap().get(job_id).cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res.ok_or_else(|| ClientError::Status { url: format!("mock:/v1/job/{job_id}/scale"), status: 504, message: "timeout".into() })
    }
}

fn job(name: &str, groups: &[(&str, u64)]) -> JobListStub {
    let summary: BTreeMap<String, TaskGroupSummary> =
        groups.iter().map(|(tg, running)| (tg.to_string(), TaskGroupSummary { running: *running })).collect();
    JobListStub {
        id: name.to_string(),
        name: name.to_string(),
        status: "running".into(),
        job_type: "service".into(),
        job_summary: Some(JobSummaryStub { summary }),
    }
}

fn deployment(job: &str, status: &str, create_index: u64) -> DeploymentStub {
    DeploymentStub { job_id: job.into(), status: status.into(), create_index }
}

fn aggregator(api: &Arc<MockApi>, concurrency: usize) -> Aggregator {
    Aggregator::new(api.clone() as Arc<dyn NomadApi>, concurrency)
}

#[tokio::test]
async fn partial_failures_still_publish_every_job() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[("web", 1)]), job("b", &[("worker", 3)]), job("c", &[("batch", 0)])]));
    api.set_deployments(Some(vec![deployment("a", "successful", 10)]));
    api.set_scale("a", &[("web", 2, 2)]);
    api.set_scale("c", &[("batch", 3, 1)]);

    let agg = aggregator(&api, 32);
    let report = agg.refresh().await.unwrap();
    assert_eq!(report.epoch, 1);
    assert_eq!(report.jobs, 3);
    assert_eq!(report.scale_failures, vec!["b".to_string()]);
    assert!(!report.deployments_unavailable);

    let snap = agg.state().current();
    assert_eq!(snap.jobs.keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);

    let a = snap.get("a").unwrap();
    assert_eq!(a.deployment, DeploymentStatus::Successful);
    assert_eq!(a.tasks["web"], Task { expected: 2, running: 2 });

    let b = snap.get("b").unwrap();
    assert_eq!(b.deployment, DeploymentStatus::Unknown);
    assert_eq!(b.tasks["worker"], Task { expected: 0, running: 3 });

    let c = snap.get("c").unwrap();
    assert_eq!(c.deployment, DeploymentStatus::Unknown);
    assert_eq!(c.tasks["batch"], Task { expected: 3, running: 1 });

    assert_eq!(snap.degraded.scale_failures, 1);
    assert_eq!(agg.state().phase(), RefreshPhase::Published);
    assert!(agg.state().last_refresh_duration().is_some());
}

#[tokio::test]
async fn list_failure_keeps_previous_snapshot() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[("web", 1)])]));
    api.set_deployments(Some(vec![]));
    api.set_scale("a", &[("web", 1, 1)]);

    let agg = aggregator(&api, 4);
    agg.refresh().await.unwrap();
    let before = agg.state().current();

    api.set_jobs(None);
    let err = agg.refresh().await.unwrap_err();
    assert!(matches!(err, RefreshError::List(_)));
    assert_eq!(agg.state().phase(), RefreshPhase::Idle);

    let after = agg.state().current();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.epoch, 1);
    assert_eq!(after.get("a").unwrap().tasks["web"], Task { expected: 1, running: 1 });
}

#[tokio::test]
async fn list_failure_before_first_cycle_publishes_nothing() {
    let api = Arc::new(MockApi::default());
    let agg = aggregator(&api, 4);
    let mut epochs = agg.state().subscribe_epoch();

    assert!(agg.refresh().await.is_err());
    assert_eq!(agg.state().current().epoch, 0);
    assert!(agg.state().current().is_empty());
    assert!(agg.state().last_refresh_duration().is_none());
    assert!(!epochs.has_changed().unwrap());
}

#[tokio::test]
async fn each_cycle_rebuilds_from_scratch() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[("web", 1)]), job("gone", &[("x", 1)])]));
    api.set_deployments(Some(vec![deployment("a", "failed", 3)]));
    api.set_scale("a", &[("web", 4, 4)]);
    api.set_scale("gone", &[("x", 1, 1)]);

    let agg = aggregator(&api, 4);
    agg.refresh().await.unwrap();
    let first = agg.state().current();
    assert_eq!(first.get("a").unwrap().deployment, DeploymentStatus::Failed);

    // Deployment history no longer mentions `a`, its scale lookup now fails,
    // and `gone` was purged.
    api.set_jobs(Some(vec![job("a", &[("web", 2)])]));
    api.set_deployments(Some(vec![]));
    api.clear_scale("a");
    agg.refresh().await.unwrap();

    let second = agg.state().current();
    assert_eq!(second.epoch, 2);
    assert!(second.get("gone").is_none());
    let a = second.get("a").unwrap();
    assert_eq!(a.deployment, DeploymentStatus::Unknown);
    assert_eq!(a.tasks["web"], Task { expected: 0, running: 2 });

    // The earlier snapshot is untouched by the swap.
    assert_eq!(first.get("a").unwrap().tasks["web"], Task { expected: 4, running: 4 });
    assert!(first.get("gone").is_some());
}

#[tokio::test]
async fn deployment_history_failure_is_absorbed() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[("web", 1)])]));
    api.set_deployments(None);
    api.set_scale("a", &[("web", 1, 1)]);

    let agg = aggregator(&api, 4);
    let report = agg.refresh().await.unwrap();
    assert!(report.deployments_unavailable);
    let snap = agg.state().current();
    assert!(snap.degraded.deployments_unavailable);
    assert_eq!(snap.get("a").unwrap().deployment, DeploymentStatus::Unknown);
    assert_eq!(snap.get("a").unwrap().tasks["web"], Task { expected: 1, running: 1 });
}

#[tokio::test]
async fn latest_deployment_is_picked_regardless_of_order() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[])]));
    api.set_deployments(Some(vec![deployment("a", "successful", 90), deployment("a", "failed", 12)]));

    let agg = aggregator(&api, 4);
    agg.refresh().await.unwrap();
    assert_eq!(agg.state().current().get("a").unwrap().deployment, DeploymentStatus::Successful);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scale_requests_respect_concurrency_limit() {
    let api = Arc::new(MockApi::default());
    let names: Vec<String> = (0..40).map(|i| format!("job-{i:02}")).collect();
    api.set_jobs(Some(names.iter().map(|n| job(n, &[("g", 1)])).collect()));
    api.set_deployments(Some(vec![]));
    for n in &names {
        api.set_scale(n, &[("g", 1, 1)]);
    }
    *api.scale_delay.lock().unwrap() = Duration::from_millis(10);

    let agg = aggregator(&api, 4);
    let report = agg.refresh().await.unwrap();
    assert_eq!(report.jobs, 40);
    assert!(report.scale_failures.is_empty());
    assert_eq!(api.scale_calls.load(Ordering::SeqCst), 40);
    let peak = api.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak in-flight {peak} exceeded limit");
    assert!(peak > 1, "requests never overlapped");
    assert_eq!(api.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_refresh_is_rejected() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[])]));
    api.set_deployments(Some(vec![]));
    *api.list_delay.lock().unwrap() = Duration::from_millis(200);

    let agg = Arc::new(aggregator(&api, 4));
    let first = tokio::spawn({
        let agg = agg.clone();
        async move { agg.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agg.state().phase(), RefreshPhase::Listing);
    assert!(matches!(agg.refresh().await, Err(RefreshError::InFlight)));

    let report = first.await.unwrap().unwrap();
    assert_eq!(report.epoch, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_half_merged_job() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[("api", 0), ("worker", 0)]), job("b", &[("api", 0), ("worker", 0)])]));
    api.set_deployments(Some(vec![]));
    *api.scale_delay.lock().unwrap() = Duration::from_millis(2);

    let agg = Arc::new(aggregator(&api, 2));
    let state = agg.state();
    let stop = Arc::new(AtomicBool::new(false));
    let reader = tokio::spawn({
        let stop = stop.clone();
        async move {
            let mut seen = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let snap = state.current();
                for job in snap.jobs.values() {
                    let counts: Vec<u64> = job.tasks.values().map(|t| t.expected).collect();
                    assert!(counts.windows(2).all(|w| w[0] == w[1]), "torn job {}: {:?}", job.name, job.tasks);
                }
                seen += 1;
                tokio::task::yield_now().await;
            }
            seen
        }
    });

    for round in 1..=20u64 {
        for name in ["a", "b"] {
            api.set_scale(name, &[("api", round, round), ("worker", round, round)]);
        }
        let report = agg.refresh().await.unwrap();
        assert_eq!(report.epoch, round);
    }
    stop.store(true, Ordering::SeqCst);
    let seen = reader.await.unwrap();
    assert!(seen > 0);
    assert_eq!(agg.state().current().get("b").unwrap().tasks["worker"], Task { expected: 20, running: 20 });
}

#[tokio::test]
async fn epoch_subscribers_are_notified() {
    let api = Arc::new(MockApi::default());
    api.set_jobs(Some(vec![job("a", &[])]));
    api.set_deployments(Some(vec![]));

    let agg = aggregator(&api, 4);
    let mut rx = agg.state().subscribe_epoch();
    agg.refresh().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
    assert_eq!(*rx.borrow(), 1);
}
