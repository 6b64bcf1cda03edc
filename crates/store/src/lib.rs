//! Nomon store: refresh cycle aggregator and the atomically published cluster snapshot.
//!
//! A cycle lists jobs, then resolves deployments and scale concurrently,
//! merges everything into a scratch map and swaps it in as the new snapshot.
//! Readers only ever see whole snapshots.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use metrics::{counter, gauge, histogram};
use nomon_client::{ClientError, NomadApi, NomadClient};
use nomon_core::{ClusterConfig, ClusterSnapshot, Degraded, Job};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub mod resolve;

pub use resolve::{JobSummary, ScaleOutcome};

/// Where the aggregator currently is within a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Listing,
    Resolving,
    Merging,
    Published,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Job listing failed; the previous snapshot is still published.
    #[error("listing jobs: {0}")]
    List(#[source] ClientError),
    #[error("a refresh is already in flight for this cluster")]
    InFlight,
}

/// Summary of one successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub epoch: u64,
    pub jobs: usize,
    /// IDs of jobs whose scale lookup failed, sorted.
    pub scale_failures: Vec<String>,
    pub deployments_unavailable: bool,
    pub took: Duration,
}

/// Published state of one cluster, shared between the refresher and readers.
pub struct ClusterState {
    snap: ArcSwap<ClusterSnapshot>,
    epoch_tx: watch::Sender<u64>,
    phase_tx: watch::Sender<RefreshPhase>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (phase_tx, _) = watch::channel(RefreshPhase::Idle);
        Self { snap: ArcSwap::from_pointee(ClusterSnapshot::default()), epoch_tx, phase_tx }
    }

    /// Current snapshot. Cheap; the returned `Arc` stays valid across later swaps.
    pub fn current(&self) -> Arc<ClusterSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase_tx.borrow()
    }

    /// Duration of the cycle behind the current snapshot, if one was published.
    pub fn last_refresh_duration(&self) -> Option<Duration> {
        let snap = self.snap.load();
        (snap.epoch > 0).then_some(snap.refresh_duration)
    }

    fn set_phase(&self, phase: RefreshPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Swap in a fully built job map. Only the aggregator (under its cycle lock) calls this.
    fn publish(&self, jobs: BTreeMap<String, Job>, took: Duration, degraded: Degraded) -> u64 {
        let epoch = self.snap.load().epoch.saturating_add(1);
        let count = jobs.len();
        let next = ClusterSnapshot { epoch, refreshed_at: Some(chrono::Utc::now()), refresh_duration: took, degraded, jobs };
        self.snap.store(Arc::new(next));
        self.epoch_tx.send_replace(epoch);
        gauge!("nomon_jobs").set(count as f64);
        epoch
    }
}

/// Drives refresh cycles for one cluster and publishes into its `ClusterState`.
pub struct Aggregator {
    api: Arc<dyn NomadApi>,
    state: Arc<ClusterState>,
    concurrency: usize,
    cycle: Mutex<()>,
}

impl Aggregator {
    pub fn new(api: Arc<dyn NomadApi>, concurrency: usize) -> Self {
        Self { api, state: Arc::new(ClusterState::new()), concurrency: concurrency.max(1), cycle: Mutex::new(()) }
    }

    /// Build the HTTP transport from `cfg` and an aggregator on top of it.
    pub fn from_config(cfg: &ClusterConfig) -> Result<Self, ClientError> {
        let client = NomadClient::new(cfg)?;
        Ok(Self::new(Arc::new(client), cfg.scale_concurrency()))
    }

    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state)
    }

    pub fn api(&self) -> Arc<dyn NomadApi> {
        Arc::clone(&self.api)
    }

    /// Run one cycle. Overlapping calls are rejected with `InFlight` rather than queued.
    pub async fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let _cycle = self.cycle.try_lock().map_err(|_| RefreshError::InFlight)?;
        let started = Instant::now();
        let api = self.api.as_ref();

        self.state.set_phase(RefreshPhase::Listing);
        let summaries = match resolve::list_jobs(api).await {
            Ok(v) => v,
            Err(e) => {
                self.state.set_phase(RefreshPhase::Idle);
                counter!("nomon_refresh_total", "outcome" => "list_failed").increment(1);
                return Err(RefreshError::List(e));
            }
        };
        let mut jobs = resolve::scaffold(&summaries);
        let ids: Vec<String> = summaries.iter().map(|s| s.id.clone()).collect();

        self.state.set_phase(RefreshPhase::Resolving);
        let (deployments, scale) = tokio::join!(
            resolve::resolve_deployments(api),
            resolve::resolve_scale(api, &ids, self.concurrency),
        );

        self.state.set_phase(RefreshPhase::Merging);
        let deployments_unavailable = match deployments {
            Ok(latest) => {
                resolve::apply_deployments(&mut jobs, &latest);
                false
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "deployments: lookup failed; every job reads unknown");
                counter!("nomon_deployment_failures_total", "kind" => e.kind()).increment(1);
                true
            }
        };
        resolve::apply_scale(&mut jobs, &scale);

        let took = started.elapsed();
        let degraded = Degraded { scale_failures: scale.failed.len(), deployments_unavailable };
        let count = jobs.len();
        let epoch = self.state.publish(jobs, took, degraded);
        self.state.set_phase(RefreshPhase::Published);

        histogram!("nomon_refresh_ms").record(took.as_secs_f64() * 1000.0);
        let outcome = if degraded.is_clean() { "ok" } else { "degraded" };
        counter!("nomon_refresh_total", "outcome" => outcome).increment(1);
        debug!(epoch, jobs = count, scale_failures = degraded.scale_failures, took_ms = %took.as_millis(), "refresh: published");

        Ok(RefreshReport { epoch, jobs: count, scale_failures: scale.failed_ids(), deployments_unavailable, took })
    }
}

/// Refresh every `every` until the returned task is aborted. Ticks missed while a
/// slow cycle runs are skipped, so cycles never overlap or pile up.
pub fn spawn_refresher(agg: Arc<Aggregator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every_ms = %every.as_millis(), "refresher started");
        loop {
            ticker.tick().await;
            match agg.refresh().await {
                Ok(report) if !report.scale_failures.is_empty() || report.deployments_unavailable => {
                    info!(
                        epoch = report.epoch,
                        scale_failures = report.scale_failures.len(),
                        deployments_unavailable = report.deployments_unavailable,
                        "refresh: published degraded snapshot"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "refresh failed; keeping previous snapshot"),
            }
        }
    })
}
