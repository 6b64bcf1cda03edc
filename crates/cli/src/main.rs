use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use nomon_core::{ClusterConfig, ClusterSnapshot, Job};
use nomon_store::{resolve, spawn_refresher, Aggregator};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nomonctl", version, about = "Nomad job monitor")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Nomad namespace (default: $NOMAD_NAMESPACE, then "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Nomad address (default: $NOMAD_ADDR)
    #[arg(long = "addr", global = true)]
    addr: Option<String>,

    /// Force debug logging regardless of NOMON_LOG
    #[arg(long = "debug", global = true, action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh once and print every job
    Jobs,
    /// Refresh on an interval and print each new snapshot until Ctrl-C
    Watch {
        /// Refresh interval in milliseconds
        #[arg(long = "interval-ms", default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Print the latest deployment status per job
    Deployments,
}

fn init_tracing(debug: bool) {
    let env = if debug { "debug".to_string() } else { std::env::var("NOMON_LOG").unwrap_or_else(|_| "info".to_string()) };
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NOMON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NOMON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Environment, with `--addr`/`--ns` taking precedence.
fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    let cfg = ClusterConfig::from_lookup(|key| {
        let flag = match key {
            "NOMAD_ADDR" => cli.addr.clone(),
            "NOMAD_NAMESPACE" => cli.namespace.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();

    let cfg = load_config(&cli).context("loading cluster configuration")?;
    let agg = Arc::new(Aggregator::from_config(&cfg).context("building Nomad client")?);

    match cli.command {
        Commands::Jobs => {
            info!(endpoint = %cfg.endpoint(), ns = %cfg.namespace(), "jobs invoked");
            let report = agg.refresh().await?;
            if !report.scale_failures.is_empty() {
                warn!(jobs = ?report.scale_failures, "scale lookup failed; counts come from the job summary");
            }
            print_snapshot(&agg.state().current(), cli.output)?;
        }
        Commands::Watch { interval_ms } => {
            info!(endpoint = %cfg.endpoint(), ns = %cfg.namespace(), interval_ms, "watch invoked");
            let state = agg.state();
            let mut epochs = state.subscribe_epoch();
            let refresher = spawn_refresher(agg.clone(), Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            warn!("snapshot channel closed; exiting watch loop");
                            break;
                        }
                        let snap = state.current();
                        if matches!(cli.output, Output::Human) {
                            println!("{}", status_line(&snap));
                        }
                        print_snapshot(&snap, cli.output)?;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            refresher.abort();
        }
        Commands::Deployments => {
            info!(endpoint = %cfg.endpoint(), ns = %cfg.namespace(), "deployments invoked");
            match resolve::resolve_deployments(agg.api().as_ref()).await {
                Ok(latest) => {
                    let sorted: BTreeMap<_, _> = latest.into_iter().collect();
                    match cli.output {
                        Output::Human => {
                            println!("{:<32} {}", "JOB", "DEPLOYMENT");
                            for (job, status) in &sorted {
                                println!("{:<32} {}", job, status);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&sorted)?),
                    }
                }
                Err(e) => {
                    error!(error = %e, "deployments failed");
                    return Err(e).context("fetching deployment history");
                }
            }
        }
    }

    Ok(())
}

fn print_snapshot(snap: &ClusterSnapshot, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<32} {:<10} {:<9} {:<12} {:<7} TASKS", "NAME", "STATUS", "TYPE", "DEPLOYMENT", "READY");
            for job in snap.jobs.values() {
                println!(
                    "{:<32} {:<10} {:<9} {:<12} {:<7} {}",
                    job.name,
                    job.status,
                    job.job_type,
                    job.deployment,
                    ready(job),
                    render_tasks(job)
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string(snap)?),
    }
    Ok(())
}

fn status_line(snap: &ClusterSnapshot) -> String {
    let at = snap.refreshed_at.map(|t| t.format("%H:%M:%S").to_string()).unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "-- epoch {} at {} • {} jobs • {} ms",
        snap.epoch,
        at,
        snap.len(),
        snap.refresh_duration.as_millis()
    );
    if snap.degraded.scale_failures > 0 {
        line.push_str(&format!(" • {} scale lookups failed", snap.degraded.scale_failures));
    }
    if snap.degraded.deployments_unavailable {
        line.push_str(" • deployments unavailable");
    }
    line
}

/// Running over expected instances, summed across task groups.
fn ready(job: &Job) -> String {
    format!("{}/{}", job.running_total(), job.expected_total())
}

/// `group running/expected`, comma separated, in group order.
fn render_tasks(job: &Job) -> String {
    if job.tasks.is_empty() {
        return "-".to_string();
    }
    job.tasks
        .iter()
        .map(|(tg, t)| format!("{} {}/{}", tg, t.running, t.expected))
        .collect::<Vec<_>>()
        .join(", ")
}
