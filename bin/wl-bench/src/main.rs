//! Workload Bench
//!
//! Runs a synthetic, contended workload through the worker pool against an
//! in-memory simulated store and reports call metrics while it runs:
//! - `<label>`: account transfers as retried session transactions
//! - `balance`: follower-read balance queries
//! - `ping`: plain statements through a retrying decorator
//!
//! Configuration comes from `workload.toml` (see `--example-config`) and
//! `WORKLOAD_*` environment variables; command line flags win over both.

mod simulated;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::FutureExt;
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use simulated::SimulatedStore;
use wl_config::{AppConfig, ConfigLoader};
use wl_engine::{
    retryable, CounterSnapshot, EngineError, MetricsConfig, MetricsRegistry, MetricsSummary,
    PoolController, PoolSizing, PoolStats, RetryPolicy, RetryingInvoker, Task, TaskOutcome,
};

const ACCOUNTS: usize = 100;
const OPENING_BALANCE: i64 = 10_000;

#[derive(Parser, Debug)]
#[command(name = "wl-bench")]
#[command(about = "Workload Engine bench - contended transactions against a simulated store")]
struct Args {
    /// Config file path
    #[arg(long, env = "WORKLOAD_CONFIG")]
    config: Option<String>,

    /// How long every task loop runs
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Task loops per workload
    #[arg(long)]
    tasks: Option<u32>,

    /// Worker count
    #[arg(long)]
    pool_size: Option<i32>,

    /// Admission capacity
    #[arg(long)]
    queue_size: Option<i32>,

    /// Do not print the metrics table while running
    #[arg(long, default_value = "false")]
    quiet: bool,

    /// Print final pool stats and metrics as JSON
    #[arg(long, default_value = "false")]
    json: bool,

    /// Print an example configuration file and exit
    #[arg(long, default_value = "false")]
    example_config: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    pool: PoolStats,
    summary: MetricsSummary,
    metrics: Vec<CounterSnapshot>,
    total_balance: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    if args.example_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    wl_common::logging::init_logging("wl-bench");

    let config = load_config(&args)?;
    let sizing = PoolSizing::new(
        config.pool.effective_pool_size(),
        config.pool.effective_queue_size(),
    )?;

    info!(
        core_size = sizing.core_size,
        queue_capacity = sizing.queue_capacity,
        tasks = config.workload.tasks,
        duration_secs = config.workload.duration_secs,
        transient_rate = config.workload.transient_rate,
        "Starting workload bench"
    );

    let registry = Arc::new(MetricsRegistry::with_config(MetricsConfig {
        ring_capacity: config.metrics.ring_capacity,
    }));
    let controller = Arc::new(PoolController::new(sizing, Arc::clone(&registry))?);
    let store = Arc::new(SimulatedStore::new(ACCOUNTS, OPENING_BALANCE, &config.workload));

    // Hold a reference per label so the final report still sees counters
    // whose loops have all finished
    let labels = [config.workload.label.clone(), "balance".to_string(), "ping".to_string()];
    for label in &labels {
        registry.add(label);
    }

    let submitter = tokio::spawn(submit_workloads(
        Arc::clone(&controller),
        Arc::clone(&store),
        config.clone(),
    ));

    let reporter = if config.metrics.print_metrics {
        Some(tokio::spawn(report_metrics(
            Arc::clone(&controller),
            Duration::from_secs(config.metrics.report_interval_secs),
        )))
    } else {
        None
    };

    let shutdown_timeout = Duration::from_secs(config.pool.shutdown_timeout_secs);
    tokio::select! {
        outcomes = submitter => {
            match outcomes {
                Ok(outcomes) => log_outcomes(&outcomes),
                Err(e) => error!(error = %e, "Workload submitter failed"),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let graceful = controller.shutdown(shutdown_timeout).await;
    if !graceful {
        warn!("Some task loops had to be interrupted");
    }

    let metrics = registry.snapshots();
    for label in &labels {
        registry.remove(label);
    }

    let report = Report {
        pool: controller.stats(),
        summary: MetricsSummary::from_snapshots(&metrics),
        metrics,
        total_balance: store.total_balance(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let expected = ACCOUNTS as i64 * OPENING_BALANCE;
    if report.total_balance != expected {
        error!(expected, actual = report.total_balance, "Total balance drifted");
        anyhow::bail!("total balance drifted from {} to {}", expected, report.total_balance);
    }

    info!("Workload bench finished");
    Ok(())
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;

    if let Some(secs) = args.duration_secs {
        config.workload.duration_secs = secs;
    }
    if let Some(tasks) = args.tasks {
        config.workload.tasks = tasks;
    }
    if let Some(size) = args.pool_size {
        config.pool.thread_pool_size = size;
    }
    if let Some(size) = args.queue_size {
        config.pool.thread_queue_size = size;
    }
    if args.quiet {
        config.metrics.print_metrics = false;
    }

    config.validate()?;
    Ok(config)
}

/// Submit every task loop, then wait for all of them to finish
async fn submit_workloads(
    controller: Arc<PoolController>,
    store: Arc<SimulatedStore>,
    config: AppConfig,
) -> Vec<TaskOutcome> {
    let duration = Duration::from_secs(config.workload.duration_secs);
    let mut loops = JoinSet::new();

    for i in 0..config.workload.tasks {
        for task in workload_tasks(&store, &config, duration) {
            let label = task.label().to_string();
            match controller.submit(task).await {
                Ok(handle) => {
                    loops.spawn(handle.join());
                }
                Err(e) => {
                    warn!(label = %label, round = i, error = %e, "Task not admitted, stopping submission");
                    return collect(loops).await;
                }
            }
        }
    }

    collect(loops).await
}

async fn collect(mut loops: JoinSet<wl_engine::Result<TaskOutcome>>) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::new();
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(e)) => error!(error = %e, "Task loop failed"),
            Err(e) => error!(error = %e, "Join failed"),
        }
    }
    outcomes
}

/// One task per workload kind
fn workload_tasks(store: &Arc<SimulatedStore>, config: &AppConfig, duration: Duration) -> Vec<Task> {
    vec![
        transfer_task(store, &config.workload.label, config.retry.clone(), duration),
        balance_task(store, config.retry.clone(), duration),
        ping_task(store, config.retry.clone(), duration),
    ]
}

fn transfer_task(store: &Arc<SimulatedStore>, label: &str, policy: RetryPolicy, duration: Duration) -> Task {
    let invoker = RetryingInvoker::new(label, policy);
    let store = Arc::clone(store);

    Task::new(label, duration, move || {
        let invoker = invoker.clone();
        let store = Arc::clone(&store);
        async move {
            let (from, to, amount) = store.random_transfer();
            let mut session = store.session();
            invoker
                .invoke_in_session(&mut session, |s| {
                    async move { s.transfer(from, to, amount).await }.boxed()
                })
                .await
                .map_err(EngineError::into_anyhow)
        }
    })
}

fn balance_task(store: &Arc<SimulatedStore>, policy: RetryPolicy, duration: Duration) -> Task {
    let invoker = RetryingInvoker::new("balance", policy.follower_read());
    let store = Arc::clone(store);

    Task::new("balance", duration, move || {
        let invoker = invoker.clone();
        let store = Arc::clone(&store);
        async move {
            let account = store.random_account();
            let mut session = store.session();
            invoker
                .invoke_in_session(&mut session, |s| {
                    async move { s.balance(account).await.map(|_| ()) }.boxed()
                })
                .await
                .map_err(EngineError::into_anyhow)
        }
    })
}

fn ping_task(store: &Arc<SimulatedStore>, policy: RetryPolicy, duration: Duration) -> Task {
    let store = Arc::clone(store);
    let op = retryable("ping", policy, move || {
        let store = Arc::clone(&store);
        async move { store.ping().await }
    });
    Task::new("ping", duration, op)
}

/// Print the metrics table every `interval` while any worker is active
async fn report_metrics(controller: Arc<PoolController>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !controller.has_active_workers() {
            continue;
        }

        let registry = controller.registry();
        println!("{}", registry.pretty_print_header());
        registry.pretty_print_body(|row| println!("{}", row));
        println!("{}", registry.pretty_print_footer());

        let stats = controller.stats();
        info!(
            active = stats.active_workers,
            queued = stats.queued_tasks,
            available_permits = stats.available_permits,
            waiting = stats.waiting_submitters,
            "Pool status"
        );
    }
}

fn log_outcomes(outcomes: &[TaskOutcome]) {
    for outcome in outcomes {
        info!(
            label = %outcome.label,
            iterations = outcome.iterations,
            failures = outcome.failures,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            exit = ?outcome.exit,
            "Task loop finished"
        );
    }
}

fn print_report(report: &Report) {
    println!();
    println!(
        "pool: state={} core={} queue={} active={} queued={} permits={} waiting={}",
        report.pool.state,
        report.pool.core_size,
        report.pool.queue_capacity,
        report.pool.active_workers,
        report.pool.queued_tasks,
        report.pool.available_permits,
        report.pool.waiting_submitters,
    );
    for snapshot in &report.metrics {
        println!(
            "{}: {:.1} op/s, p50 {:.2}ms, p99 {:.2}ms, ok {}, fail {}",
            snapshot.label,
            snapshot.ops_per_sec,
            snapshot.p50_ms,
            snapshot.p99_ms,
            snapshot.success,
            snapshot.failure
        );
    }
    println!(
        "total: {:.1} op/s, ok {}, fail {}, balance {}",
        report.summary.ops_per_sec, report.summary.success, report.summary.failure, report.total_balance
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
