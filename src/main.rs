use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};

use ramutex::chaos::{ClusterManager, SleepWork};
use ramutex::config::{LogFormat, ObservabilityConfig, Settings};
use ramutex::ra::NodeId;

/// Time each node spends inside the critical section.
const CRITICAL_WORK: Duration = Duration::from_millis(500);

/// Upper bound on how long one demo round may take.
const ROUND_TIMEOUT: Duration = Duration::from_secs(60);

const CONTENTION_ROUNDS: usize = 3;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let config_path = match args.get(1).map(String::as_str) {
        None => None,
        Some("-h") | Some("--help") | Some("help") => {
            print_usage();
            return Ok(());
        }
        Some(path) => Some(PathBuf::from(path)),
    };

    let settings = Settings::load(config_path.as_deref()).context("failed to load configuration")?;
    init_tracing(&settings.observability)?;

    tracing::info!(
        nodes = settings.cluster.len(),
        failure_rate = settings.chaos.failure_rate,
        max_attempts = settings.protocol.max_attempts,
        "starting demo cluster"
    );

    run_demo(&settings)
}

fn print_usage() {
    eprintln!("Usage: ramutex [CONFIG]");
    eprintln!();
    eprintln!("Runs concurrent, sequential and high-contention rounds of");
    eprintln!("Ricart-Agrawala mutual exclusion on an in-process cluster.");
    eprintln!();
    eprintln!("  CONFIG   TOML file layered over the built-in defaults");
    eprintln!();
    eprintln!("Environment overrides use the RAMUTEX_ prefix, e.g.");
    eprintln!("  RAMUTEX_CHAOS__FAILURE_RATE=0.2");
}

fn init_tracing(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(config.log_level.as_str());
    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!(e)).context("failed to install log subscriber")
}

fn run_demo(settings: &Settings) -> anyhow::Result<()> {
    let work = Arc::new(SleepWork(CRITICAL_WORK));
    let mut cluster = ClusterManager::from_settings(settings, work).context("failed to start cluster")?;
    let ids: Vec<NodeId> = cluster.cluster().node_ids().collect();

    banner("ROUND 1: Concurrent CS requests");
    round(&cluster, &ids, Duration::from_millis(100))?;

    banner("ROUND 2: Sequential CS requests");
    let mut reversed = ids.clone();
    reversed.reverse();
    round(&cluster, &reversed[..reversed.len().min(2)], Duration::from_millis(100))?;

    banner("ROUND 3: High contention scenario");
    for i in 0..CONTENTION_ROUNDS {
        println!("Contention round {}/{}", i + 1, CONTENTION_ROUNDS);
        round(&cluster, &ids, Duration::from_millis(50))?;
    }

    banner("FINAL STATISTICS");
    for (node_id, stats) in cluster.all_statistics() {
        println!("Node {}:", node_id);
        println!("{}", stats);
    }

    let result = cluster.verify();
    println!();
    println!(
        "History: {} requests, {} entries, {} cancelled, {} peers presumed dead",
        result.stats.requests, result.stats.entries, result.stats.cancellations, result.stats.presumed_dead
    );
    for violation in &result.violations {
        println!("  {:?}: {}", violation.kind, violation.description);
    }

    cluster.shutdown_all();

    if !result.passed {
        bail!("mutual exclusion check failed with {} violations", result.violations.len());
    }
    println!("Mutual exclusion held.");
    Ok(())
}

/// Have each node in `order` request the critical section, `spacing`
/// apart, then wait for the cluster to go quiet.
fn round(cluster: &ClusterManager, order: &[NodeId], spacing: Duration) -> anyhow::Result<()> {
    let before = cluster.history().snapshot().entry_order().len();

    for (i, &node_id) in order.iter().enumerate() {
        if i > 0 {
            thread::sleep(spacing);
        }
        println!("Node {} requesting critical section", node_id);
        cluster.request_critical_section(node_id);
    }

    if !cluster.wait_until_idle(ROUND_TIMEOUT) {
        bail!("cluster did not settle within {:?}", ROUND_TIMEOUT);
    }

    let entries = cluster.history().snapshot().entry_order();
    let granted: Vec<String> = entries[before..].iter().map(|id| id.to_string()).collect();
    println!("Critical section order: [{}]", granted.join(", "));
    Ok(())
}

fn banner(title: &str) {
    println!();
    println!("{}", "=".repeat(40));
    println!("{}", title);
    println!("{}", "=".repeat(40));
}
