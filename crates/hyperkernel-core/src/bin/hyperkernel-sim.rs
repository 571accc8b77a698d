//! Seeded cluster simulator: runs the random workload against an
//! in-process cluster under injected faults and reports which safety
//! properties held.
//!
//! # Usage
//!
//! ```bash
//! # Ten seeds, fault free
//! hyperkernel-sim --seeds 10
//!
//! # Random crashes, partitions, packet loss and slot exhaustion
//! hyperkernel-sim --seeds 50 --random-faults --nodes 4 --steps 2000
//!
//! # Custom node tuning, and dump the final state of the last run
//! hyperkernel-sim --config node.json --snapshot final.json
//! ```
//!
//! The oracle report is printed as JSON on stdout.  The exit status is
//! nonzero if any `always` property was violated in any run.

use clap::Parser;
use hyperkernel_core::cluster::{Cluster, ClusterConfig};
use hyperkernel_core::config::NodeConfig;
use hyperkernel_core::workload::{self, WorkloadConfig};
use hyperkernel_fault::{EngineConfig, FaultEngine};
use log::{error, info};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "hyperkernel-sim")]
#[command(about = "Fault-injecting simulator for a federated hyperkernel")]
#[command(version)]
struct Cli {
    /// First seed; runs use consecutive seeds from here.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Number of seeded runs.
    #[arg(long, default_value = "1")]
    seeds: u64,

    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Execution slots per node.
    #[arg(long, default_value = "4")]
    slots: usize,

    /// Workload steps per run.
    #[arg(long, default_value = "500")]
    steps: u64,

    /// Guest pages the workload touches.
    #[arg(long, default_value = "16")]
    pages: u64,

    #[arg(long, default_value = "4")]
    vcpus: u32,

    /// Inject random faults, each repaired after a while.
    #[arg(long)]
    random_faults: bool,

    /// Frames between random faults.
    #[arg(long, default_value = "200")]
    fault_interval: u64,

    /// Node tuning as JSON (see `NodeConfig`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the final cluster state of the last run here as JSON.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let node = match &cli.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("loading {}: {e}", path.display());
                process::exit(2);
            }
        },
        None => NodeConfig::default(),
    };

    let mut engine = FaultEngine::new(EngineConfig {
        seed: cli.seed,
        num_nodes: cli.nodes,
        schedule: None,
        random_faults: cli.random_faults,
        random_fault_interval: cli.fault_interval,
        repair_after: cli.fault_interval / 2,
    });
    let workload = WorkloadConfig {
        steps: cli.steps,
        pages: cli.pages,
        vcpus: cli.vcpus,
        ..Default::default()
    };

    let mut last = None;
    for seed in cli.seed..cli.seed + cli.seeds {
        let cluster = match Cluster::new(&ClusterConfig {
            num_nodes: cli.nodes,
            slots_per_node: cli.slots,
            seed,
            node: node.clone(),
        }) {
            Ok(cluster) => cluster,
            Err(e) => {
                error!("{e}");
                process::exit(2);
            }
        };

        engine.begin_run(seed);
        let report = workload::run(&cluster, &mut engine, &workload);
        engine.end_run();

        info!(
            "seed {seed}: {} reads, {} writes, {} faults, {} violations",
            report.reads,
            report.writes,
            report.faults_fired,
            report.violations.len()
        );
        if !report.violations.is_empty() {
            error!("seed {seed}: {}", report.violations.join("; "));
        }
        last = Some(cluster);
    }

    if let (Some(path), Some(cluster)) = (&cli.snapshot, &last) {
        let written = serde_json::to_string_pretty(&cluster.snapshot())
            .map_err(|e| e.to_string())
            .and_then(|json| fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            error!("writing {}: {e}", path.display());
        }
    }

    let report = engine.oracle().report();
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("serializing report: {e}"),
    }
    if !report.invariants_held() {
        process::exit(1);
    }
}
