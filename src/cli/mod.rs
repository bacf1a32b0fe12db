pub mod config;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::RunPlan;
use crate::utils::duration_arg;

#[derive(Parser, Debug)]
#[command(name = "hakai")]
#[command(about = "Distributed scenario-driven HTTP load generator", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Scenario runs per loop
    #[arg(short = 's', default_value_t = 1)]
    pub max_scenario: usize,

    /// Concurrent scenario runs (0 = same as -s)
    #[arg(short = 'c', default_value_t = 0)]
    pub max_concurrency: usize,

    /// Number of loops
    #[arg(short = 'n', default_value_t = 1)]
    pub loops: usize,

    /// Stop after this long and print what was collected (e.g. 30, 30s, 5m)
    #[arg(short = 'd', value_parser = duration_arg)]
    pub duration: Option<Duration>,

    /// Log every request and response to stderr
    #[arg(long)]
    pub verbose: bool,

    /// Worker count of a node process
    #[arg(short = 'f', hide = true)]
    pub node_procs: Option<usize>,

    /// Scenario document (YAML)
    pub scenario: PathBuf,
}

impl Cli {
    pub fn plan(&self) -> RunPlan {
        RunPlan {
            max_scenario: self.max_scenario,
            concurrency: self.max_concurrency,
            loops: self.loops,
            duration: self.duration.filter(|d| !d.is_zero()),
        }
    }

    /// Workers for a node process: the forwarded `-f`, else the plan's.
    pub fn node_concurrency(&self) -> usize {
        self.node_procs
            .filter(|p| *p > 0)
            .unwrap_or_else(|| self.plan().effective_concurrency())
    }
}
