use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::cli::config::Scenario;
use crate::engine::attacker::Attacker;
use crate::engine::distributed::{
    Coordinator, FanOut, LocalNodeRunner, NodeRunner, RemoteNodeRunner, REMOTE_BIN, REMOTE_CONFIG,
};
use crate::engine::http_client::{install_crypto_provider, HttpClient};
use crate::engine::remote::SshChannel;
use crate::engine::scheduler::{RunSummary, Scheduler, SchedulerConfig};
use crate::stats::{Aggregator, NodeReport};
use crate::utils::format_duration_arg;
use crate::vars::snapshot::SNAPSHOT_FILE;
use crate::vars::{VarSnapshot, VariableStore};

pub mod attacker;
pub mod distributed;
pub mod http_client;
pub mod indicator;
pub mod remote;
pub mod scheduler;

/// Environment variable selecting the execution role of a process.
pub const ROLE_ENV: &str = "HAKAI_ROLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecRole {
    /// Terminal process: fans out to nodes or runs locally, prints the summary.
    Coordinator,
    /// Node started on the coordinator's machine.
    LocalNode,
    /// Node started over the remote channel.
    RemoteNode,
}

impl ExecRole {
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(ROLE_ENV).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some("node") => ExecRole::RemoteNode,
            Some("node-local") => ExecRole::LocalNode,
            _ => ExecRole::Coordinator,
        }
    }

    pub fn env_value(&self) -> &'static str {
        match self {
            ExecRole::Coordinator => "default",
            ExecRole::LocalNode => "node-local",
            ExecRole::RemoteNode => "node",
        }
    }

    pub fn is_node(&self) -> bool {
        !matches!(self, ExecRole::Coordinator)
    }

    /// Remove the files a coordinator staged for this node in `dir`.
    pub fn clean_node_files(&self, dir: &Path) {
        if !self.is_node() {
            return;
        }
        let mut files = vec![SNAPSHOT_FILE, REMOTE_CONFIG];
        if *self == ExecRole::RemoteNode {
            files.push(REMOTE_BIN);
        }
        for file in files {
            let path = dir.join(file);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "cleanup failed");
                }
            }
        }
    }
}

/// Command-line shape of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub max_scenario: usize,
    /// Worker count, 0 meaning `max_scenario`.
    pub concurrency: usize,
    pub loops: usize,
    pub duration: Option<Duration>,
}

impl RunPlan {
    pub fn iterations(&self) -> usize {
        self.loops.saturating_mul(self.max_scenario)
    }

    pub fn effective_concurrency(&self) -> usize {
        let c = if self.concurrency == 0 {
            self.max_scenario
        } else {
            self.concurrency
        };
        c.max(1)
    }

    /// Flags for a node process running `procs` workers.
    pub fn node_args(&self, procs: usize) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            self.max_scenario.to_string(),
            "-c".to_string(),
            self.concurrency.to_string(),
            "-n".to_string(),
            self.loops.to_string(),
        ];
        if let Some(d) = self.duration {
            args.push("-d".to_string());
            args.push(format_duration_arg(d));
        }
        args.push("-f".to_string());
        args.push(procs.to_string());
        args
    }
}

pub struct LocalRun {
    pub aggregator: Arc<Aggregator>,
    pub summary: RunSummary,
    pub concurrency: usize,
}

/// Owns the async runtime shared by every HTTP worker of this process.
#[derive(Clone)]
pub struct Engine {
    runtime: Arc<Runtime>,
}

impl Engine {
    pub fn new() -> Result<Self> {
        install_crypto_provider();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("hakai-io")
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn attacker(
        &self,
        scenario: Arc<Scenario>,
        vars: Arc<VariableStore>,
        concurrency: usize,
    ) -> Result<Attacker> {
        let client = {
            let _guard = self.runtime.enter();
            HttpClient::new(scenario.http_version, concurrency)?
        };
        Ok(Attacker::new(scenario, vars, client, self.runtime.clone())?)
    }

    /// Run the scenario in this process with `concurrency` workers.
    pub fn run_local(
        &self,
        scenario: Arc<Scenario>,
        vars: VariableStore,
        plan: &RunPlan,
        concurrency: usize,
        marks: bool,
    ) -> Result<LocalRun> {
        let cursors = vars.cursors();
        let attacker = Arc::new(self.attacker(scenario, Arc::new(vars), concurrency)?);
        let aggregator = Arc::new(Aggregator::new());

        let config = SchedulerConfig {
            concurrency,
            iterations: plan.iterations(),
            deadline: plan.duration,
            marks,
        };
        let summary = Scheduler::new(config).run(attacker, cursors, aggregator.clone())?;

        Ok(LocalRun {
            aggregator,
            summary,
            concurrency,
        })
    }

    /// Run one node's partition and return its totals.
    pub fn run_partition(
        &self,
        scenario: Arc<Scenario>,
        snapshot: VarSnapshot,
        plan: &RunPlan,
        concurrency: usize,
    ) -> Result<NodeReport> {
        let vars = VariableStore::from_snapshot(&scenario, snapshot);
        let run = self.run_local(scenario, vars, plan, concurrency, false)?;
        Ok(run
            .aggregator
            .node_report(concurrency, run.summary.elapsed))
    }

    /// Fan the run out over the scenario's nodes and merge what comes back.
    pub fn run_distributed(
        &self,
        scenario: Arc<Scenario>,
        scenario_path: &Path,
        vars: &VariableStore,
        plan: &RunPlan,
    ) -> Result<(Aggregator, FanOut)> {
        let nodes = scenario.resolve_nodes()?;
        let executable = std::env::current_exe().context("cannot locate own executable")?;
        let channel = Arc::new(SshChannel::new());

        let runners: Vec<Box<dyn NodeRunner>> = nodes
            .into_iter()
            .map(|node| -> Box<dyn NodeRunner> {
                if node.is_local() {
                    Box::new(LocalNodeRunner::new(node, self.clone(), scenario.clone(), *plan))
                } else {
                    Box::new(RemoteNodeRunner::new(
                        node,
                        channel.clone(),
                        executable.clone(),
                        scenario_path.to_path_buf(),
                        *plan,
                    ))
                }
            })
            .collect();

        let aggregator = Aggregator::new();
        let fan_out = Coordinator::new(runners).run(&vars.snapshot(), &aggregator);
        if fan_out.reported < fan_out.nodes {
            tracing::warn!(
                reported = fan_out.reported,
                nodes = fan_out.nodes,
                "some nodes are missing from the totals"
            );
        }
        Ok((aggregator, fan_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_env_value() {
        assert_eq!(ExecRole::from_value(None), ExecRole::Coordinator);
        assert_eq!(ExecRole::from_value(Some("node")), ExecRole::RemoteNode);
        assert_eq!(ExecRole::from_value(Some("node-local")), ExecRole::LocalNode);
        assert_eq!(ExecRole::from_value(Some("other")), ExecRole::Coordinator);
        for role in [ExecRole::LocalNode, ExecRole::RemoteNode] {
            assert_eq!(ExecRole::from_value(Some(role.env_value())), role);
        }
    }

    #[test]
    fn test_plan_concurrency_defaults_to_max_scenario() {
        let plan = RunPlan {
            max_scenario: 8,
            concurrency: 0,
            loops: 3,
            duration: None,
        };
        assert_eq!(plan.effective_concurrency(), 8);
        assert_eq!(plan.iterations(), 24);
        assert_eq!(
            RunPlan {
                concurrency: 2,
                ..plan
            }
            .effective_concurrency(),
            2
        );
    }

    #[test]
    fn test_node_args() {
        let plan = RunPlan {
            max_scenario: 4,
            concurrency: 2,
            loops: 10,
            duration: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            plan.node_args(3),
            ["-s", "4", "-c", "2", "-n", "10", "-d", "30s", "-f", "3"]
        );
    }

    #[test]
    fn test_clean_node_files() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| std::fs::write(dir.path().join(name), b"x").unwrap();

        for name in [SNAPSHOT_FILE, REMOTE_CONFIG, REMOTE_BIN] {
            touch(name);
        }
        ExecRole::Coordinator.clean_node_files(dir.path());
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        ExecRole::LocalNode.clean_node_files(dir.path());
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());
        assert!(!dir.path().join(REMOTE_CONFIG).exists());
        assert!(dir.path().join(REMOTE_BIN).exists());

        ExecRole::RemoteNode.clean_node_files(dir.path());
        assert!(!dir.path().join(REMOTE_BIN).exists());
    }
}
