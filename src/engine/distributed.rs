//! Fan-out of one run across the nodes declared in the scenario.
//!
//! Every node owns an interleaved slice of each exhaustible variable. Local
//! nodes run their slice in this process; remote nodes get this executable,
//! the scenario and their slice copied over and are then started through a
//! [`RemoteChannel`]. Nodes that fail are logged and left out of the totals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::{Node, Scenario};
use crate::engine::remote::RemoteChannel;
use crate::engine::{Engine, ExecRole, RunPlan, ROLE_ENV};
use crate::stats::{Aggregator, NodeReport};
use crate::vars::snapshot::SNAPSHOT_FILE;
use crate::vars::VarSnapshot;

/// Executable name on remote nodes.
pub const REMOTE_BIN: &str = "hakai";
/// Scenario file name on remote nodes.
pub const REMOTE_CONFIG: &str = ".hakai.config.yml";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("{host}: failed to start command: {source}")]
    Spawn {
        host: String,
        source: std::io::Error,
    },

    #[error("{host}: command exited with status {status:?}: {stderr}")]
    CommandFailed {
        host: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to transfer {file}: {source}")]
    Transfer {
        file: String,
        source: Box<NodeError>,
    },

    #[error("failed to stage {what}: {error:#}")]
    Stage { what: String, error: anyhow::Error },

    #[error("{host}: node returned no report")]
    EmptyReport { host: String },

    #[error("{host}: unreadable report: {source}")]
    InvalidReport {
        host: String,
        source: bincode::Error,
    },

    #[error("local partition failed: {0:#}")]
    Local(anyhow::Error),
}

/// One execution target of a distributed run.
pub trait NodeRunner: Send + Sync {
    fn node(&self) -> &Node;

    /// Stage everything the node needs before any node starts.
    fn prepare(&self, snapshot: &VarSnapshot) -> Result<(), NodeError>;

    /// Run the partition with `concurrency` workers and return the node's totals.
    fn run_partition(&self, snapshot: &VarSnapshot, concurrency: usize)
        -> Result<NodeReport, NodeError>;
}

/// Runs a partition inside the coordinator process.
pub struct LocalNodeRunner {
    node: Node,
    engine: Engine,
    scenario: Arc<Scenario>,
    plan: RunPlan,
}

impl LocalNodeRunner {
    pub fn new(node: Node, engine: Engine, scenario: Arc<Scenario>, plan: RunPlan) -> Self {
        Self {
            node,
            engine,
            scenario,
            plan,
        }
    }
}

impl NodeRunner for LocalNodeRunner {
    fn node(&self) -> &Node {
        &self.node
    }

    fn prepare(&self, _snapshot: &VarSnapshot) -> Result<(), NodeError> {
        Ok(())
    }

    fn run_partition(
        &self,
        snapshot: &VarSnapshot,
        concurrency: usize,
    ) -> Result<NodeReport, NodeError> {
        self.engine
            .run_partition(self.scenario.clone(), snapshot.clone(), &self.plan, concurrency)
            .map_err(NodeError::Local)
    }
}

/// Runs a partition on another host through a [`RemoteChannel`].
pub struct RemoteNodeRunner<C: RemoteChannel> {
    node: Node,
    channel: Arc<C>,
    executable: PathBuf,
    scenario_path: PathBuf,
    plan: RunPlan,
}

impl<C: RemoteChannel> RemoteNodeRunner<C> {
    pub fn new(
        node: Node,
        channel: Arc<C>,
        executable: PathBuf,
        scenario_path: PathBuf,
        plan: RunPlan,
    ) -> Self {
        Self {
            node,
            channel,
            executable,
            scenario_path,
            plan,
        }
    }

    pub fn command(&self, concurrency: usize) -> String {
        format!(
            "{}={} ./{} {} {}",
            ROLE_ENV,
            ExecRole::RemoteNode.env_value(),
            REMOTE_BIN,
            self.plan.node_args(concurrency).join(" "),
            REMOTE_CONFIG
        )
    }
}

impl<C: RemoteChannel> NodeRunner for RemoteNodeRunner<C> {
    fn node(&self) -> &Node {
        &self.node
    }

    fn prepare(&self, snapshot: &VarSnapshot) -> Result<(), NodeError> {
        self.channel
            .transfer(&self.node, &self.executable, REMOTE_BIN)?;
        self.channel
            .transfer(&self.node, &self.scenario_path, REMOTE_CONFIG)?;

        let staged = tempfile::Builder::new()
            .prefix(&format!("{}.node.{}.", SNAPSHOT_FILE, self.node.host))
            .tempfile()
            .map_err(|e| NodeError::Stage {
                what: SNAPSHOT_FILE.to_string(),
                error: e.into(),
            })?;
        snapshot
            .write_to(staged.path())
            .map_err(|error| NodeError::Stage {
                what: SNAPSHOT_FILE.to_string(),
                error,
            })?;
        self.channel
            .transfer(&self.node, staged.path(), SNAPSHOT_FILE)
    }

    fn run_partition(
        &self,
        _snapshot: &VarSnapshot,
        concurrency: usize,
    ) -> Result<NodeReport, NodeError> {
        let out = self.channel.execute(&self.node, &self.command(concurrency))?;
        if out.is_empty() {
            return Err(NodeError::EmptyReport {
                host: self.node.host.clone(),
            });
        }
        NodeReport::decode(&out).map_err(|source| NodeError::InvalidReport {
            host: self.node.host.clone(),
            source,
        })
    }
}

/// Totals of a distributed run, merged into the caller's aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub nodes: usize,
    pub reported: usize,
    pub concurrency: usize,
    pub elapsed: Duration,
}

pub struct Coordinator {
    runners: Vec<Box<dyn NodeRunner>>,
}

impl Coordinator {
    pub fn new(runners: Vec<Box<dyn NodeRunner>>) -> Self {
        Self { runners }
    }

    pub fn all_procs(&self) -> usize {
        self.runners.iter().map(|r| r.node().procs).sum()
    }

    /// Each runner's slice of `snapshot`, in declaration order.
    pub fn partitions(&self, snapshot: &VarSnapshot) -> Vec<VarSnapshot> {
        let all_procs = self.all_procs();
        let mut start = 0;
        self.runners
            .iter()
            .map(|runner| {
                let procs = runner.node().procs;
                let part = snapshot.partition(start, procs, all_procs);
                start += procs;
                part
            })
            .collect()
    }

    pub fn run(&self, snapshot: &VarSnapshot, aggregator: &Aggregator) -> FanOut {
        let partitions = self.partitions(snapshot);

        let prepared: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = self
                .runners
                .iter()
                .zip(&partitions)
                .map(|(runner, part)| s.spawn(move || runner.prepare(part)))
                .collect();
            handles
                .into_iter()
                .zip(&self.runners)
                .map(|(h, runner)| match h.join() {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::error!(node = %runner.node().address(), error = %e, "node setup failed");
                        false
                    }
                    Err(_) => {
                        tracing::error!(node = %runner.node().address(), "node setup panicked");
                        false
                    }
                })
                .collect()
        });
        tracing::info!(
            ready = prepared.iter().filter(|ok| **ok).count(),
            nodes = self.runners.len(),
            "node setup finished"
        );

        let reports: Vec<NodeReport> = std::thread::scope(|s| {
            let handles: Vec<_> = self
                .runners
                .iter()
                .zip(&partitions)
                .zip(&prepared)
                .filter(|(_, ok)| **ok)
                .map(|((runner, part), _)| {
                    let procs = runner.node().procs;
                    let handle = s.spawn(move || runner.run_partition(part, procs));
                    (runner, handle)
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|(runner, h)| match h.join() {
                    Ok(Ok(report)) => Some(report),
                    Ok(Err(e)) => {
                        tracing::error!(node = %runner.node().address(), error = %e, "node attack failed");
                        None
                    }
                    Err(_) => {
                        tracing::error!(node = %runner.node().address(), "node attack panicked");
                        None
                    }
                })
                .collect()
        });

        let mut fan_out = FanOut {
            nodes: self.runners.len(),
            reported: 0,
            concurrency: 0,
            elapsed: Duration::ZERO,
        };
        for report in reports {
            if let Err(e) = aggregator.merge(&report) {
                tracing::error!(error = %e, "dropping node report");
                continue;
            }
            fan_out.reported += 1;
            fan_out.concurrency += report.concurrency;
            // nodes run side by side, so wall time is the slowest node
            fan_out.elapsed = fan_out.elapsed.max(report.elapsed);
        }
        fan_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::ExhaustibleVar;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;

    fn node(host: &str, procs: usize) -> Node {
        Node {
            procs,
            host: host.to_string(),
            port: 22,
            user: "bench".to_string(),
            ssh_key: PathBuf::from("/keys/id"),
        }
    }

    fn plan() -> RunPlan {
        RunPlan {
            max_scenario: 2,
            concurrency: 0,
            loops: 3,
            duration: None,
        }
    }

    fn snapshot(n: usize) -> VarSnapshot {
        VarSnapshot {
            rotating: HashMap::new(),
            exhaustible: HashMap::from([(
                "ev".to_string(),
                ExhaustibleVar::new((0..n).map(|i| i.to_string()).collect()),
            )]),
        }
    }

    struct Canned {
        node: Node,
        report: Option<NodeReport>,
        seen: Mutex<Vec<String>>,
    }

    impl NodeRunner for Canned {
        fn node(&self) -> &Node {
            &self.node
        }

        fn prepare(&self, snapshot: &VarSnapshot) -> Result<(), NodeError> {
            *self.seen.lock() = snapshot.exhaustible["ev"].values.clone();
            Ok(())
        }

        fn run_partition(&self, _: &VarSnapshot, _: usize) -> Result<NodeReport, NodeError> {
            self.report.clone().ok_or(NodeError::EmptyReport {
                host: self.node.host.clone(),
            })
        }
    }

    fn report(success: u64, concurrency: usize, secs: u64) -> NodeReport {
        NodeReport {
            success,
            fail: 1,
            concurrency,
            elapsed: Duration::from_secs(secs),
            paths: BTreeMap::from([(
                "/p".to_string(),
                crate::stats::PathStats {
                    count: success + 1,
                    total: Duration::from_millis(10 * (success + 1)),
                },
            )]),
            latency: Vec::new(),
        }
    }

    #[test]
    fn test_two_nodes_get_interleaved_partitions() {
        let a = Arc::new(Canned {
            node: node("a", 1),
            report: Some(report(1, 1, 1)),
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Canned {
            node: node("b", 1),
            report: Some(report(1, 1, 1)),
            seen: Mutex::new(Vec::new()),
        });

        struct Shared(Arc<Canned>);
        impl NodeRunner for Shared {
            fn node(&self) -> &Node {
                self.0.node()
            }
            fn prepare(&self, s: &VarSnapshot) -> Result<(), NodeError> {
                self.0.prepare(s)
            }
            fn run_partition(&self, s: &VarSnapshot, c: usize) -> Result<NodeReport, NodeError> {
                self.0.run_partition(s, c)
            }
        }

        let coordinator = Coordinator::new(vec![
            Box::new(Shared(a.clone())),
            Box::new(Shared(b.clone())),
        ]);
        assert_eq!(coordinator.all_procs(), 2);
        coordinator.run(&snapshot(4), &Aggregator::new());

        assert_eq!(*a.seen.lock(), ["0", "2"]);
        assert_eq!(*b.seen.lock(), ["1", "3"]);
    }

    #[test]
    fn test_failing_node_is_excluded() {
        let coordinator = Coordinator::new(vec![
            Box::new(Canned {
                node: node("ok-1", 2),
                report: Some(report(5, 2, 3)),
                seen: Mutex::new(Vec::new()),
            }),
            Box::new(Canned {
                node: node("broken", 1),
                report: None,
                seen: Mutex::new(Vec::new()),
            }),
            Box::new(Canned {
                node: node("ok-2", 3),
                report: Some(report(7, 3, 4)),
                seen: Mutex::new(Vec::new()),
            }),
        ]);

        let agg = Aggregator::new();
        let fan_out = coordinator.run(&snapshot(12), &agg);

        assert_eq!(fan_out.nodes, 3);
        assert_eq!(fan_out.reported, 2);
        assert_eq!(fan_out.concurrency, 5);
        assert_eq!(fan_out.elapsed, Duration::from_secs(4));
        assert_eq!(agg.success(), 12);
        assert_eq!(agg.fail(), 2);
        assert_eq!(agg.paths()["/p"].count, 14);
    }

    struct FakeChannel {
        transfers: Mutex<Vec<(PathBuf, String)>>,
        staged_snapshot: Mutex<Option<VarSnapshot>>,
        commands: Mutex<Vec<String>>,
        output: Vec<u8>,
    }

    impl RemoteChannel for FakeChannel {
        fn transfer(&self, _node: &Node, local: &Path, remote: &str) -> Result<(), NodeError> {
            if remote == SNAPSHOT_FILE {
                *self.staged_snapshot.lock() = Some(VarSnapshot::read_from(local).unwrap());
            }
            self.transfers
                .lock()
                .push((local.to_path_buf(), remote.to_string()));
            Ok(())
        }

        fn execute(&self, _node: &Node, command: &str) -> Result<Vec<u8>, NodeError> {
            self.commands.lock().push(command.to_string());
            Ok(self.output.clone())
        }
    }

    fn fake(output: Vec<u8>) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            transfers: Mutex::new(Vec::new()),
            staged_snapshot: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            output,
        })
    }

    #[test]
    fn test_remote_runner_stages_and_runs() {
        let wire = report(3, 2, 1).encode().unwrap();
        let channel = fake(wire);
        let runner = RemoteNodeRunner::new(
            node("10.0.0.9", 2),
            channel.clone(),
            PathBuf::from("/usr/local/bin/hakai"),
            PathBuf::from("/work/scenario.yml"),
            plan(),
        );

        let part = snapshot(4).partition(0, 2, 2);
        runner.prepare(&part).unwrap();
        let transfers = channel.transfers.lock().clone();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[0], (PathBuf::from("/usr/local/bin/hakai"), REMOTE_BIN.to_string()));
        assert_eq!(transfers[1], (PathBuf::from("/work/scenario.yml"), REMOTE_CONFIG.to_string()));
        assert_eq!(transfers[2].1, SNAPSHOT_FILE);
        assert_eq!(channel.staged_snapshot.lock().clone().unwrap(), part);

        let got = runner.run_partition(&part, 2).unwrap();
        assert_eq!(got.success, 3);
        assert_eq!(
            channel.commands.lock()[0],
            "HAKAI_ROLE=node ./hakai -s 2 -c 0 -n 3 -f 2 .hakai.config.yml"
        );
    }

    #[test]
    fn test_remote_runner_rejects_empty_and_garbage_output() {
        let runner = RemoteNodeRunner::new(
            node("h", 1),
            fake(Vec::new()),
            PathBuf::from("hakai"),
            PathBuf::from("s.yml"),
            plan(),
        );
        assert!(matches!(
            runner.run_partition(&VarSnapshot::default(), 1),
            Err(NodeError::EmptyReport { .. })
        ));

        let runner = RemoteNodeRunner::new(
            node("h", 1),
            fake(b"bash: ./hakai: not found".to_vec()),
            PathBuf::from("hakai"),
            PathBuf::from("s.yml"),
            plan(),
        );
        assert!(matches!(
            runner.run_partition(&VarSnapshot::default(), 1),
            Err(NodeError::InvalidReport { .. })
        ));
    }
}
