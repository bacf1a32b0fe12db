use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::engine::attacker::Outcome;

/// Latency bounds in microseconds: 1us to one hour.
const HISTOGRAM_MAX_US: u64 = 60 * 60 * 1000 * 1000;

fn latency_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_US, 2).expect("constant histogram bounds")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub count: u64,
    pub total: Duration,
}

impl PathStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total.div_f64(self.count as f64)
    }
}

/// What a node sends back to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub success: u64,
    pub fail: u64,
    pub concurrency: usize,
    pub elapsed: Duration,
    pub paths: BTreeMap<String, PathStats>,
    /// V2-serialized latency histogram.
    pub latency: Vec<u8>,
}

impl NodeReport {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("corrupt latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::serialization::DeserializeError),

    #[error("incompatible latency histogram: {0}")]
    Bounds(#[from] hdrhistogram::AdditionError),
}

/// Run-wide counters, fed by the indicator thread or by merged node reports.
pub struct Aggregator {
    success: AtomicU64,
    fail: AtomicU64,
    paths: Mutex<BTreeMap<String, PathStats>>,
    histogram: Mutex<Histogram<u64>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            fail: AtomicU64::new(0),
            paths: Mutex::new(BTreeMap::new()),
            histogram: Mutex::new(latency_histogram()),
        }
    }

    /// Count an outcome. Latency is only recorded when a response arrived.
    pub fn record(&self, outcome: &Outcome) {
        if outcome.success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fail.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(elapsed) = outcome.elapsed {
            {
                let mut paths = self.paths.lock();
                let entry = paths.entry(outcome.path.clone()).or_default();
                entry.count += 1;
                entry.total += elapsed;
            }
            let us = (elapsed.as_micros() as u64).max(1);
            self.histogram.lock().saturating_record(us);
        }
    }

    pub fn merge(&self, report: &NodeReport) -> Result<(), MergeError> {
        if !report.latency.is_empty() {
            let hist: Histogram<u64> = Deserializer::new().deserialize(&mut &report.latency[..])?;
            self.histogram.lock().add(&hist)?;
        }

        self.success.fetch_add(report.success, Ordering::Relaxed);
        self.fail.fetch_add(report.fail, Ordering::Relaxed);
        let mut paths = self.paths.lock();
        for (path, stats) in &report.paths {
            let entry = paths.entry(path.clone()).or_default();
            entry.count += stats.count;
            entry.total += stats.total;
        }
        Ok(())
    }

    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn fail(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub fn paths(&self) -> BTreeMap<String, PathStats> {
        self.paths.lock().clone()
    }

    pub fn node_report(&self, concurrency: usize, elapsed: Duration) -> NodeReport {
        let mut latency = Vec::new();
        let hist = self.histogram.lock();
        if let Err(e) = V2Serializer::new().serialize(&*hist, &mut latency) {
            tracing::warn!(error = %e, "latency histogram not included in node report");
            latency.clear();
        }
        drop(hist);
        NodeReport {
            success: self.success(),
            fail: self.fail(),
            concurrency,
            elapsed,
            paths: self.paths(),
            latency,
        }
    }

    pub fn summary(&self, concurrency: usize, elapsed: Duration, show_paths: bool) -> Summary {
        let hist = self.histogram.lock();
        let quantile = |q: f64| {
            if hist.is_empty() {
                Duration::ZERO
            } else {
                Duration::from_micros(hist.value_at_quantile(q))
            }
        };
        Summary {
            success: self.success(),
            fail: self.fail(),
            concurrency,
            elapsed,
            paths: self.paths(),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            show_paths,
        }
    }
}

/// Human-readable end-of-run report.
#[derive(Debug, Clone)]
pub struct Summary {
    pub success: u64,
    pub fail: u64,
    pub concurrency: usize,
    pub elapsed: Duration,
    pub paths: BTreeMap<String, PathStats>,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub show_paths: bool,
}

impl Summary {
    pub fn requests(&self) -> u64 {
        self.success + self.fail
    }

    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests() as f64 / secs
        } else {
            0.0
        }
    }

    /// Mean over every response that arrived, in milliseconds.
    pub fn average_ms(&self) -> f64 {
        let (count, total) = self
            .paths
            .values()
            .fold((0u64, Duration::ZERO), |(c, t), s| (c + s.count, t + s.total));
        if count == 0 {
            return 0.0;
        }
        total.as_secs_f64() * 1000.0 / count as f64
    }

    /// Per-path averages, slowest first.
    pub fn by_path(&self) -> Vec<(String, f64)> {
        let mut rows: Vec<(String, f64)> = self
            .paths
            .iter()
            .map(|(path, stats)| (path.clone(), stats.average().as_secs_f64() * 1000.0))
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1));
        rows
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(
            f,
            "request count:{}, concurrency:{}, time:{:.5}[s], {:.6}[req/s]",
            self.requests(),
            self.concurrency,
            self.elapsed.as_secs_f64(),
            self.requests_per_sec()
        )?;
        writeln!(f, "SUCCESS {}", self.success)?;
        writeln!(f, "FAILED {}", self.fail)?;
        writeln!(f, "Average response time[ms]: {}", self.average_ms())?;
        writeln!(
            f,
            "Latency[ms]: p50={:.3} p90={:.3} p99={:.3}",
            self.p50.as_secs_f64() * 1000.0,
            self.p90.as_secs_f64() * 1000.0,
            self.p99.as_secs_f64() * 1000.0
        )?;

        if self.show_paths {
            writeln!(f, "Average response time for each path (order by longest) [ms]:")?;
            for (path, avg) in self.by_path() {
                writeln!(f, "{:.3} : {}", avg, path)?;
            }
        }
        Ok(())
    }
}
