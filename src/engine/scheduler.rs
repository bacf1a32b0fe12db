//! Fixed worker pool fed through a bounded admission channel.

use anyhow::{Context, Result};
use crossbeam_channel::{select, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::attacker::Outcome;
use crate::engine::indicator::Indicator;
use crate::stats::Aggregator;
use crate::vars::{Cursors, Offsets};

/// One scenario iteration handed to a worker.
#[derive(Debug, Clone)]
pub struct Unit {
    pub iteration: usize,
    pub offsets: Offsets,
}

/// Executes the actions of one unit, sending one outcome per action.
pub trait UnitHandler: Send + Sync + 'static {
    fn run_unit(&self, unit: &Unit, outcomes: &Sender<Outcome>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every admitted unit ran to the end.
    Finished,
    /// The duration cap fired first; queued units were abandoned.
    DeadlineReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub iterations: usize,
    pub deadline: Option<Duration>,
    /// Print progress marks while running.
    pub marks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completion: Completion,
    pub elapsed: Duration,
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn run<H: UnitHandler>(
        &self,
        handler: Arc<H>,
        mut cursors: Cursors,
        aggregator: Arc<Aggregator>,
    ) -> Result<RunSummary> {
        let workers = self.config.concurrency.max(1);
        let start = Instant::now();
        let deadline = match self.config.deadline {
            Some(d) => crossbeam_channel::after(d),
            None => crossbeam_channel::never(),
        };

        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Outcome>();
        let indicator = Indicator::spawn(outcome_rx, aggregator, self.config.marks)
            .context("failed to start indicator")?;

        let (unit_tx, unit_rx) = crossbeam_channel::bounded::<Unit>(workers);
        // never sent on; disconnects once every worker has exited
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let cancelled = Arc::new(AtomicBool::new(false));

        for id in 0..workers {
            let units = unit_rx.clone();
            let handler = handler.clone();
            let outcomes = outcome_tx.clone();
            let done = done_tx.clone();
            let cancelled = cancelled.clone();
            std::thread::Builder::new()
                .name(format!("hakai-worker-{}", id))
                .spawn(move || {
                    let _done = done;
                    while let Ok(unit) = units.recv() {
                        if cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        handler.run_unit(&unit, &outcomes);
                    }
                })
                .with_context(|| format!("failed to spawn worker {}", id))?;
        }
        drop(unit_rx);
        drop(done_tx);
        drop(outcome_tx);

        tracing::info!(workers, iterations = self.config.iterations, "running");

        let mut completion = Completion::Finished;
        for iteration in 0..self.config.iterations {
            let unit = Unit {
                iteration,
                offsets: cursors.advance(),
            };
            select! {
                send(unit_tx, unit) -> res => {
                    if res.is_err() {
                        break;
                    }
                }
                recv(deadline) -> _ => {
                    cancelled.store(true, Ordering::Relaxed);
                    completion = Completion::DeadlineReached;
                    break;
                }
            }
        }
        drop(unit_tx);

        if completion == Completion::Finished {
            tracing::debug!("draining");
            select! {
                recv(done_rx) -> _ => {}
                recv(deadline) -> _ => completion = Completion::DeadlineReached,
            }
        }
        if completion == Completion::DeadlineReached {
            cancelled.store(true, Ordering::Relaxed);
            tracing::info!("duration cap reached");
        }

        indicator.finish();
        Ok(RunSummary {
            completion,
            elapsed: start.elapsed(),
        })
    }
}
