use crossbeam_channel::{Receiver, Sender};
use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::engine::attacker::Outcome;
use crate::stats::Aggregator;

/// Successes between two progress dots.
pub const MARK_EVERY: usize = 100;

/// Background consumer of outcomes. Keeps counting until told to finish;
/// a closed outcome stream alone does not stop it.
pub struct Indicator {
    finish: Sender<()>,
    handle: JoinHandle<()>,
}

impl Indicator {
    pub fn spawn(
        outcomes: Receiver<Outcome>,
        aggregator: Arc<Aggregator>,
        marks: bool,
    ) -> std::io::Result<Self> {
        let (finish, finish_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("hakai-indicator".to_string())
            .spawn(move || {
                let mut ticker = Ticker::new(marks);
                loop {
                    crossbeam_channel::select! {
                        recv(outcomes) -> msg => match msg {
                            Ok(outcome) => ticker.tally(&aggregator, &outcome),
                            Err(_) => {
                                let _ = finish_rx.recv();
                                break;
                            }
                        },
                        recv(finish_rx) -> _ => {
                            for outcome in outcomes.try_iter() {
                                ticker.tally(&aggregator, &outcome);
                            }
                            break;
                        }
                    }
                }
            })?;
        Ok(Self { finish, handle })
    }

    /// Signal completion and wait for the thread to drain what is queued.
    pub fn finish(self) {
        let _ = self.finish.send(());
        let _ = self.handle.join();
    }
}

struct Ticker {
    marks: bool,
    skip: usize,
}

impl Ticker {
    fn new(marks: bool) -> Self {
        Self { marks, skip: 0 }
    }

    fn tally(&mut self, aggregator: &Aggregator, outcome: &Outcome) {
        aggregator.record(outcome);
        if !self.marks {
            return;
        }

        self.skip += 1;
        let mark = if outcome.success {
            if self.skip < MARK_EVERY {
                return;
            }
            self.skip = 0;
            '.'
        } else {
            'x'
        };
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "{}", mark);
        let _ = out.flush();
    }
}
