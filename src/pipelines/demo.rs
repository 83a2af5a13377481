// SPDX-License-Identifier: GPL-3.0-only

//! Demo mode stepping
//!
//! Calls a step function every interval, either for a fixed number of steps
//! or until stopped.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::{debug, info};

pub struct DemoRunner {
    interval: Duration,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl DemoRunner {
    pub fn new(interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        Self {
            interval,
            stop_tx,
            stop_rx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of steps that fit in `duration`, `None` for unbounded
    pub fn steps_for(&self, duration: Option<Duration>) -> Option<u64> {
        let duration = duration?;
        let interval = self.interval.as_millis().max(1);
        Some((duration.as_millis() / interval) as u64)
    }

    /// Run `step` every interval, returning the number of steps taken
    pub fn run<F>(&self, duration: Option<Duration>, mut step: F) -> u64
    where
        F: FnMut(usize),
    {
        // A stop requested before the run started does not count
        while self.stop_rx.try_recv().is_ok() {}

        let limit = self.steps_for(duration);
        info!(interval = ?self.interval, ?limit, "Demo mode started");

        let mut taken = 0u64;
        while limit.is_none_or(|limit| taken < limit) {
            step(taken as usize);
            taken += 1;
            match self.stop_rx.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Demo mode stopped");
                    break;
                }
            }
        }

        info!(steps = taken, "Demo mode finished");
        taken
    }

    /// Ask a running demo to finish after its current step
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_step_count_follows_duration() {
        let runner = DemoRunner::new(Duration::from_millis(5));
        assert_eq!(runner.steps_for(Some(Duration::from_millis(50))), Some(10));
        assert_eq!(runner.steps_for(None), None);

        let mut seen = Vec::new();
        let taken = runner.run(Some(Duration::from_millis(20)), |step| seen.push(step));
        assert_eq!(taken, 4);
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_stop_ends_unbounded_run() {
        let runner = Arc::new(DemoRunner::new(Duration::from_millis(10)));
        let stopper = Arc::clone(&runner);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        let taken = runner.run(None, |_| {});
        assert!(taken >= 1);
        handle.join().unwrap();
    }
}
