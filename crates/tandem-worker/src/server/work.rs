//! Bounded, cooperatively cancellable unit of work.
//!
//! [`BoundedWork`] models a task of fixed total duration that checks the
//! request's [`CancellationSignal`] while it runs. The only suspension point
//! is a wait on whichever comes first: the next poll tick or the signal
//! firing. The loop is never preempted; cancellation takes effect at that
//! wait, so detection latency never exceeds one poll interval.

use core::time::Duration;
use tandem_core::signal::{CancelCause, CancellationSignal};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Summary of a unit of work that ran to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkReport {
    pub ticks: u32,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedWork {
    duration: Duration,
    poll_interval: Duration,
}

impl BoundedWork {
    /// A poll interval of zero is raised to one millisecond.
    pub fn new(duration: Duration, poll_interval: Duration) -> Self {
        Self {
            duration,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Runs the work until it completes or `signal` fires.
    ///
    /// Returns the cause as the error when the signal fires first, including
    /// when it had already fired before the call.
    pub async fn run(&self, signal: &CancellationSignal) -> Result<WorkReport, CancelCause> {
        let start = Instant::now();
        let mut ticker = interval_at(start + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0_u32;

        loop {
            tokio::select! {
                biased;
                cause = signal.fired() => return Err(cause),
                _ = ticker.tick() => {
                    ticks += 1;
                    let elapsed = start.elapsed();
                    if elapsed >= self.duration {
                        return Ok(WorkReport { ticks, elapsed });
                    }
                }
            }
        }
    }
}
