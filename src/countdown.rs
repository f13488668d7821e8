//! Stimulus viewing countdown.
//!
//! Before the exam conversation the candidate watches a video stimulus for a
//! fixed period. The countdown publishes the remaining seconds and calls its
//! entry point exactly once, either when the period elapses or when the
//! candidate skips ahead. Cancelling drops it without calling the entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

const TICK: Duration = Duration::from_secs(1);

/// `m:ss`
pub fn format_remaining(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub struct StimulusCountdown {
    remaining: watch::Receiver<u64>,
    skip: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StimulusCountdown {
    /// Start counting down from `duration` (rounded up to whole seconds).
    /// Dropping the countdown does not stop it; use `cancel`.
    pub fn start<F>(duration: Duration, entry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let total = duration.as_millis().div_ceil(1000) as u64;
        let (remaining_tx, remaining) = watch::channel(total);
        let skip = Arc::new(Notify::new());
        let skip_signal = skip.clone();

        log::info!("Stimulus countdown started: {}", format_remaining(total));

        let task = tokio::spawn(async move {
            let mut left = total;
            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            while left > 0 {
                tokio::select! {
                    _ = ticker.tick() => {
                        left -= 1;
                        remaining_tx.send_replace(left);
                    }
                    _ = skip_signal.notified() => {
                        log::info!("Stimulus countdown skipped with {} left", format_remaining(left));
                        remaining_tx.send_replace(0);
                        break;
                    }
                }
            }
            log::info!("Stimulus period over, entering the exam");
            entry();
        });

        Self {
            remaining,
            skip,
            task,
        }
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.remaining.clone()
    }

    /// Fire the entry now. No effect once it has fired.
    pub fn skip(&self) {
        self.skip.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop without firing the entry.
    pub fn cancel(self) {
        if !self.task.is_finished() {
            log::info!(
                "Stimulus countdown cancelled with {} left",
                format_remaining(self.remaining())
            );
        }
        self.task.abort();
    }

    /// Wait until the entry has fired. Returns false if the countdown was
    /// aborted instead.
    pub async fn wait(self) -> bool {
        match self.task.await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Stimulus countdown ended without firing: {}", e);
                false
            }
        }
    }
}
