use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envreport_logging::{report_error, report_info, report_warn, set_poll_cycle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{Pipeline, RunError, RunSummary};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Wall-clock bound on a whole run.
    pub run_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            run_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Clears the in-progress flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Calls [`Pipeline::run_once`] on a fixed interval and never lets two runs overlap.
pub struct Poller {
    pipeline: Arc<Pipeline>,
    settings: PollSettings,
    running: AtomicBool,
    cycle: AtomicU64,
}

impl Poller {
    pub fn new(pipeline: Arc<Pipeline>, settings: PollSettings) -> Self {
        Self {
            pipeline,
            settings,
            running: AtomicBool::new(false),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    /// Run once unless a run is already in progress, in which case `None`.
    pub async fn try_run_once(&self) -> Option<Result<RunSummary, RunError>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            report_warn!("previous run still in progress, skipping this tick");
            return None;
        }
        let _guard = RunGuard(&self.running);

        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        set_poll_cycle(cycle);
        let result =
            match tokio::time::timeout(self.settings.run_timeout, self.pipeline.run_once()).await {
                Ok(result) => result,
                Err(_) => Err(RunError::TimedOut(self.settings.run_timeout)),
            };
        if let Err(err) = &result {
            report_error!("run aborted, retrying next poll: {}", err);
        }
        Some(result)
    }

    /// Poll until `shutdown` is cancelled. The first run starts immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        report_info!(
            "polling every {:?} (run timeout {:?})",
            self.settings.interval,
            self.settings.run_timeout
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    report_info!("shutdown requested, poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            report_warn!("shutdown requested mid-run, abandoning current run");
                            break;
                        }
                        _ = self.try_run_once() => {}
                    }
                }
            }
        }
    }
}
