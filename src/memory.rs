//! Resident memory sampling for the driver reports.
//!
//! A [`MemoryTracker`] owns a background task that refreshes this process's
//! resident set size on a fixed interval and keeps the highest reading.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Default pause between two samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

struct Sampler {
    // sysinfo keeps per-process state between refreshes, so one `System` is reused.
    system: System,
    pid: Option<Pid>,
}

impl Sampler {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Resident bytes of this process, 0 when the platform cannot tell.
    fn resident(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map_or(0, |process| process.memory())
    }
}

/// Resident memory over one run, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryReport {
    pub start: u64,
    pub end: u64,
    pub peak: u64,
}

impl MemoryReport {
    pub fn log(&self, label: &str) {
        info!(
            start = %format_mib(self.start),
            end = %format_mib(self.end),
            peak = %format_mib(self.peak),
            "{label} memory"
        );
    }
}

fn format_mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

/// Samples resident memory until [`MemoryTracker::finish`] is called.
pub struct MemoryTracker {
    start: u64,
    peak: Arc<AtomicU64>,
    stop_tx: watch::Sender<()>,
    task: JoinHandle<Sampler>,
}

impl MemoryTracker {
    /// Takes the first sample and starts the refresh task. Needs a tokio runtime.
    pub fn start(interval: Duration) -> Self {
        let mut sampler = Sampler::new();
        let start = sampler.resident();
        let peak = Arc::new(AtomicU64::new(start));
        let (stop_tx, mut stop_rx) = watch::channel(());

        let task_peak = Arc::clone(&peak);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        task_peak.fetch_max(sampler.resident(), Ordering::Relaxed);
                    }
                }
            }
            sampler
        });

        Self {
            start,
            peak,
            stop_tx,
            task,
        }
    }

    /// Stops sampling and takes a last reading.
    pub async fn finish(self) -> MemoryReport {
        self.stop_tx.send_replace(());
        let end = match self.task.await {
            Ok(mut sampler) => sampler.resident(),
            Err(_) => Sampler::new().resident(),
        };
        MemoryReport {
            start: self.start,
            end,
            peak: self.peak.load(Ordering::Relaxed).max(end),
        }
    }
}
