//! Read/write rate sampling for the engine process.

use std::time::Instant;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::progress::{IoRates, MIN_SAMPLE_DWELL};

/// Samples cumulative disk counters of one process and turns consecutive
/// samples into rates.
pub struct IoSampler {
    system: System,
    pid: Option<Pid>,
    last: Option<(Instant, u64, u64)>,
    rates: Option<IoRates>,
}

impl Default for IoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: None,
            last: None,
            rates: None,
        }
    }

    pub fn attach(&mut self, pid: u32) {
        self.pid = Some(Pid::from_u32(pid));
        self.last = None;
        self.rates = None;
    }

    /// Latest rates; refreshed at most once per sampling dwell.
    pub fn sample(&mut self, now: Instant) -> Option<IoRates> {
        let pid = self.pid?;
        if let Some((at, _, _)) = self.last {
            if now.saturating_duration_since(at) < MIN_SAMPLE_DWELL {
                return self.rates;
            }
        }

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_disk_usage(),
        );
        let Some(process) = self.system.process(pid) else {
            tracing::debug!(%pid, "engine process gone, stopping I/O sampling");
            self.pid = None;
            return None;
        };
        let usage = process.disk_usage();
        let (read, written) = (usage.total_read_bytes, usage.total_written_bytes);

        if let Some((at, last_read, last_written)) = self.last {
            let secs = now.saturating_duration_since(at).as_secs_f64();
            if secs > 0.0 {
                self.rates = Some(rates_between(last_read, last_written, read, written, secs));
            }
        }
        self.last = Some((now, read, written));
        self.rates
    }
}

fn rates_between(last_read: u64, last_written: u64, read: u64, written: u64, secs: f64) -> IoRates {
    IoRates {
        read_per_sec: read.saturating_sub(last_read) as f64 / secs,
        write_per_sec: written.saturating_sub(last_written) as f64 / secs,
    }
}
