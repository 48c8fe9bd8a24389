use super::{StatsError, StatsProvider, StatsSample};
use procfs::process::Process;
use procfs::ProcError;

/// Linux provider reading `/proc/<pid>/stat` directly.
///
/// CPU is the lifetime average: CPU time consumed divided by wall time since
/// the process started. A single read per PID, no sampling delay.
pub struct ProcfsProvider {
    ticks_per_second: f64,
    page_size: u64,
    boot_time: u64,
}

impl ProcfsProvider {
    pub fn new() -> Result<Self, StatsError> {
        let boot_time = procfs::boot_time_secs().map_err(|e| StatsError::Backend {
            pid: None,
            source: Box::new(e),
        })?;
        Ok(Self {
            ticks_per_second: procfs::ticks_per_second() as f64,
            page_size: procfs::page_size(),
            boot_time,
        })
    }
}

impl StatsProvider for ProcfsProvider {
    fn name(&self) -> &str {
        "procfs"
    }

    fn sample(&mut self, pid: u32) -> Result<StatsSample, StatsError> {
        let raw = i32::try_from(pid).map_err(|_| StatsError::NotFound { pid })?;
        let stat = Process::new(raw)
            .and_then(|p| p.stat())
            .map_err(|e| match e {
                ProcError::NotFound(_) => StatsError::NotFound { pid },
                other => StatsError::Backend {
                    pid: Some(pid),
                    source: Box::new(other),
                },
            })?;

        let cpu_seconds = (stat.utime + stat.stime) as f64 / self.ticks_per_second;
        let started_at = self.boot_time as f64 + stat.starttime as f64 / self.ticks_per_second;
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let wall_seconds = now - started_at;
        let cpu_percent = if wall_seconds > 0.0 {
            cpu_seconds / wall_seconds * 100.0
        } else {
            0.0
        };

        Ok(StatsSample {
            cpu_percent,
            memory_bytes: stat.rss * self.page_size,
            alive: !matches!(stat.state, 'Z' | 'X' | 'x'),
        })
    }
}
