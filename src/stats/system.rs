use super::{StatsError, StatsProvider, StatsSample};
use std::collections::HashSet;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Cross-platform provider backed by `sysinfo`.
///
/// CPU usage is the share used between two refreshes, so every PID is
/// refreshed twice, `MINIMUM_CPU_UPDATE_INTERVAL` apart, before it is read.
pub struct SysinfoProvider {
    system: System,
    primed: HashSet<u32>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            primed: HashSet::new(),
        }
    }

    fn refresh(&mut self, pids: &[Pid]) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(pids),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsProvider for SysinfoProvider {
    fn name(&self) -> &str {
        "sysinfo"
    }

    fn prepare(&mut self, pids: &[u32]) {
        let targets: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        self.refresh(&targets);
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.refresh(&targets);
        self.primed.extend(pids.iter().copied());
    }

    fn sample(&mut self, pid: u32) -> Result<StatsSample, StatsError> {
        if !self.primed.contains(&pid) {
            self.prepare(&[pid]);
        }
        let process = self
            .system
            .process(Pid::from_u32(pid))
            .ok_or(StatsError::NotFound { pid })?;

        Ok(StatsSample {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_bytes: process.memory(),
            alive: !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        })
    }
}
