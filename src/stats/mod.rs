//! Per-process resource statistics.
//!
//! A `StatsProvider` answers "how much CPU and memory is this PID using, and
//! is it still running?". Backends are interchangeable and chosen once at
//! startup from `[stats] backend`.

#[cfg(target_os = "linux")]
mod proc_stat;
mod system;

#[cfg(target_os = "linux")]
pub use proc_stat::ProcfsProvider;
pub use system::SysinfoProvider;

use serde::Deserialize;

/// One reading for one PID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSample {
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    pub alive: bool,
}

/// Source of per-process statistics.
pub trait StatsProvider {
    /// Backend name, for diagnostics.
    fn name(&self) -> &str;

    /// Called once with every PID about to be sampled.
    ///
    /// Backends that measure CPU over an interval take both readings here
    /// instead of once per PID.
    fn prepare(&mut self, _pids: &[u32]) {}

    fn sample(&mut self, pid: u32) -> Result<StatsSample, StatsError>;
}

/// Which provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsBackend {
    /// procfs on Linux, sysinfo elsewhere.
    #[default]
    Auto,
    Sysinfo,
    Procfs,
}

/// Build the provider for `backend`, falling back to sysinfo when the
/// requested one is unavailable on this platform.
pub fn select_provider(backend: StatsBackend) -> Box<dyn StatsProvider> {
    match backend {
        StatsBackend::Sysinfo => Box::new(SysinfoProvider::new()),
        StatsBackend::Auto | StatsBackend::Procfs => procfs_or_fallback(backend),
    }
}

#[cfg(target_os = "linux")]
fn procfs_or_fallback(backend: StatsBackend) -> Box<dyn StatsProvider> {
    match ProcfsProvider::new() {
        Ok(provider) => Box::new(provider),
        Err(e) => {
            if backend == StatsBackend::Procfs {
                tracing::warn!(error = %e, "procfs unavailable, falling back to sysinfo");
            } else {
                tracing::debug!(error = %e, "procfs unavailable, using sysinfo");
            }
            Box::new(SysinfoProvider::new())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn procfs_or_fallback(backend: StatsBackend) -> Box<dyn StatsProvider> {
    if backend == StatsBackend::Procfs {
        tracing::warn!("procfs backend is only available on Linux, using sysinfo");
    }
    Box::new(SysinfoProvider::new())
}

/// Errors from sampling a single PID.
#[derive(Debug)]
pub enum StatsError {
    /// No process with this PID exists.
    NotFound { pid: u32 },
    /// The backend failed for another reason.
    Backend {
        pid: Option<u32>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::NotFound { pid } => write!(f, "process {pid} not found"),
            StatsError::Backend {
                pid: Some(pid),
                source,
            } => write!(f, "failed to read stats for process {pid}: {source}"),
            StatsError::Backend { pid: None, source } => {
                write!(f, "stats backend unavailable: {source}")
            }
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::NotFound { .. } => None,
            StatsError::Backend { source, .. } => Some(source.as_ref()),
        }
    }
}

/// Scriptable `StatsProvider` for tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Debug, Default)]
    pub struct FakeStatsProvider {
        pub samples: BTreeMap<u32, StatsSample>,
        pub failing: BTreeSet<u32>,
        pub prepared: Vec<u32>,
        pub queried: Vec<u32>,
    }

    impl FakeStatsProvider {
        pub fn with_pids(pids: &[u32]) -> Self {
            let mut fake = Self::default();
            for (i, &pid) in pids.iter().enumerate() {
                fake.samples.insert(
                    pid,
                    StatsSample {
                        cpu_percent: i as f64 + 0.5,
                        memory_bytes: (i as u64 + 1) * 1024 * 1024,
                        alive: true,
                    },
                );
            }
            fake
        }
    }

    impl StatsProvider for FakeStatsProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn prepare(&mut self, pids: &[u32]) {
            self.prepared.extend_from_slice(pids);
        }

        fn sample(&mut self, pid: u32) -> Result<StatsSample, StatsError> {
            self.queried.push(pid);
            if self.failing.contains(&pid) {
                return Err(StatsError::Backend {
                    pid: Some(pid),
                    source: "permission denied".into(),
                });
            }
            self.samples
                .get(&pid)
                .copied()
                .ok_or(StatsError::NotFound { pid })
        }
    }
}
