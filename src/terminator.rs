/// Terminate: signal every process of a group and deregister it.
use crate::metadata::{MetadataStore, ProcessGroup, StoreError};
use crate::platform::ProcessControl;
use crate::registry::ProcessGroupRegistry;
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a group is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatePolicy {
    pub signal: Signal,
    /// How long to wait for signaled processes to exit. Zero means do not wait.
    pub grace_period: Duration,
    /// Send SIGKILL to processes still alive when the grace period ends.
    pub escalate_to_kill: bool,
}

impl Default for TerminatePolicy {
    fn default() -> Self {
        Self {
            signal: Signal::SIGINT,
            grace_period: Duration::ZERO,
            escalate_to_kill: false,
        }
    }
}

/// Result of a completed terminate.
#[derive(Debug)]
pub struct TerminateOutcome {
    /// The group removed from the metadata.
    pub group: ProcessGroup,
    /// PIDs the signal was delivered to.
    pub signaled: Vec<u32>,
    /// PIDs the signal could not be delivered to.
    pub failed: Vec<u32>,
    /// PIDs still alive after the grace period.
    pub survivors: Vec<u32>,
    /// Survivors that were sent SIGKILL.
    pub killed: Vec<u32>,
    pub elapsed: Duration,
}

/// Stops process groups and removes them from the metadata store.
pub struct Terminator<'a> {
    store: &'a MetadataStore,
    control: &'a mut dyn ProcessControl,
}

impl<'a> Terminator<'a> {
    pub fn new(store: &'a MetadataStore, control: &'a mut dyn ProcessControl) -> Self {
        Self { store, control }
    }

    /// Signal every PID registered under `name` and drop the group.
    ///
    /// An unknown name is `NotFound` and leaves the document untouched.
    /// Per-PID signal failures are logged; the group is removed regardless.
    pub fn terminate(
        &mut self,
        name: &str,
        policy: &TerminatePolicy,
    ) -> Result<TerminateOutcome, TerminateError> {
        let clock = Instant::now();

        let _lock = self.store.lock()?;
        let mut registry = ProcessGroupRegistry::from_document(self.store.read_or_default()?);
        let Some(group) = registry.remove_by_name(name) else {
            return Err(TerminateError::NotFound {
                name: name.to_string(),
            });
        };
        debug!(
            name = %name,
            pids = ?group.pids,
            remaining = registry.groups().len(),
            "group removed from registry"
        );

        let mut signaled = Vec::new();
        let mut failed = Vec::new();
        for pid in group.pids.iter().copied() {
            match self.control.signal(pid, policy.signal) {
                Ok(()) => {
                    info!(name = %name, pid, signal = %policy.signal, "signal sent");
                    signaled.push(pid);
                }
                Err(e) => {
                    warn!(name = %name, pid, error = %e, "failed to signal process");
                    failed.push(pid);
                }
            }
        }

        let survivors = self.wait_for_exit(&signaled, policy.grace_period);
        let mut killed = Vec::new();
        if policy.escalate_to_kill && policy.signal != Signal::SIGKILL {
            for &pid in &survivors {
                match self.control.signal(pid, Signal::SIGKILL) {
                    Ok(()) => {
                        info!(name = %name, pid, "escalated to SIGKILL");
                        killed.push(pid);
                    }
                    Err(e) => warn!(name = %name, pid, error = %e, "failed to kill process"),
                }
            }
        } else {
            for &pid in &survivors {
                warn!(name = %name, pid, "process still running after grace period, no longer tracked");
            }
        }

        self.store
            .write(&registry.to_document(chrono::Utc::now().timestamp()))?;

        Ok(TerminateOutcome {
            group,
            signaled,
            failed,
            survivors,
            killed,
            elapsed: clock.elapsed(),
        })
    }

    /// Poll until every PID is gone or `grace` elapses; returns those still alive.
    fn wait_for_exit(&self, pids: &[u32], grace: Duration) -> Vec<u32> {
        if grace.is_zero() || pids.is_empty() {
            return Vec::new();
        }
        let deadline = Instant::now() + grace;
        loop {
            let alive: Vec<u32> = pids
                .iter()
                .copied()
                .filter(|&pid| self.control.is_alive(pid))
                .collect();
            if alive.is_empty() {
                return alive;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(?alive, "grace period expired");
                return alive;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Errors that abort a terminate as a whole.
#[derive(Debug)]
pub enum TerminateError {
    /// No group is registered under this name; nothing was changed.
    NotFound { name: String },
    Store(StoreError),
}

impl From<StoreError> for TerminateError {
    fn from(e: StoreError) -> Self {
        TerminateError::Store(e)
    }
}

impl std::fmt::Display for TerminateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateError::NotFound { name } => {
                write!(f, "no running processes found under name {name}")
            }
            TerminateError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TerminateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminateError::NotFound { .. } => None,
            TerminateError::Store(e) => Some(e),
        }
    }
}
