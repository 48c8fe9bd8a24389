/// OS primitives the lifecycle operations are built on: spawning a detached
/// child, delivering a signal to a PID, and probing a PID for liveness.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// What to run for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Append stdout and stderr here; `None` discards them.
    pub log_file: Option<PathBuf>,
}

/// Process creation and signaling, swappable for tests.
pub trait ProcessControl {
    /// Start `spec` without waiting for it, returning the OS-assigned PID.
    fn spawn(&mut self, spec: &CommandSpec) -> Result<u32, SpawnError>;

    /// Deliver `signal` to `pid`.
    fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), SignalError>;

    /// Whether `pid` currently names a running process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// The real implementation backed by `std::process` and `nix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self, spec: &CommandSpec) -> Result<u32, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        // Own process group, so a Ctrl-C aimed at the caller's shell
        // does not reach the children.
        cmd.process_group(0);

        match &spec.log_file {
            Some(path) => {
                let log_err = |e: std::io::Error| SpawnError::LogFile {
                    path: path.clone(),
                    source: e,
                };
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(log_err)?;
                }
                let out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(log_err)?;
                let err = out.try_clone().map_err(log_err)?;
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| SpawnError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;
        // Not waited on: the child outlives this invocation.
        Ok(child.id())
    }

    fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), SignalError> {
        let raw = to_raw_pid(pid).ok_or(SignalError::InvalidPid { pid })?;
        kill(Pid::from_raw(raw), signal).map_err(|errno| SignalError::Kill {
            pid,
            signal,
            source: errno,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Some(raw) = to_raw_pid(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => !is_zombie(raw),
            // Exists, but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

fn to_raw_pid(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|&raw| raw > 0)
}

/// `kill(pid, 0)` succeeds for zombies; check the process state as well.
#[cfg(target_os = "linux")]
fn is_zombie(raw: i32) -> bool {
    procfs::process::Process::new(raw)
        .and_then(|p| p.stat())
        .map(|stat| stat.state == 'Z' || stat.state == 'X')
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_raw: i32) -> bool {
    false
}

/// Parse a signal given as `SIGINT`, `int`, `INT` or `2`.
pub fn parse_signal(value: &str) -> Option<Signal> {
    let value = value.trim();
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).ok();
    }
    let upper = value.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    name.parse().ok()
}

/// Errors from starting a single instance.
#[derive(Debug)]
pub enum SpawnError {
    /// Failed to open the per-instance log file.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to start the program.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {source}", path.display())
            }
            SpawnError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::LogFile { source, .. } => Some(source),
            SpawnError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Errors from signaling a single PID.
#[derive(Debug)]
pub enum SignalError {
    /// The PID cannot be represented as a positive `pid_t`.
    InvalidPid { pid: u32 },
    Kill {
        pid: u32,
        signal: Signal,
        source: Errno,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::InvalidPid { pid } => write!(f, "invalid PID {pid}"),
            SignalError::Kill {
                pid,
                signal,
                source,
            } => write!(f, "failed to send {signal} to PID {pid}: {source}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::InvalidPid { .. } => None,
            SignalError::Kill { source, .. } => Some(source),
        }
    }
}
