/// Launch: start N instances of a command and register them under a name.
use crate::metadata::{MetadataStore, ProcessGroup, StoreError};
use crate::platform::{CommandSpec, ProcessControl};
use crate::registry::{ProcessGroupRegistry, RegistryError};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A validated request to start a process group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    /// The command, or the script handed to `binary`.
    pub process: String,
    /// Extra arguments appended after `process`.
    pub args: Vec<String>,
    pub instances: u32,
    /// Interpreter to run `process` with (e.g. `bun`, `node`).
    pub binary: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl LaunchRequest {
    /// Command line for the 1-based `instance`.
    fn command_spec(&self, instance: u32) -> CommandSpec {
        let (program, args) = match &self.binary {
            Some(binary) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.process.clone());
                args.extend(self.args.iter().cloned());
                (binary.clone(), args)
            }
            None => (self.process.clone(), self.args.clone()),
        };
        CommandSpec {
            program,
            args,
            log_file: self
                .log_dir
                .as_ref()
                .map(|dir| dir.join(log_file_name(&self.name, instance))),
        }
    }
}

/// `<name>.<instance>.log`, with path separators in the name flattened.
fn log_file_name(name: &str, instance: u32) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{safe}.{instance}.log")
}

/// Result of a completed launch.
#[derive(Debug)]
pub struct LaunchOutcome {
    /// The group as persisted.
    pub group: ProcessGroup,
    /// (1-based instance, PID) for every instance that started.
    pub started: Vec<(u32, u32)>,
    /// 1-based instances that failed to start.
    pub failed: Vec<u32>,
    pub elapsed: Duration,
}

/// Starts process groups and records them in the metadata store.
pub struct Launcher<'a> {
    store: &'a MetadataStore,
    control: &'a mut dyn ProcessControl,
}

impl<'a> Launcher<'a> {
    pub fn new(store: &'a MetadataStore, control: &'a mut dyn ProcessControl) -> Self {
        Self { store, control }
    }

    /// Start `request.instances` copies of the command and persist the group.
    ///
    /// The name check happens before anything is spawned. Individual spawn
    /// failures are logged and skipped; the group records exactly the
    /// instances that started, possibly none.
    pub fn launch(&mut self, request: &LaunchRequest) -> Result<LaunchOutcome, LaunchError> {
        if request.instances == 0 {
            return Err(LaunchError::NoInstances);
        }
        let clock = Instant::now();

        let _lock = self.store.lock()?;
        let mut registry = ProcessGroupRegistry::from_document(self.store.read_or_default()?);
        {
            let control = &*self.control;
            registry.ensure_available(&request.name, |pid| control.is_alive(pid))?;
        }

        let start_time = chrono::Utc::now().timestamp();
        let mut started = Vec::new();
        let mut failed = Vec::new();

        for instance in 1..=request.instances {
            let spec = request.command_spec(instance);
            debug!(
                instance,
                program = %spec.program,
                args = ?spec.args,
                "spawning instance"
            );
            match self.control.spawn(&spec) {
                Ok(pid) => {
                    info!(name = %request.name, instance, pid, "instance started");
                    started.push((instance, pid));
                }
                Err(e) => {
                    warn!(name = %request.name, instance, error = %e, "failed to start instance");
                    failed.push(instance);
                }
            }
        }

        let group = ProcessGroup::new(
            request.name.clone(),
            started.iter().map(|&(_, pid)| pid).collect(),
            start_time,
        );
        // Name already checked under the lock. New PIDs may reuse a stale
        // group's dead ones and must not be probed again.
        registry.replace_or_append(group.clone());
        let doc = registry.to_document(chrono::Utc::now().timestamp());
        if let Err(source) = self.store.write(&doc) {
            warn!(
                name = %request.name,
                pids = ?group.pids,
                error = %source,
                "started processes could not be recorded"
            );
            return Err(LaunchError::Persist {
                name: request.name.clone(),
                started,
                source,
            });
        }

        Ok(LaunchOutcome {
            group,
            started,
            failed,
            elapsed: clock.elapsed(),
        })
    }
}

/// Errors that abort a launch as a whole.
#[derive(Debug)]
pub enum LaunchError {
    /// The name already has live processes; nothing was spawned.
    AlreadyRunning { name: String, live_pids: Vec<u32> },
    InvalidName,
    NoInstances,
    /// The document could not be read or locked; nothing was spawned.
    Store(StoreError),
    /// Processes were started but the document could not be written.
    Persist {
        name: String,
        /// (1-based instance, PID) for every instance still running untracked.
        started: Vec<(u32, u32)>,
        source: StoreError,
    },
}

impl From<StoreError> for LaunchError {
    fn from(e: StoreError) -> Self {
        LaunchError::Store(e)
    }
}

impl From<RegistryError> for LaunchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyRunning { name, live_pids } => {
                LaunchError::AlreadyRunning { name, live_pids }
            }
            RegistryError::EmptyName => LaunchError::InvalidName,
        }
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::AlreadyRunning { name, live_pids } => {
                let pids: Vec<String> = live_pids.iter().map(u32::to_string).collect();
                write!(
                    f,
                    "process {name} is already running with PID {}",
                    pids.join(", ")
                )
            }
            LaunchError::InvalidName => write!(f, "process group name must not be empty"),
            LaunchError::NoInstances => write!(f, "at least one instance must be requested"),
            LaunchError::Store(e) => write!(f, "{e}"),
            LaunchError::Persist {
                name,
                started,
                source,
            } => {
                let pids: Vec<String> = started.iter().map(|(_, pid)| pid.to_string()).collect();
                write!(
                    f,
                    "started {name} with PID {} but could not record it: {source}",
                    pids.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Store(e) => Some(e),
            LaunchError::Persist { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataDocument;
    use crate::platform::fake::FakeProcessControl;
    use crate::platform::{OsProcessControl, SignalError, SpawnError};
    use nix::sys::signal::Signal;
    use tempfile::tempdir;

    fn request(name: &str, instances: u32) -> LaunchRequest {
        LaunchRequest {
            name: name.to_string(),
            process: "camera.js".to_string(),
            args: vec![],
            instances,
            binary: None,
            log_dir: None,
        }
    }

    #[test]
    fn test_launch_three_instances_persists_three_entries() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();

        let before = chrono::Utc::now().timestamp();
        let outcome = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 3))
            .unwrap();
        let after = chrono::Utc::now().timestamp();

        assert_eq!(outcome.started.len(), 3);
        assert!(outcome.failed.is_empty());

        let doc = store.read().unwrap().unwrap();
        assert_eq!(doc.processes.len(), 1);
        let group = &doc.processes[0];
        assert_eq!(group.name, "cam1");
        assert_eq!(group.pids.len(), 3);
        let mut distinct = group.pids.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        assert!(group.start_time >= before && group.start_time <= after);
        assert!(doc.updated_at >= group.start_time);
    }

    #[test]
    fn test_launch_rejects_live_name_without_spawning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lights.meta");
        let store = MetadataStore::new(path.clone());
        let mut control = FakeProcessControl::new();

        Launcher::new(&store, &mut control)
            .launch(&request("cam1", 2))
            .unwrap();
        let attempts = control.spawn_attempts();
        let bytes_before = std::fs::read(&path).unwrap();

        let err = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 4))
            .unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyRunning { ref name, .. } if name == "cam1"));
        assert_eq!(control.spawn_attempts(), attempts);
        assert_eq!(std::fs::read(&path).unwrap(), bytes_before);
    }

    #[test]
    fn test_launch_replaces_stale_group() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        store
            .write(&MetadataDocument {
                processes: vec![
                    ProcessGroup::new("other", vec![1], 10),
                    ProcessGroup::new("cam1", vec![424242], 10),
                ],
                updated_at: 10,
            })
            .unwrap();
        // 424242 is not in the fake's live set, so the group is stale
        let mut control = FakeProcessControl::new();

        let outcome = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 1))
            .unwrap();

        let doc = store.read().unwrap().unwrap();
        let names: Vec<&str> = doc.processes.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["other", "cam1"]);
        assert_eq!(doc.processes[1].pids, vec![outcome.started[0].1]);
    }

    #[test]
    fn test_new_pid_reusing_stale_pid_is_recorded() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        // The fake hands out 1001 first, the same PID the stale group holds
        store
            .write(&MetadataDocument {
                processes: vec![ProcessGroup::new("cam1", vec![1001], 1)],
                updated_at: 1,
            })
            .unwrap();
        let mut control = FakeProcessControl::new();

        let outcome = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 2))
            .unwrap();

        assert_eq!(outcome.group.pids, vec![1001, 1002]);
        let doc = store.read().unwrap().unwrap();
        assert_eq!(doc.processes.len(), 1);
        assert_eq!(doc.processes[0].pids, vec![1001, 1002]);
        assert!(doc.processes[0].start_time > 1);
    }

    /// Replaces the metadata file with a non-empty directory on first spawn,
    /// so the final rename fails.
    struct ClobberingControl {
        inner: FakeProcessControl,
        meta: PathBuf,
    }

    impl ProcessControl for ClobberingControl {
        fn spawn(&mut self, spec: &CommandSpec) -> Result<u32, SpawnError> {
            if !self.meta.is_dir() {
                let _ = std::fs::remove_file(&self.meta);
                std::fs::create_dir_all(self.meta.join("occupied")).unwrap();
            }
            self.inner.spawn(spec)
        }

        fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), SignalError> {
            self.inner.signal(pid, signal)
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.inner.is_alive(pid)
        }
    }

    #[test]
    fn test_failed_write_reports_started_pids() {
        let dir = tempdir().unwrap();
        let meta = dir.path().join(".lights.meta");
        let store = MetadataStore::new(meta.clone());
        let mut control = ClobberingControl {
            inner: FakeProcessControl::new(),
            meta,
        };

        let err = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 3))
            .unwrap_err();

        let LaunchError::Persist {
            name,
            started,
            source,
        } = &err
        else {
            panic!("expected persist error, got {err:?}");
        };
        assert_eq!(name, "cam1");
        assert_eq!(started, &vec![(1, 1001), (2, 1002), (3, 1003)]);
        assert!(matches!(source, StoreError::Rename { .. }));
        assert!(err.to_string().contains("PID 1001, 1002, 1003"));
        assert_eq!(control.inner.spawn_attempts(), 3);
    }

    #[test]
    fn test_one_failed_spawn_leaves_two_entries() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();
        control.failing_spawns.insert(2);

        let outcome = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 3))
            .unwrap();

        assert_eq!(outcome.failed, vec![2]);
        assert_eq!(
            outcome.started.iter().map(|&(i, _)| i).collect::<Vec<_>>(),
            vec![1, 3]
        );
        let doc = store.read().unwrap().unwrap();
        assert_eq!(doc.processes[0].pids.len(), 2);
        assert_eq!(control.spawn_attempts(), 3);
    }

    #[test]
    fn test_all_spawns_failing_persists_empty_group() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();
        control.failing_spawns.extend([1, 2]);

        let outcome = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 2))
            .unwrap();
        assert!(outcome.started.is_empty());

        let doc = store.read().unwrap().unwrap();
        assert_eq!(doc.processes[0].name, "cam1");
        assert!(doc.processes[0].pids.is_empty());

        // The empty group is stale, so relaunching works
        control.failing_spawns.clear();
        Launcher::new(&store, &mut control)
            .launch(&request("cam1", 1))
            .unwrap();
        let doc = store.read().unwrap().unwrap();
        assert_eq!(doc.processes.len(), 1);
        assert_eq!(doc.processes[0].pids.len(), 1);
    }

    #[test]
    fn test_launch_appends_after_existing_groups() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();

        Launcher::new(&store, &mut control)
            .launch(&request("a", 1))
            .unwrap();
        Launcher::new(&store, &mut control)
            .launch(&request("b", 2))
            .unwrap();

        let doc = store.read().unwrap().unwrap();
        let names: Vec<&str> = doc.processes.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_binary_runs_process_as_argument() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();
        let req = LaunchRequest {
            binary: Some("bun".to_string()),
            args: vec!["--port".to_string(), "3000".to_string()],
            log_dir: Some(PathBuf::from("logs")),
            ..request("cam1", 2)
        };

        Launcher::new(&store, &mut control).launch(&req).unwrap();

        assert_eq!(control.spawned[0].program, "bun");
        assert_eq!(control.spawned[0].args, vec!["camera.js", "--port", "3000"]);
        assert_eq!(
            control.spawned[1].log_file,
            Some(PathBuf::from("logs/cam1.2.log"))
        );
    }

    #[test]
    fn test_without_binary_process_is_the_program() {
        let spec = request("cam1", 1).command_spec(1);
        assert_eq!(spec.program, "camera.js");
        assert!(spec.args.is_empty());
        assert!(spec.log_file.is_none());
    }

    #[test]
    fn test_log_file_name_flattens_separators() {
        assert_eq!(log_file_name("./bin/cam", 3), "._bin_cam.3.log");
    }

    #[test]
    fn test_corrupt_metadata_aborts_before_spawning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lights.meta");
        std::fs::write(&path, "garbage").unwrap();
        let store = MetadataStore::new(path);
        let mut control = FakeProcessControl::new();

        let err = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 3))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Store(StoreError::Parse { .. })));
        assert_eq!(control.spawn_attempts(), 0);
    }

    #[test]
    fn test_zero_instances_rejected() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = FakeProcessControl::new();
        let err = Launcher::new(&store, &mut control)
            .launch(&request("cam1", 0))
            .unwrap_err();
        assert!(matches!(err, LaunchError::NoInstances));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_launch_real_processes() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join(".lights.meta"));
        let mut control = OsProcessControl;
        let req = LaunchRequest {
            name: "sleepers".to_string(),
            process: "sleep".to_string(),
            args: vec!["30".to_string()],
            instances: 2,
            binary: None,
            log_dir: None,
        };

        let outcome = Launcher::new(&store, &mut control).launch(&req).unwrap();
        assert_eq!(outcome.started.len(), 2);

        for &(_, pid) in &outcome.started {
            assert!(control.is_alive(pid));
            let raw = nix::unistd::Pid::from_raw(pid as i32);
            nix::sys::signal::kill(raw, nix::sys::signal::Signal::SIGKILL).unwrap();
            nix::sys::wait::waitpid(raw, None).unwrap();
        }
    }
}
