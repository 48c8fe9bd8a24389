//! The persisted metadata document and its on-disk store.
//!
//! The document is a single JSON file (`.lights.meta` by default) that records
//! every process group started by `lights`. It is the only state carried
//! between invocations.
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default file name of the metadata document, relative to the working directory.
pub const DEFAULT_METADATA_FILE: &str = ".lights.meta";

/// One supervised OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Seconds since the Unix epoch.
    pub start_time: i64,
}

/// A named group of processes started together.
///
/// The wire format carries a single `startTime` per group, so every entry of
/// a group shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_pids")]
    pub pids: Vec<u32>,
    #[serde(rename = "startTime", default)]
    pub start_time: i64,
}

impl ProcessGroup {
    pub fn new(name: impl Into<String>, pids: Vec<u32>, start_time: i64) -> Self {
        Self {
            name: name.into(),
            pids,
            start_time,
        }
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = ProcessEntry> + '_ {
        self.pids.iter().map(move |&pid| ProcessEntry {
            pid,
            start_time: self.start_time,
        })
    }
}

/// Root of the metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub processes: Vec<ProcessGroup>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: i64,
}

impl MetadataDocument {
    /// Parse a document, accepting the legacy layouts older releases wrote.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let doc: MetadataDocument = serde_json::from_str(json)?;
        Ok(doc.normalized())
    }

    /// Fold records that repeat a name into one group and drop unusable PIDs.
    ///
    /// Old files stored one record per PID with the name repeated, and left
    /// zeroed records behind for failed spawns. PID 0 addresses the caller's
    /// own process group and must never be signaled.
    fn normalized(self) -> Self {
        let mut groups: Vec<ProcessGroup> = Vec::with_capacity(self.processes.len());
        for record in self.processes {
            if record.name.is_empty() {
                if !record.pids.is_empty() {
                    tracing::warn!(pids = ?record.pids, "dropping unnamed process record");
                }
                continue;
            }
            let pids = record.pids.into_iter().filter(|&pid| pid != 0);
            match groups.iter_mut().find(|g| g.name == record.name) {
                Some(existing) => {
                    for pid in pids {
                        if !existing.pids.contains(&pid) {
                            existing.pids.push(pid);
                        }
                    }
                    if record.start_time != 0
                        && (existing.start_time == 0 || record.start_time < existing.start_time)
                    {
                        existing.start_time = record.start_time;
                    }
                }
                None => {
                    let mut unique: Vec<u32> = Vec::new();
                    for pid in pids {
                        if !unique.contains(&pid) {
                            unique.push(pid);
                        }
                    }
                    groups.push(ProcessGroup::new(record.name, unique, record.start_time));
                }
            }
        }
        Self {
            processes: groups,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PidField {
    Many(Vec<u32>),
    One(u32),
}

fn deserialize_pids<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<PidField>::deserialize(deserializer)? {
        Some(PidField::Many(pids)) => pids,
        Some(PidField::One(pid)) => vec![pid],
        None => Vec::new(),
    })
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reads and writes the metadata document at a fixed path.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the metadata document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path to the sidecar lock file (`<metadata>.lock`).
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_METADATA_FILE.into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Read the document. `Ok(None)` means no launch has happened yet.
    pub fn read(&self) -> Result<Option<MetadataDocument>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "metadata file not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        MetadataDocument::from_json(&contents)
            .map(Some)
            .map_err(|e| StoreError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Read the document, treating a missing file as an empty one.
    pub fn read_or_default(&self) -> Result<MetadataDocument, StoreError> {
        Ok(self.read()?.unwrap_or_default())
    }

    /// Atomically replace the document.
    ///
    /// Serializes into a temporary file in the same directory, syncs it, then
    /// renames it over the target so readers never see a partial write.
    pub fn write(&self, doc: &MetadataDocument) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(doc).map_err(|e| StoreError::Serialize { source: e })?;

        let dir = self.dir();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".lights.meta.tmp.")
            .tempfile_in(dir)
            .map_err(|e| StoreError::Write {
                path: dir.to_path_buf(),
                source: e,
            })?;

        let tmp_path = tmp.path().to_path_buf();
        let write_err = |e: std::io::Error| StoreError::Write {
            path: tmp_path.clone(),
            source: e,
        };
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        set_world_readable(tmp.as_file()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        tmp.persist(&self.path).map_err(|e| StoreError::Rename {
            from: tmp_path.clone(),
            to: self.path.clone(),
            source: e.error,
        })?;

        tracing::debug!(
            path = %self.path.display(),
            groups = doc.processes.len(),
            "metadata written"
        );
        Ok(())
    }

    /// Take the exclusive lock guarding read-modify-write cycles.
    ///
    /// Blocks while another invocation holds it. Released when the returned
    /// guard is dropped.
    pub fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.lock_path();
        let lock_err = |e: std::io::Error| StoreError::Lock {
            path: path.clone(),
            source: e,
        };

        std::fs::create_dir_all(self.dir()).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(lock_err(e));
            }
            tracing::info!(path = %path.display(), "waiting for another lights invocation");
            file.lock_exclusive().map_err(lock_err)?;
        }

        Ok(StoreLock { file, path })
    }
}

#[cfg(unix)]
fn set_world_readable(file: &File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_world_readable(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// Held while a launch or terminate mutates the document.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release metadata lock");
        }
    }
}

/// Errors from metadata store operations.
#[derive(Debug)]
pub enum StoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Read { path, source } => {
                write!(f, "failed to read metadata file {}: {source}", path.display())
            }
            StoreError::Parse { path, source } => {
                write!(f, "failed to parse metadata file {}: {source}", path.display())
            }
            StoreError::Serialize { source } => write!(f, "failed to serialize metadata: {source}"),
            StoreError::Write { path, source } => {
                write!(f, "failed to write metadata to {}: {source}", path.display())
            }
            StoreError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StoreError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Read { source, .. } => Some(source),
            StoreError::Parse { source, .. } => Some(source),
            StoreError::Serialize { source } => Some(source),
            StoreError::Write { source, .. } => Some(source),
            StoreError::Rename { source, .. } => Some(source),
            StoreError::Lock { source, .. } => Some(source),
        }
    }
}
