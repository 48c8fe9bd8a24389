/// In-memory view of the metadata document, keyed by group name.
use crate::metadata::{MetadataDocument, ProcessGroup};

/// Ordered collection of process groups with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessGroupRegistry {
    groups: Vec<ProcessGroup>,
}

impl ProcessGroupRegistry {
    /// Build a registry from a document read off disk.
    pub fn from_document(doc: MetadataDocument) -> Self {
        Self {
            groups: doc.processes,
        }
    }

    /// All groups in insertion order.
    pub fn groups(&self) -> &[ProcessGroup] {
        &self.groups
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ProcessGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Check that `name` can be launched.
    ///
    /// A name is taken only while its group has at least one live PID; a
    /// group whose processes are all gone is stale and may be replaced.
    pub fn ensure_available(
        &self,
        name: &str,
        mut is_live: impl FnMut(u32) -> bool,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let Some(existing) = self.find_by_name(name) else {
            return Ok(());
        };
        let live_pids: Vec<u32> = existing.pids.iter().copied().filter(|&p| is_live(p)).collect();
        if live_pids.is_empty() {
            tracing::debug!(name = %name, pids = ?existing.pids, "existing group is stale");
            return Ok(());
        }
        Err(RegistryError::AlreadyRunning {
            name: name.to_string(),
            live_pids,
        })
    }

    /// Insert `group`, replacing a stale group of the same name in place.
    ///
    /// Rejected with `AlreadyRunning` when a group of that name still has a
    /// live PID; nothing is modified in that case. The launcher splits this
    /// into `ensure_available` and `replace_or_append` around its spawns.
    #[allow(dead_code)]
    pub fn upsert_merge(
        &mut self,
        group: ProcessGroup,
        is_live: impl FnMut(u32) -> bool,
    ) -> Result<(), RegistryError> {
        self.ensure_available(&group.name, is_live)?;
        self.replace_or_append(group);
        Ok(())
    }

    /// Insert `group` without a liveness check, replacing any group of the
    /// same name in place.
    ///
    /// For callers that already ran `ensure_available` under the store lock.
    /// PIDs handed out after that check may coincide with the old group's
    /// dead ones, so they must not be probed again.
    pub fn replace_or_append(&mut self, mut group: ProcessGroup) {
        let mut seen = Vec::with_capacity(group.pids.len());
        group.pids.retain(|pid| {
            if seen.contains(pid) {
                false
            } else {
                seen.push(*pid);
                true
            }
        });

        match self.groups.iter_mut().find(|g| g.name == group.name) {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    /// Remove the group called `name` and hand it back to the caller.
    ///
    /// The surviving groups keep their relative order.
    pub fn remove_by_name(&mut self, name: &str) -> Option<ProcessGroup> {
        let mut removed = None;
        let mut survivors = Vec::with_capacity(self.groups.len());
        for group in std::mem::take(&mut self.groups) {
            if removed.is_none() && group.name == name {
                removed = Some(group);
            } else {
                survivors.push(group);
            }
        }
        self.groups = survivors;
        removed
    }

    /// Snapshot the registry as a document stamped with `now`.
    pub fn to_document(&self, now: i64) -> MetadataDocument {
        MetadataDocument {
            processes: self.groups.clone(),
            updated_at: now,
        }
    }
}

/// Conflicts rejected by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A group with this name still has live processes.
    AlreadyRunning { name: String, live_pids: Vec<u32> },
    /// Group names must be non-empty.
    EmptyName,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyRunning { name, live_pids } => {
                let pids: Vec<String> = live_pids.iter().map(u32::to_string).collect();
                write!(
                    f,
                    "process {name} is already running with PID {}",
                    pids.join(", ")
                )
            }
            RegistryError::EmptyName => write!(f, "process group name must not be empty"),
        }
    }
}

impl std::error::Error for RegistryError {}
