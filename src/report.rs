/// List: per-process CPU, memory, and uptime for registered groups.
use crate::metadata::{MetadataStore, ProcessGroup, StoreError};
use crate::stats::StatsProvider;
use serde::Serialize;
use tabled::settings::object::Columns;
use tabled::settings::{Alignment, Modify, Style};
use tabled::{Table, Tabled};
use tracing::warn;

/// Filter value selecting every group.
pub const ALL_GROUPS: &str = "*";

/// Which groups to report on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupFilter {
    All,
    Named(String),
}

impl GroupFilter {
    /// `*` (or nothing) selects all groups; anything else is an exact name.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some(ALL_GROUPS) => GroupFilter::All,
            Some(name) => GroupFilter::Named(name.to_string()),
        }
    }

    fn matches(&self, group: &ProcessGroup) -> bool {
        match self {
            GroupFilter::All => true,
            GroupFilter::Named(name) => group.name == *name,
        }
    }
}

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub uptime_secs: u64,
    pub alive: bool,
}

/// Builds reports by querying a `StatsProvider` for every registered PID.
pub struct StatsReporter<'a> {
    provider: &'a mut dyn StatsProvider,
}

impl<'a> StatsReporter<'a> {
    pub fn new(provider: &'a mut dyn StatsProvider) -> Self {
        Self { provider }
    }

    /// Read the store and report on the groups selected by `filter`.
    ///
    /// Never writes; a missing document is an empty report.
    pub fn list(
        &mut self,
        store: &MetadataStore,
        filter: &GroupFilter,
        now: i64,
    ) -> Result<Vec<ReportRow>, ReportError> {
        let doc = store.read_or_default()?;
        self.report(&doc.processes, filter, now)
    }

    /// One row per PID, in group-then-entry order.
    ///
    /// A PID the provider cannot sample is logged and left out. A named
    /// filter that matches nothing is `NotFound`.
    pub fn report(
        &mut self,
        groups: &[ProcessGroup],
        filter: &GroupFilter,
        now: i64,
    ) -> Result<Vec<ReportRow>, ReportError> {
        let selected: Vec<&ProcessGroup> = groups.iter().filter(|g| filter.matches(g)).collect();
        if let GroupFilter::Named(name) = filter {
            if selected.is_empty() {
                return Err(ReportError::NotFound { name: name.clone() });
            }
        }

        let pids: Vec<u32> = selected.iter().flat_map(|g| g.pids.iter().copied()).collect();
        if !pids.is_empty() {
            self.provider.prepare(&pids);
        }

        let mut rows = Vec::with_capacity(pids.len());
        for group in selected {
            for entry in group.entries() {
                let sample = match self.provider.sample(entry.pid) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(
                            name = %group.name,
                            pid = entry.pid,
                            provider = self.provider.name(),
                            error = %e,
                            "failed to get process stats"
                        );
                        continue;
                    }
                };
                rows.push(ReportRow {
                    name: group.name.clone(),
                    pid: entry.pid,
                    cpu_percent: sample.cpu_percent,
                    memory_mb: sample.memory_bytes as f64 / (1024.0 * 1024.0),
                    uptime_secs: u64::try_from(now - entry.start_time).unwrap_or(0),
                    alive: sample.alive,
                });
            }
        }
        Ok(rows)
    }
}

#[derive(Tabled)]
struct TableRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "CPU(%)")]
    cpu: String,
    #[tabled(rename = "MEMORY(MB)")]
    memory: String,
    #[tabled(rename = "Uptime")]
    uptime: String,
}

/// Render rows as the `list` table.
pub fn render_table(rows: &[ReportRow]) -> String {
    let table_rows: Vec<TableRow> = rows
        .iter()
        .map(|row| TableRow {
            name: row.name.clone(),
            pid: row.pid,
            cpu: format!("{:.2}", row.cpu_percent),
            memory: format!("{:.2}", row.memory_mb),
            uptime: if row.alive {
                format_uptime(row.uptime_secs)
            } else {
                "exited".to_string()
            },
        })
        .collect();

    Table::new(&table_rows)
        .with(Style::modern())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string()
}

/// Compact duration: `45s`, `3m12s`, `2h05m09s`, `3d04h10m`.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d{hours:02}h{minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Errors that abort a report.
#[derive(Debug)]
pub enum ReportError {
    /// A named filter matched no group.
    NotFound { name: String },
    Store(StoreError),
}

impl From<StoreError> for ReportError {
    fn from(e: StoreError) -> Self {
        ReportError::Store(e)
    }
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::NotFound { name } => {
                write!(f, "no running processes found under name {name}")
            }
            ReportError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::NotFound { .. } => None,
            ReportError::Store(e) => Some(e),
        }
    }
}
