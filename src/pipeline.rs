//! 扫描流水线
//! 流程：扫描 -> 读取上次快照 -> 比对 -> 保存 -> 清理 -> 交给各输出端

use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, Host};
use crate::diff::{self, Change, ChangeSummary};
use crate::scan::{ScanCoordinator, ScanSession, Snapshot};
use crate::store::{SnapshotStore, StoreError};
use crate::utils::{FleetError, Result};

/// Downstream consumer of a finished cycle (reports, notifications).
/// Receives shared references only.
pub trait CycleSink: Send + Sync {
    fn name(&self) -> &str;
    fn publish(&self, snapshot: &Snapshot, changes: &[Change], summary: &ChangeSummary) -> Result<()>;
}

#[derive(Debug)]
pub struct CycleReport {
    pub snapshot: Snapshot,
    pub changes: Vec<Change>,
    pub summary: ChangeSummary,
    /// Where the snapshot was written, if it was.
    pub saved_to: Option<PathBuf>,
    /// No earlier snapshot existed to compare with.
    pub first_run: bool,
}

pub struct Pipeline {
    coordinator: ScanCoordinator,
    hosts: Vec<Host>,
    store: SnapshotStore,
    retention_days: Option<u32>,
    persist: bool,
    /// Set when only part of the fleet is scanned.
    selection: Option<BTreeSet<String>>,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        let coordinator = ScanCoordinator::with_default_channels(config.scanning.clone());
        Self::with_coordinator(config, coordinator)
    }

    pub fn with_coordinator(config: &Config, coordinator: ScanCoordinator) -> Self {
        Self {
            coordinator,
            hosts: config.hosts.clone(),
            store: SnapshotStore::new(&config.storage.dir),
            retention_days: config.storage.retention_days,
            persist: true,
            selection: None,
        }
    }

    /// Scan and diff without writing anything to the store.
    pub fn without_saving(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Scan only the named hosts. The result is compared with the same hosts of the
    /// last full snapshot and never saved, so the history keeps describing the whole fleet.
    pub fn only_hosts(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        let unknown: Vec<&str> = names
            .iter()
            .filter(|n| !self.hosts.iter().any(|h| &h.name == *n))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::Invalid(format!("unknown host: {}", unknown.join(", "))).into());
        }

        let selection: BTreeSet<String> = names.iter().cloned().collect();
        self.hosts.retain(|h| selection.contains(&h.name));
        info!(hosts = ?selection, "scan limited to selected hosts, snapshot will not be saved");
        self.selection = Some(selection);
        self.persist = false;
        Ok(self)
    }

    pub async fn run_cycle(&self, session: &ScanSession, sinks: &[Box<dyn CycleSink>]) -> Result<CycleReport> {
        let snapshot = self.coordinator.scan(&self.hosts, session).await;

        let mut previous = self.store.load_latest()?;
        if let (Some(prev), Some(names)) = (previous.as_mut(), &self.selection) {
            prev.retain_hosts(names);
        }
        let first_run = previous.is_none();

        // a cancelled scan would read as mass removals; keep it out of the history
        let changes = if snapshot.complete {
            diff::diff(&snapshot, previous.as_ref(), Utc::now())?
        } else {
            warn!("scan incomplete, skipping change detection and save");
            Vec::new()
        };
        let summary = ChangeSummary::from_changes(&changes);
        info!(
            changes = summary.total,
            critical = summary.critical.len(),
            warnings = summary.warnings.len(),
            first_run,
            "changes detected"
        );

        let mut saved_to = None;
        if self.persist && snapshot.complete {
            match self.store.save(&snapshot) {
                Ok(path) => saved_to = Some(path),
                Err(e) => {
                    error!(error = %e, changes = summary.total, "snapshot not persisted");
                    return Err(e.into());
                }
            }
            if let Some(days) = self.retention_days {
                if let Err(e) = self.store.prune(days, Utc::now()) {
                    warn!(error = %e, "pruning old snapshots failed");
                }
            }
        }

        let mut failed = Vec::new();
        for sink in sinks {
            if let Err(e) = sink.publish(&snapshot, &changes, &summary) {
                error!(sink = sink.name(), error = %e, "sink failed");
                failed.push(format!("{}: {}", sink.name(), e));
            }
        }
        if !failed.is_empty() {
            return Err(FleetError::System(format!("sinks failed: {}", failed.join("; "))));
        }

        Ok(CycleReport { snapshot, changes, summary, saved_to, first_run })
    }

    /// Repeat cycles until the session is cancelled. A failed cycle is logged and the next one still runs.
    pub async fn watch(&self, session: &ScanSession, sinks: &[Box<dyn CycleSink>], interval: Duration) -> Result<usize> {
        let mut cycles = 0;
        while !session.is_cancelled() {
            cycles += 1;
            info!(cycle = cycles, "cycle started");
            if let Err(e) = self.run_cycle(session, sinks).await {
                error!(cycle = cycles, error = %e, "cycle failed");
            }
            tokio::select! {
                _ = session.token().cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(cycles, "watch stopped");
        Ok(cycles)
    }
}

// ── 历史快照比对 ────────────────────────────────────────────────────────────

/// Outcome of comparing two stored snapshots.
#[derive(Debug)]
pub struct Comparison {
    pub current: Snapshot,
    pub previous: Option<Snapshot>,
    pub changes: Vec<Change>,
    pub summary: ChangeSummary,
}

/// Diff stored snapshots. `current` defaults to the latest pointer, `previous`
/// to the newest timestamped copy older than `current`.
pub fn compare_stored(store: &SnapshotStore, current: Option<&Path>, previous: Option<&Path>) -> Result<Comparison> {
    let current = match current {
        Some(path) => load_input(store, path)?,
        None => store
            .load_latest()?
            .ok_or_else(|| FleetError::DiffInput(format!("no snapshot saved in {}", store.dir().display())))?,
    };

    let previous = match previous {
        Some(path) => Some(load_input(store, path)?),
        None => match store.previous_before(current.timestamp)? {
            Some(stored) => Some(load_input(store, &stored.path)?),
            None => None,
        },
    };

    let changes = diff::diff(&current, previous.as_ref(), Utc::now()).map_err(|e| FleetError::DiffInput(e.to_string()))?;
    let summary = ChangeSummary::from_changes(&changes);
    Ok(Comparison { current, previous, changes, summary })
}

/// An explicitly named snapshot that cannot be read is bad input, not a storage fault.
fn load_input(store: &SnapshotStore, path: &Path) -> Result<Snapshot> {
    store.load(path).map_err(|e| match e {
        StoreError::Io { .. } | StoreError::Corrupt { .. } => FleetError::DiffInput(e.to_string()),
        other => other.into(),
    })
}
