//! 快照比对
//! 纯函数：同样的两个快照总是以同样的顺序得到同样的变更
//! 先主机，再服务，最后容器数量；每类内部按名称依次输出新增、移除、变化

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::diff::change::*;
use crate::scan::snapshot::{HostFacts, Service, Snapshot, SCHEMA_VERSION};
use crate::utils::Criticality;

const BULK_CONTAINER_DELTA: i64 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("{which} snapshot is invalid: {reason}")]
    InvalidSnapshot { which: &'static str, reason: String },
}

/// Compare `current` with `previous`. No previous snapshot means first run: no changes.
pub fn diff(
    current: &Snapshot,
    previous: Option<&Snapshot>,
    detected_at: DateTime<Utc>,
) -> Result<Vec<Change>, DiffError> {
    validate(current, "current")?;
    let Some(previous) = previous else {
        return Ok(Vec::new());
    };
    validate(previous, "previous")?;

    let mut d = Differ { detected_at, changes: Vec::new() };
    d.hosts(current, previous);
    d.services(current, previous);
    d.containers(current, previous);
    Ok(d.changes)
}

fn validate(s: &Snapshot, which: &'static str) -> Result<(), DiffError> {
    let invalid = |reason: String| DiffError::InvalidSnapshot { which, reason };

    if s.schema_version != SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported schema version {:?} (expected {:?})",
            s.schema_version, SCHEMA_VERSION
        )));
    }
    if let Some(dup) = first_duplicate(s.servers.iter().map(|h| h.name.as_str())) {
        return Err(invalid(format!("duplicate host name {:?}", dup)));
    }
    if let Some(dup) = first_duplicate(s.services.iter().map(|svc| svc.name.as_str())) {
        return Err(invalid(format!("duplicate service name {:?}", dup)));
    }
    Ok(())
}

fn first_duplicate<'a>(names: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = BTreeSet::new();
    names.into_iter().find(|n| !seen.insert(*n))
}

struct Differ {
    detected_at: DateTime<Utc>,
    changes: Vec<Change>,
}

impl Differ {
    fn push(
        &mut self,
        kind: ChangeKind,
        category: ChangeCategory,
        severity: Severity,
        description: String,
        details: Vec<(&str, Value)>,
    ) {
        self.changes.push(Change {
            kind,
            category,
            severity,
            description,
            details: details.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            detected_at: self.detected_at,
        });
    }

    // ── 主机 ────────────────────────────────────────────────────────────────

    fn hosts(&mut self, current: &Snapshot, previous: &Snapshot) {
        let cur: BTreeMap<&str, &HostFacts> = current.servers.iter().map(|h| (h.name.as_str(), h)).collect();
        let prev: BTreeMap<&str, &HostFacts> = previous.servers.iter().map(|h| (h.name.as_str(), h)).collect();

        for name in cur.keys().filter(|n| !prev.contains_key(*n)) {
            self.push(
                ChangeKind::HostAdded,
                ChangeCategory::Hosts,
                Severity::Info,
                format!("New host added: {}", name),
                vec![("server_name", json!(name))],
            );
        }
        for name in prev.keys().filter(|n| !cur.contains_key(*n)) {
            self.push(
                ChangeKind::HostRemoved,
                ChangeCategory::Hosts,
                Severity::Warning,
                format!("Host removed: {}", name),
                vec![("server_name", json!(name))],
            );
        }
        for (name, now) in &cur {
            let Some(before) = prev.get(name) else { continue };
            for (field, label, old, new) in [
                ("os_version", "OS", before.os_version(), now.os_version()),
                ("docker_version", "Docker", before.docker_version(), now.docker_version()),
            ] {
                if old != new {
                    self.push(
                        ChangeKind::VersionUpdated,
                        ChangeCategory::Hosts,
                        Severity::Info,
                        format!("{} version changed on {}: {} → {}", label, name, shown(old), shown(new)),
                        vec![
                            ("server_name", json!(name)),
                            ("field", json!(field)),
                            ("old_version", json!(old)),
                            ("new_version", json!(new)),
                        ],
                    );
                }
            }
        }
    }

    // ── 服务 ────────────────────────────────────────────────────────────────

    fn services(&mut self, current: &Snapshot, previous: &Snapshot) {
        let cur: BTreeMap<&str, &Service> = current.services.iter().map(|s| (s.name.as_str(), s)).collect();
        let prev: BTreeMap<&str, &Service> = previous.services.iter().map(|s| (s.name.as_str(), s)).collect();

        for (name, svc) in cur.iter().filter(|(n, _)| !prev.contains_key(*n)) {
            let severity = if svc.criticality == Criticality::Critical { Severity::Critical } else { Severity::Info };
            self.push(
                ChangeKind::ServiceAdded,
                ChangeCategory::Services,
                severity,
                format!("New service added: {} on {}", svc.key(), svc.host),
                service_details(svc),
            );
        }
        // disappearance of anything non-trivial outranks its appearance
        for (name, svc) in prev.iter().filter(|(n, _)| !cur.contains_key(*n)) {
            let severity = if svc.criticality == Criticality::Critical { Severity::Critical } else { Severity::Warning };
            self.push(
                ChangeKind::ServiceRemoved,
                ChangeCategory::Services,
                severity,
                format!("Service removed: {} on {}", svc.key(), svc.host),
                service_details(svc),
            );
        }
        for (name, now) in &cur {
            let Some(before) = prev.get(name) else { continue };
            if before.version != now.version {
                let (old, new) = (before.version.as_deref(), now.version.as_deref());
                self.push(
                    ChangeKind::VersionUpdated,
                    ChangeCategory::Services,
                    Severity::Info,
                    format!("Service {} on {} updated: {} → {}", now.key(), now.host, shown(old), shown(new)),
                    vec![
                        ("service_name", json!(now.key())),
                        ("server", json!(now.host)),
                        ("field", json!("version")),
                        ("old_version", json!(old)),
                        ("new_version", json!(new)),
                    ],
                );
            }
        }
    }

    // ── 容器数量 ────────────────────────────────────────────────────────────

    fn containers(&mut self, current: &Snapshot, previous: &Snapshot) {
        let (prev_total, cur_total) = (previous.total_containers as i64, current.total_containers as i64);
        let delta = cur_total - prev_total;
        if delta != 0 {
            let severity = if delta.abs() >= BULK_CONTAINER_DELTA { Severity::Warning } else { Severity::Info };
            self.push(
                ChangeKind::ContainerCountChanged,
                ChangeCategory::Containers,
                severity,
                format!("Container count changed: {} → {}", prev_total, cur_total),
                vec![
                    ("previous_count", json!(prev_total)),
                    ("current_count", json!(cur_total)),
                    ("difference", json!(delta)),
                ],
            );
        }

        let (prev_running, cur_running) = (previous.running_containers, current.running_containers);
        if cur_running < prev_running {
            self.push(
                ChangeKind::ContainersStopped,
                ChangeCategory::Containers,
                Severity::Warning,
                format!("Running containers decreased: {} → {}", prev_running, cur_running),
                vec![
                    ("previous_running", json!(prev_running)),
                    ("current_running", json!(cur_running)),
                ],
            );
        }
    }
}

fn service_details(svc: &Service) -> Vec<(&'static str, Value)> {
    vec![
        ("service_name", json!(svc.key())),
        ("server", json!(svc.host)),
        ("criticality", json!(svc.criticality.to_string())),
    ]
}

fn shown(v: Option<&str>) -> &str {
    v.unwrap_or("unknown")
}
