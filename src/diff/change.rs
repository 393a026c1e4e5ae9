use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    HostAdded,
    HostRemoved,
    ServiceAdded,
    ServiceRemoved,
    VersionUpdated,
    ContainerCountChanged,
    ContainersStopped,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeKind::HostAdded => "host_added",
            ChangeKind::HostRemoved => "host_removed",
            ChangeKind::ServiceAdded => "service_added",
            ChangeKind::ServiceRemoved => "service_removed",
            ChangeKind::VersionUpdated => "version_updated",
            ChangeKind::ContainerCountChanged => "container_count_changed",
            ChangeKind::ContainersStopped => "containers_stopped",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    Hosts,
    Services,
    Containers,
    Network,
}

impl std::fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeCategory::Hosts => "hosts",
            ChangeCategory::Services => "services",
            ChangeCategory::Containers => "containers",
            ChangeCategory::Network => "network",
        };
        f.pad(s)
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.pad(s)
    }
}

/// One classified difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub category: ChangeCategory,
    pub severity: Severity,
    pub description: String,
    pub details: BTreeMap<String, Value>,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
impl Change {
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}
