//! 快照数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::{Addresses, Host};
use crate::scan::compose::ComposeStack;
use crate::scan::container::{Container, PortBinding};
use crate::scan::host::SystemFacts;
use crate::utils::{Criticality, HostRole, ProbeCategory};

pub const SCHEMA_VERSION: &str = "1.0";

/// The scanned state of one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub name: String,
    pub hostname: String,
    pub role: HostRole,
    pub criticality: Criticality,
    pub addresses: Addresses,
    pub system: SystemFacts,
    pub reachable: bool,
    pub scan_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub last_scanned: DateTime<Utc>,
}

impl HostFacts {
    /// Identity from configuration, nothing probed yet.
    pub fn from_host(host: &Host, scanned_at: DateTime<Utc>) -> Self {
        Self {
            name: host.name.clone(),
            hostname: host.hostname.clone(),
            role: host.role,
            criticality: host.criticality,
            addresses: host.addresses.clone(),
            system: SystemFacts::default(),
            reachable: true,
            scan_errors: Vec::new(),
            warnings: Vec::new(),
            last_scanned: scanned_at,
        }
    }

    pub fn os_version(&self) -> Option<&str> {
        self.system.os_version.as_deref()
    }

    pub fn docker_version(&self) -> Option<&str> {
        self.system.docker_version.as_deref()
    }
}

/// Containers on one host that implement one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// `<key>@<host>`: unique within a snapshot and stable across scans.
    pub name: String,
    pub host: String,
    pub criticality: Criticality,
    pub url: Option<String>,
    pub compose_stack: Option<String>,
    pub compose_file: Option<String>,
    pub image: Option<String>,
    pub version: Option<String>,
    pub ports: Vec<PortBinding>,
    /// Group keys on the same host.
    pub depends_on: Vec<String>,
    pub required_by: Vec<String>,
    pub containers: Vec<Container>,
}

impl Service {
    /// Service names are always host-qualified.
    pub fn qualified_name(key: &str, host: &str) -> String {
        format!("{}@{}", key, host)
    }

    /// The group key without its `@<host>` suffix.
    pub fn key(&self) -> &str {
        self.name
            .strip_suffix(self.host.as_str())
            .and_then(|rest| rest.strip_suffix('@'))
            .unwrap_or(&self.name)
    }

    pub fn running_containers(&self) -> usize {
        self.containers.iter().filter(|c| c.is_running()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
    /// False when the scan was cancelled before every host reported.
    pub complete: bool,
    pub servers: Vec<HostFacts>,
    pub services: Vec<Service>,
    pub compose_stacks: Vec<ComposeStack>,
    pub total_servers: usize,
    pub total_services: usize,
    pub total_containers: usize,
    pub running_containers: usize,
    pub scan_duration_seconds: f64,
    pub scan_errors: Vec<String>,
    pub scan_warnings: Vec<String>,
    pub scanners_used: Vec<ProbeCategory>,
}

impl Snapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            schema_version: SCHEMA_VERSION.to_string(),
            complete: true,
            servers: Vec::new(),
            services: Vec::new(),
            compose_stacks: Vec::new(),
            total_servers: 0,
            total_services: 0,
            total_containers: 0,
            running_containers: 0,
            scan_duration_seconds: 0.0,
            scan_errors: Vec::new(),
            scan_warnings: Vec::new(),
            scanners_used: Vec::new(),
        }
    }

    /// Sort every list into its canonical order and recompute the totals.
    /// Error and warning lists keep their insertion order.
    pub fn canonicalize(&mut self) {
        self.servers.sort_by(|a, b| a.name.cmp(&b.name));
        for svc in &mut self.services {
            svc.containers
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        }
        self.services
            .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.host.cmp(&b.host)));
        self.compose_stacks
            .sort_by(|a, b| a.host.cmp(&b.host).then_with(|| a.path.cmp(&b.path)));
        self.scanners_used.sort();
        self.scanners_used.dedup();
        self.recount();
    }

    pub fn recount(&mut self) {
        self.total_servers = self.servers.len();
        self.total_services = self.services.len();
        self.total_containers = self.services.iter().map(|s| s.containers.len()).sum();
        self.running_containers = self.services.iter().map(Service::running_containers).sum();
    }

    pub fn reachable_servers(&self) -> usize {
        self.servers.iter().filter(|s| s.reachable).count()
    }

    /// Drop everything that belongs to hosts outside `names`, then recount.
    pub fn retain_hosts(&mut self, names: &BTreeSet<String>) {
        self.servers.retain(|h| names.contains(&h.name));
        self.services.retain(|s| names.contains(&s.host));
        self.compose_stacks.retain(|c| names.contains(&c.host));
        let owned = |line: &String| names.iter().any(|n| line.starts_with(&format!("{}: ", n)));
        self.scan_errors.retain(owned);
        self.scan_warnings.retain(owned);
        self.recount();
    }
}

#[cfg(test)]
impl Snapshot {
    pub fn server(&self, name: &str) -> Option<&HostFacts> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}
