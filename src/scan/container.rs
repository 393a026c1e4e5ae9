use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";
pub const CRITICALITY_LABEL: &str = "homelab.criticality";
pub const OCI_VERSION_LABEL: &str = "org.opencontainers.image.version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Restarting,
    Paused,
    Dead,
    #[default]
    Unknown,
}

impl ContainerState {
    /// Map Docker's `State.Status`.
    pub fn from_docker(status: &str) -> Self {
        match status {
            "running" => ContainerState::Running,
            "exited" | "created" => ContainerState::Stopped,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Restarting => "restarting",
            ContainerState::Paused => "paused",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    /// Raw Docker status string, kept for display.
    pub status: String,
    pub ports: Vec<PortBinding>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<MountInfo>,
    pub networks: Vec<String>,
    pub restart_policy: Option<String>,
    pub restart_count: u64,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub health: Option<String>,
    pub compose_project: Option<String>,
    pub compose_service: Option<String>,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
    pub host_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_type: String,
    pub source: String,
    pub destination: String,
    pub rw: bool,
}
