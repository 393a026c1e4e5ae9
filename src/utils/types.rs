use serde::{Deserialize, Serialize};

/// Importance tier shared by hosts and services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Criticality {
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "important")]
    Important,
    #[serde(rename = "nice-to-have")]
    #[default]
    NiceToHave,
}

impl Criticality {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Criticality::Critical),
            "important" => Some(Criticality::Important),
            "nice-to-have" | "nice_to_have" => Some(Criticality::NiceToHave),
            _ => None,
        }
    }
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::Critical => f.pad("critical"),
            Criticality::Important => f.pad("important"),
            Criticality::NiceToHave => f.pad("nice-to-have"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    PrimaryServer,
    SecondaryServer,
    #[default]
    UtilityServer,
    MediaServer,
    PublicFacing,
    Development,
    Backup,
}

impl std::fmt::Display for HostRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostRole::PrimaryServer => "primary_server",
            HostRole::SecondaryServer => "secondary_server",
            HostRole::UtilityServer => "utility_server",
            HostRole::MediaServer => "media_server",
            HostRole::PublicFacing => "public_facing",
            HostRole::Development => "development",
            HostRole::Backup => "backup",
        };
        f.pad(s)
    }
}

/// One kind of inventory query executed per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCategory {
    #[serde(alias = "server_info")]
    HostFacts,
    #[serde(alias = "docker")]
    Containers,
    ComposeFiles,
}

#[cfg(test)]
impl ProbeCategory {
    pub const ALL: [ProbeCategory; 3] = [
        ProbeCategory::HostFacts,
        ProbeCategory::Containers,
        ProbeCategory::ComposeFiles,
    ];
}

impl std::fmt::Display for ProbeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeCategory::HostFacts => f.pad("host_facts"),
            ProbeCategory::Containers => f.pad("containers"),
            ProbeCategory::ComposeFiles => f.pad("compose_files"),
        }
    }
}
