//! Compose 文件发现与解析
//! 来源：在每个配置的根目录下执行 `find`，再逐个读取文件

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::scan::channel::ExecChannel;
use crate::scan::probe::{salvage_stdout, Partial, ProbeError, ProbeResult};

pub const COMPOSE_FILE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeStack {
    pub name: String,
    pub path: String,
    pub host: String,
    pub version: Option<String>,
    pub services: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    /// service -> services it declares in `depends_on`
    pub depends_on: BTreeMap<String, Vec<String>>,
}

impl ComposeStack {
    pub fn declares(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

// ── 收集入口 ────────────────────────────────────────────────────────────────

pub async fn probe(
    channel: &dyn ExecChannel,
    host: &str,
    base_paths: &[String],
    deadline: Duration,
) -> ProbeResult<Vec<ComposeStack>> {
    let mut out = Partial::new(Vec::new());

    for base in base_paths {
        // `find` exits non-zero over one unreadable subdirectory yet still lists the rest
        let listing = match salvage_stdout(channel.exec(&find_command(base), deadline).await, &mut out.warnings) {
            Ok(s) => s,
            Err(e) if e.is_channel_failure() => return Err(e),
            Err(ProbeError::Command { .. }) => {
                out.warn(format!("compose path {} does not exist or is not readable", base));
                continue;
            }
            Err(e) => {
                out.warn(format!("compose path {}: {}", base, e));
                continue;
            }
        };

        let mut files: Vec<&str> = listing.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        files.sort_unstable();
        files.dedup();

        for file in files {
            let content = match channel.read_file(file, deadline).await {
                Ok(c) => c,
                Err(e) if e.is_channel_failure() => return Err(e),
                Err(e) => {
                    out.warn(format!("could not read compose file {}: {}", file, e));
                    continue;
                }
            };
            match parse_compose(host, file, &content) {
                Ok(Some(stack)) => out.value.push(stack),
                Ok(None) => out.warn(format!("compose file {} is empty", file)),
                Err(e) => out.warn(format!("could not parse compose file {}: {}", file, e)),
            }
        }
    }

    Ok(out)
}

pub(crate) fn find_command(base: &str) -> String {
    let names = COMPOSE_FILE_NAMES
        .iter()
        .map(|n| format!("-name {}", n))
        .collect::<Vec<_>>()
        .join(" -o ");
    format!(
        "find {} -maxdepth 4 -type f \\( {} \\) 2>/dev/null",
        shell_words::quote(base),
        names
    )
}

// ── 解析 ────────────────────────────────────────────────────────────────────

pub fn parse_compose(host: &str, path: &str, content: &str) -> Result<Option<ComposeStack>, String> {
    if content.trim().is_empty() {
        return Ok(None);
    }
    let doc: Value = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    if doc.is_null() {
        return Ok(None);
    }
    if !doc.is_mapping() {
        return Err("top level is not a mapping".to_string());
    }

    let name = doc["name"]
        .as_str()
        .map(str::to_string)
        .or_else(|| {
            Path::new(path)
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "default".to_string());

    let version = match &doc["version"] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    let mut depends_on = BTreeMap::new();
    if let Some(services) = doc["services"].as_mapping() {
        for (key, svc) in services {
            let Some(svc_name) = key.as_str() else { continue };
            let deps = dependency_names(&svc["depends_on"]);
            if !deps.is_empty() {
                depends_on.insert(svc_name.to_string(), deps);
            }
        }
    }

    Ok(Some(ComposeStack {
        name,
        path: path.to_string(),
        host: host.to_string(),
        version,
        services: mapping_keys(&doc["services"]),
        networks: mapping_keys(&doc["networks"]),
        volumes: mapping_keys(&doc["volumes"]),
        depends_on,
    }))
}

/// `depends_on` is either a list of names or a map keyed by name.
fn dependency_names(v: &Value) -> Vec<String> {
    let mut names: Vec<String> = match v {
        Value::Sequence(seq) => seq.iter().filter_map(|d| d.as_str()).map(str::to_string).collect(),
        Value::Mapping(_) => mapping_keys(v),
        _ => Vec::new(),
    };
    names.sort();
    names.dedup();
    names
}

fn mapping_keys(v: &Value) -> Vec<String> {
    let mut keys: Vec<String> = v
        .as_mapping()
        .map(|m| m.keys().filter_map(|k| k.as_str()).map(str::to_string).collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
