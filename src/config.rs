//! 扫描配置
//! 来源：YAML 文件，`${VAR}` 从环境变量展开，校验后转为强类型结构

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::utils::{Criticality, HostRole, ProbeCategory};

pub const DEFAULT_CONFIG_PATH: &str = "fleetscan.yaml";
pub const CONFIG_ENV: &str = "FLEETSCAN_CONFIG";
/// Upper bound for `scanning.max_parallel_hosts`.
pub const MAX_PARALLEL_HOSTS: usize = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── 校验后的配置 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub hosts: Vec<Host>,
    pub scanning: ScanSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// A configured scan target. Immutable for the duration of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub hostname: String,
    pub addresses: Addresses,
    pub ssh: Option<SshCredential>,
    pub role: HostRole,
    pub criticality: Criticality,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct Addresses {
    #[serde(default)]
    pub local: Option<String>,
    #[serde(default)]
    pub vpn: Option<String>,
    #[serde(default)]
    pub public: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredential {
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub enabled: BTreeSet<ProbeCategory>,
    pub timeouts: Timeouts,
    pub retries: RetryPolicy,
    pub max_parallel_hosts: usize,
    pub compose_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub host_facts: Duration,
    pub containers: Duration,
    pub compose_files: Duration,
}

impl Timeouts {
    pub fn for_category(&self, category: ProbeCategory) -> Duration {
        match category {
            ProbeCategory::HostFacts => self.host_facts,
            ProbeCategory::Containers => self.containers,
            ProbeCategory::ComposeFiles => self.compose_files,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub dir: PathBuf,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Host {
    /// Address used to reach the host remotely: VPN overlay, then LAN, then hostname.
    pub fn remote_address(&self) -> &str {
        self.addresses
            .vpn
            .as_deref()
            .or(self.addresses.local.as_deref())
            .unwrap_or(&self.hostname)
    }

    /// True when the host is the machine running the scan.
    pub fn is_local(&self, local_hostname: &str) -> bool {
        if self.ssh.is_none() {
            return true;
        }
        matches!(self.hostname.as_str(), "localhost" | "127.0.0.1" | "::1")
            || (!local_hostname.is_empty() && self.hostname.eq_ignore_ascii_case(local_hostname))
    }
}

impl Config {
    /// Load from an explicit path, `$FLEETSCAN_CONFIG`, or `fleetscan.yaml`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
        if value.is_null() {
            return Err(ConfigError::Invalid("configuration is empty".to_string()));
        }
        expand_env_vars(&mut value);
        let raw: RawConfig = serde_yaml::from_value(value)?;
        raw.validate()
    }
}

// ── 原始 YAML 结构 ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    hosts: Vec<RawHost>,
    #[serde(default)]
    scanning: RawScanning,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHost {
    name: String,
    hostname: String,
    #[serde(default)]
    addresses: Addresses,
    #[serde(default)]
    ssh: Option<RawSsh>,
    #[serde(default)]
    role: HostRole,
    #[serde(default)]
    criticality: Criticality,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSsh {
    user: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    #[serde(default)]
    key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScanning {
    #[serde(default = "default_enabled")]
    enabled: Vec<ProbeCategory>,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    retries: RawRetries,
    #[serde(default = "default_parallel")]
    max_parallel_hosts: usize,
    #[serde(default)]
    compose_paths: Vec<String>,
}

impl Default for RawScanning {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timeouts: RawTimeouts::default(),
            retries: RawRetries::default(),
            max_parallel_hosts: default_parallel(),
            compose_paths: Vec::new(),
        }
    }
}

/// Seconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeouts {
    #[serde(default = "default_connect_timeout")]
    connect: u64,
    #[serde(default = "default_facts_timeout")]
    host_facts: u64,
    #[serde(default = "default_runtime_timeout")]
    containers: u64,
    #[serde(default = "default_runtime_timeout")]
    compose_files: u64,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            host_facts: default_facts_timeout(),
            containers: default_runtime_timeout(),
            compose_files: default_runtime_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetries {
    #[serde(default = "default_attempts")]
    max_attempts: u32,
    #[serde(default = "default_multiplier")]
    backoff_multiplier: f64,
    #[serde(default = "default_backoff_ms")]
    initial_backoff_ms: u64,
}

impl Default for RawRetries {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            backoff_multiplier: default_multiplier(),
            initial_backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorage {
    #[serde(default = "default_storage_dir")]
    dir: String,
    #[serde(default)]
    retention_days: Option<u32>,
}

impl Default for RawStorage {
    fn default() -> Self {
        Self { dir: default_storage_dir(), retention_days: None }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLogging {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> Vec<ProbeCategory> {
    vec![ProbeCategory::HostFacts, ProbeCategory::Containers]
}

fn default_parallel() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_facts_timeout() -> u64 {
    30
}

fn default_runtime_timeout() -> u64 {
    60
}

fn default_attempts() -> u32 {
    3
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_storage_dir() -> String {
    "./data/snapshots".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── 校验 ────────────────────────────────────────────────────────────────────

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let mut seen = BTreeSet::new();
        let mut hosts = Vec::with_capacity(self.hosts.len());

        for raw in self.hosts {
            let name = raw.name.trim().to_string();
            if name.is_empty() {
                return Err(invalid("host name must not be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(invalid(format!("duplicate host name: {}", name)));
            }
            let hostname = raw.hostname.trim().to_string();
            if hostname.is_empty() {
                return Err(invalid(format!("host {}: hostname must not be empty", name)));
            }

            let ssh = match raw.ssh {
                Some(s) => {
                    if s.user.trim().is_empty() {
                        return Err(invalid(format!("host {}: ssh.user must not be empty", name)));
                    }
                    if s.port == 0 {
                        return Err(invalid(format!("host {}: ssh.port must not be 0", name)));
                    }
                    Some(SshCredential {
                        user: s.user.trim().to_string(),
                        port: s.port,
                        key_path: s.key_path.filter(|k| !k.is_empty()).map(|k| expand_home(&k)),
                    })
                }
                None => None,
            };

            hosts.push(Host {
                name,
                hostname,
                addresses: raw.addresses,
                ssh,
                role: raw.role,
                criticality: raw.criticality,
            });
        }

        let s = self.scanning;
        if s.max_parallel_hosts < 1 || s.max_parallel_hosts > MAX_PARALLEL_HOSTS {
            return Err(invalid(format!(
                "scanning.max_parallel_hosts must be between 1 and {}",
                MAX_PARALLEL_HOSTS
            )));
        }
        let t = s.timeouts;
        for (label, secs) in [
            ("connect", t.connect),
            ("host_facts", t.host_facts),
            ("containers", t.containers),
            ("compose_files", t.compose_files),
        ] {
            if secs == 0 {
                return Err(invalid(format!("scanning.timeouts.{} must be greater than 0", label)));
            }
        }
        let r = s.retries;
        if r.max_attempts < 1 {
            return Err(invalid("scanning.retries.max_attempts must be at least 1"));
        }
        if !r.backoff_multiplier.is_finite() || r.backoff_multiplier < 1.0 {
            return Err(invalid("scanning.retries.backoff_multiplier must be >= 1.0"));
        }

        let storage_dir = self.storage.dir.trim();
        if storage_dir.is_empty() {
            return Err(invalid("storage.dir must not be empty"));
        }

        Ok(Config {
            hosts,
            scanning: ScanSettings {
                enabled: s.enabled.into_iter().collect(),
                timeouts: Timeouts {
                    connect: Duration::from_secs(t.connect),
                    host_facts: Duration::from_secs(t.host_facts),
                    containers: Duration::from_secs(t.containers),
                    compose_files: Duration::from_secs(t.compose_files),
                },
                retries: RetryPolicy {
                    max_attempts: r.max_attempts,
                    backoff_multiplier: r.backoff_multiplier,
                    initial_backoff: Duration::from_millis(r.initial_backoff_ms),
                },
                max_parallel_hosts: s.max_parallel_hosts,
                compose_paths: s.compose_paths.into_iter().filter(|p| !p.trim().is_empty()).collect(),
            },
            storage: StorageSettings {
                dir: expand_home(storage_dir),
                retention_days: self.storage.retention_days.filter(|d| *d > 0),
            },
            logging: LoggingSettings { level: self.logging.level },
        })
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ── 工具 ────────────────────────────────────────────────────────────────────

/// Replace `${NAME}` in every string scalar; unset variables expand to "".
fn expand_env_vars(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_str(s, |name| std::env::var(name).ok());
            }
        }
        serde_yaml::Value::Sequence(seq) => seq.iter_mut().for_each(expand_env_vars),
        serde_yaml::Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| expand_env_vars(v)),
        serde_yaml::Value::Tagged(tagged) => expand_env_vars(&mut tagged.value),
        _ => {}
    }
}

fn expand_str(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
hosts:
  - name: web-1
    hostname: web-1.lan
    addresses: { local: 10.0.0.5, vpn: 100.64.0.5 }
    ssh: { user: ops, key_path: /keys/id_ed25519 }
    role: public_facing
    criticality: important
  - name: nas
    hostname: localhost
    criticality: critical
scanning:
  enabled: [server_info, docker, compose_files]
  timeouts: { connect: 5, host_facts: 20 }
  retries: { max_attempts: 4, backoff_multiplier: 1.5, initial_backoff_ms: 10 }
  max_parallel_hosts: 2
  compose_paths: [/opt/stacks]
storage: { dir: /var/lib/fleetscan, retention_days: 30 }
"#;

    #[test]
    fn parses_and_validates_full_config() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.hosts.len(), 2);

        let web = &cfg.hosts[0];
        assert_eq!(web.role, HostRole::PublicFacing);
        assert_eq!(web.criticality, Criticality::Important);
        assert_eq!(web.remote_address(), "100.64.0.5");
        let ssh = web.ssh.as_ref().unwrap();
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.key_path.as_deref(), Some(Path::new("/keys/id_ed25519")));

        assert_eq!(cfg.scanning.enabled.len(), 3);
        assert_eq!(cfg.scanning.timeouts.connect, Duration::from_secs(5));
        assert_eq!(cfg.scanning.timeouts.containers, Duration::from_secs(60));
        assert_eq!(cfg.scanning.retries.max_attempts, 4);
        assert_eq!(cfg.scanning.retries.initial_backoff, Duration::from_millis(10));
        assert_eq!(cfg.storage.retention_days, Some(30));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn host_without_ssh_or_loopback_is_local() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert!(!cfg.hosts[0].is_local("build-box"));
        assert!(cfg.hosts[0].is_local("WEB-1.lan"));
        assert!(cfg.hosts[1].is_local("build-box"));
    }

    #[test]
    fn rejects_duplicate_host_names() {
        let yaml = "hosts:\n  - {name: a, hostname: a}\n  - {name: a, hostname: b}\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate host name: a"));
    }

    #[test]
    fn rejects_bad_retry_settings_and_unknown_values() {
        let yaml = "scanning:\n  retries: {max_attempts: 0}\n";
        assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));

        let yaml = "scanning:\n  retries: {backoff_multiplier: 0.5}\n";
        assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));

        let yaml = "hosts:\n  - {name: a, hostname: a, criticality: urgent}\n";
        assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Parse(_))));

        let yaml = "scanning:\n  enabled: [packages]\n";
        assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_blank_hostname_and_ssh_user() {
        let yaml = "hosts:\n  - {name: a, hostname: '  '}\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("host a: hostname must not be empty"));

        let yaml = "hosts:\n  - {name: a, hostname: a, ssh: {user: ''}}\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("host a: ssh.user must not be empty"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        for key in ["connect", "host_facts", "containers", "compose_files"] {
            let yaml = format!("scanning:\n  timeouts: {{{}: 0}}\n", key);
            let err = Config::from_yaml_str(&yaml).unwrap_err();
            assert!(
                err.to_string().contains(&format!("scanning.timeouts.{} must be greater than 0", key)),
                "{}: {}",
                key,
                err
            );
        }
    }

    #[test]
    fn parallelism_must_stay_within_bounds() {
        let yaml = "scanning:\n  max_parallel_hosts: 0\n";
        assert!(matches!(Config::from_yaml_str(yaml), Err(ConfigError::Invalid(_))));

        let yaml = format!("scanning:\n  max_parallel_hosts: {}\n", MAX_PARALLEL_HOSTS + 1);
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("between 1 and 1024"));

        let yaml = format!("scanning:\n  max_parallel_hosts: {}\n", MAX_PARALLEL_HOSTS);
        assert_eq!(Config::from_yaml_str(&yaml).unwrap().scanning.max_parallel_hosts, 1024);
    }

    #[test]
    fn empty_document_is_rejected() {
        assert!(matches!(Config::from_yaml_str(""), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn expands_placeholders() {
        let lookup = |name: &str| (name == "USER_NAME").then(|| "ops".to_string());
        assert_eq!(expand_str("${USER_NAME}@host", lookup), "ops@host");
        assert_eq!(expand_str("x${MISSING}y", lookup), "xy");
        assert_eq!(expand_str("open ${brace", lookup), "open ${brace");
    }
}
