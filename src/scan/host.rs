//! 宿主机层信息收集
//! 来源：/proc/*、/etc/os-release、uname、df、ip、docker version
//! 所有查询都走主机的执行通道，只有通道失败才中止本类采集

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::scan::channel::ExecChannel;
use crate::scan::probe::{soften, Partial, ProbeError, ProbeResult};

// ── 数据结构 ────────────────────────────────────────────────────────────────

/// What the host reports about itself. Unknown fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub reported_hostname: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub os_pretty: Option<String>,
    pub kernel_version: Option<String>,
    pub architecture: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub memory_total_mb: Option<u64>,
    pub memory_used_mb: Option<u64>,
    pub disk_total_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub load_average: Option<[f64; 3]>,
    pub uptime_seconds: Option<u64>,
    pub interfaces: Vec<NetworkInterface>,
    pub docker_version: Option<String>,
    pub compose_version: Option<String>,
}

impl SystemFacts {
    pub fn memory_percent(&self) -> Option<f64> {
        match (self.memory_used_mb, self.memory_total_mb) {
            (Some(used), Some(total)) if total > 0 => Some(used as f64 / total as f64 * 100.0),
            _ => None,
        }
    }

    pub fn disk_percent(&self) -> Option<f64> {
        match (self.disk_used_gb, self.disk_total_gb) {
            (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub is_up: bool,
}

// ── 收集入口 ────────────────────────────────────────────────────────────────

pub async fn probe(channel: &dyn ExecChannel, deadline: Duration) -> ProbeResult<SystemFacts> {
    let mut w = Vec::new();
    let mut f = SystemFacts::default();

    if let Some(s) = soften(channel.read_file("/proc/sys/kernel/hostname", deadline).await, "hostname", &mut w)? {
        f.reported_hostname = non_empty(s.trim());
    }

    if let Some(s) = soften(channel.read_file("/etc/os-release", deadline).await, "os-release", &mut w)? {
        let os = parse_os_release(&s);
        if os.name.is_none() {
            w.push("os-release: no NAME field".to_string());
        }
        f.os_name = os.name;
        f.os_version = os.version;
        f.os_pretty = os.pretty;
    }

    if let Some(s) = soften(channel.exec("uname -rm", deadline).await, "uname", &mut w)? {
        let mut parts = s.split_whitespace();
        f.kernel_version = parts.next().map(str::to_string);
        f.architecture = parts.next().map(str::to_string);
    }

    if let Some(s) = soften(channel.read_file("/proc/cpuinfo", deadline).await, "cpuinfo", &mut w)? {
        let (model, cores) = parse_cpuinfo(&s);
        f.cpu_model = model;
        f.cpu_cores = (cores > 0).then_some(cores);
    }

    if let Some(s) = soften(channel.read_file("/proc/meminfo", deadline).await, "meminfo", &mut w)? {
        match parse_meminfo(&s) {
            Some((total, used)) => {
                f.memory_total_mb = Some(total);
                f.memory_used_mb = Some(used);
            }
            None => w.push("meminfo: no MemTotal".to_string()),
        }
    }

    if let Some(s) = soften(channel.read_file("/proc/loadavg", deadline).await, "loadavg", &mut w)? {
        f.load_average = parse_loadavg(&s);
        if f.load_average.is_none() {
            w.push(format!("loadavg: cannot parse {:?}", s.trim()));
        }
    }

    if let Some(s) = soften(channel.read_file("/proc/uptime", deadline).await, "uptime", &mut w)? {
        f.uptime_seconds = s
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v as u64);
    }

    if let Some(s) = soften(channel.exec("df -Pk /", deadline).await, "df", &mut w)? {
        match parse_df_root(&s) {
            Some((total, used)) => {
                f.disk_total_gb = Some(total);
                f.disk_used_gb = Some(used);
            }
            None => w.push("df: unexpected output".to_string()),
        }
    }

    if let Some(s) = soften(channel.exec("ip -j addr show", deadline).await, "interfaces", &mut w)? {
        match parse_ip_json(&s) {
            Ok(ifaces) => f.interfaces = ifaces,
            Err(e) => w.push(format!("interfaces: {}", e)),
        }
    }

    if let Some(s) = soften(
        channel.exec("docker version --format '{{json .}}'", deadline).await,
        "docker version",
        &mut w,
    )? {
        match parse_docker_version(&s) {
            Ok(v) => f.docker_version = v,
            Err(e) => w.push(format!("docker version: {}", e)),
        }
    }

    if let Some(s) = soften(
        channel.exec("docker compose version --short", deadline).await,
        "compose version",
        &mut w,
    )? {
        f.compose_version = non_empty(s.trim());
    }

    Ok(Partial { value: f, warnings: w })
}

// ── OS ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct OsRelease {
    name: Option<String>,
    version: Option<String>,
    pretty: Option<String>,
}

fn parse_os_release(content: &str) -> OsRelease {
    let get = |key: &str| -> Option<String> {
        content
            .lines()
            .find_map(|l| l.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
            .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
            .filter(|v| !v.is_empty())
    };
    OsRelease {
        name: get("NAME"),
        version: get("VERSION").or_else(|| get("VERSION_ID")),
        pretty: get("PRETTY_NAME"),
    }
}

// ── CPU ─────────────────────────────────────────────────────────────────────

fn parse_cpuinfo(cpuinfo: &str) -> (Option<String>, u32) {
    // x86 uses "model name", ARM boards report "Model" or "Hardware"
    let model = ["model name", "Model", "Hardware"].iter().find_map(|key| {
        cpuinfo
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_once(':'))
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    });

    let cores = cpuinfo
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count() as u32;

    (model, cores)
}

fn parse_loadavg(s: &str) -> Option<[f64; 3]> {
    let mut parts = s.split_whitespace().map(|v| v.parse::<f64>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}

// ── Memory ──────────────────────────────────────────────────────────────────

/// (total MiB, used MiB)
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let get = |key: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };

    let total_kb = get("MemTotal:")?;
    // kernels before 3.14 have no MemAvailable
    let available_kb = get("MemAvailable:")
        .or_else(|| Some(get("MemFree:")? + get("Buffers:").unwrap_or(0) + get("Cached:").unwrap_or(0)))
        .unwrap_or(0);
    let used_kb = total_kb.saturating_sub(available_kb);
    Some((total_kb / 1024, used_kb / 1024))
}

// ── Disk ────────────────────────────────────────────────────────────────────

/// (total GiB, used GiB) of `/` from POSIX `df -Pk`.
fn parse_df_root(out: &str) -> Option<(f64, f64)> {
    let line = out.lines().skip(1).find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }
    let total_kb: u64 = parts[1].parse().ok()?;
    let used_kb: u64 = parts[2].parse().ok()?;
    let kib_per_gib = 1024.0 * 1024.0;
    Some((round2(total_kb as f64 / kib_per_gib), round2(used_kb as f64 / kib_per_gib)))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── Network ─────────────────────────────────────────────────────────────────

fn parse_ip_json(out: &str) -> Result<Vec<NetworkInterface>, ProbeError> {
    let doc: Value = serde_json::from_str(out).map_err(|e| ProbeError::Unparseable(e.to_string()))?;
    let arr = doc
        .as_array()
        .ok_or_else(|| ProbeError::Unparseable("expected an array".to_string()))?;

    let mut ifaces: Vec<NetworkInterface> = arr
        .iter()
        .filter_map(|iface| {
            let name = iface["ifname"].as_str()?.to_string();
            let ip_address = iface["addr_info"].as_array().and_then(|addrs| {
                addrs
                    .iter()
                    .find(|a| a["family"].as_str() == Some("inet"))
                    .and_then(|a| a["local"].as_str())
                    .map(str::to_string)
            });
            let is_up = iface["flags"]
                .as_array()
                .map(|flags| flags.iter().any(|f| f.as_str() == Some("UP")))
                .unwrap_or(false);
            Some(NetworkInterface {
                name,
                ip_address,
                mac_address: iface["address"].as_str().filter(|s| !s.is_empty()).map(str::to_string),
                is_up,
            })
        })
        .collect();
    ifaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ifaces)
}

// ── Docker ──────────────────────────────────────────────────────────────────

fn parse_docker_version(out: &str) -> Result<Option<String>, ProbeError> {
    let json: Value = serde_json::from_str(out.trim())
        .map_err(|e| ProbeError::Unparseable(format!("docker version JSON: {}", e)))?;
    let server = json["Server"]["Version"].as_str();
    let client = json["Client"]["Version"].as_str();
    Ok(server.or(client).and_then(non_empty))
}

// ── 工具 ────────────────────────────────────────────────────────────────────

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::channel::fake::ScriptedChannel;

    const OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nNAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nVERSION=\"12 (bookworm)\"\n";
    const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n";
    const DF: &str = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n/dev/sda1        104857600  52428800  52428800      50% /\n";
    const IP: &str = r#"[{"ifname":"lo","flags":["LOOPBACK","UP"],"address":"00:00:00:00:00:00","addr_info":[{"family":"inet","local":"127.0.0.1"}]},
                         {"ifname":"eth0","flags":["BROADCAST","UP"],"address":"52:54:00:12:34:56","addr_info":[{"family":"inet6","local":"fe80::1"},{"family":"inet","local":"10.0.0.5"}]},
                         {"ifname":"tailscale0","flags":["POINTOPOINT"],"addr_info":[]}]"#;

    fn full_host() -> ScriptedChannel {
        ScriptedChannel::new()
            .ok("cat /proc/sys/kernel/hostname", "web-1\n")
            .ok("cat /etc/os-release", OS_RELEASE)
            .ok("uname -rm", "6.1.0-18-amd64 x86_64\n")
            .ok("cat /proc/cpuinfo", "processor\t: 0\nmodel name\t: AMD Ryzen 5 5600G\nprocessor\t: 1\nmodel name\t: AMD Ryzen 5 5600G\n")
            .ok("cat /proc/meminfo", MEMINFO)
            .ok("cat /proc/loadavg", "0.52 0.61 0.70 2/512 12345\n")
            .ok("cat /proc/uptime", "86400.55 170000.00\n")
            .ok("df -Pk /", DF)
            .ok("ip -j addr show", IP)
            .ok("docker version --format '{{json .}}'", r#"{"Client":{"Version":"24.0.7"},"Server":{"Version":"24.0.6"}}"#)
            .ok("docker compose version --short", "2.24.5\n")
    }

    #[tokio::test]
    async fn collects_every_fact() {
        let res = probe(&full_host(), Duration::from_secs(1)).await.unwrap();
        let f = res.value;
        assert!(res.warnings.is_empty(), "{:?}", res.warnings);
        assert_eq!(f.reported_hostname.as_deref(), Some("web-1"));
        assert_eq!(f.os_name.as_deref(), Some("Debian GNU/Linux"));
        assert_eq!(f.os_version.as_deref(), Some("12 (bookworm)"));
        assert_eq!(f.kernel_version.as_deref(), Some("6.1.0-18-amd64"));
        assert_eq!(f.architecture.as_deref(), Some("x86_64"));
        assert_eq!(f.cpu_model.as_deref(), Some("AMD Ryzen 5 5600G"));
        assert_eq!(f.cpu_cores, Some(2));
        assert_eq!(f.memory_total_mb, Some(16000));
        assert_eq!(f.memory_used_mb, Some(8000));
        assert_eq!(f.memory_percent(), Some(50.0));
        assert_eq!(f.disk_total_gb, Some(100.0));
        assert_eq!(f.disk_percent(), Some(50.0));
        assert_eq!(f.load_average, Some([0.52, 0.61, 0.70]));
        assert_eq!(f.uptime_seconds, Some(86400));
        assert_eq!(f.docker_version.as_deref(), Some("24.0.6"));
        assert_eq!(f.compose_version.as_deref(), Some("2.24.5"));

        let names: Vec<_> = f.interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "lo", "tailscale0"]);
        assert_eq!(f.interfaces[0].ip_address.as_deref(), Some("10.0.0.5"));
        assert!(!f.interfaces[2].is_up);
    }

    #[tokio::test]
    async fn missing_tools_degrade_to_warnings() {
        // no docker, no ip, garbage loadavg
        let ch = ScriptedChannel::new()
            .ok("cat /etc/os-release", OS_RELEASE)
            .ok("cat /proc/loadavg", "n/a\n");
        let res = probe(&ch, Duration::from_secs(1)).await.unwrap();
        assert_eq!(res.value.os_name.as_deref(), Some("Debian GNU/Linux"));
        assert_eq!(res.value.docker_version, None);
        assert_eq!(res.value.load_average, None);
        assert!(res.warnings.iter().any(|w| w.starts_with("docker version:")));
        assert!(res.warnings.iter().any(|w| w.starts_with("loadavg: cannot parse")));
    }

    #[tokio::test]
    async fn channel_failure_aborts_host_facts() {
        let ch = ScriptedChannel::failing(ProbeError::Connection("refused".into()));
        let err = probe(&ch, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transient());
        // stops at the first query
        assert_eq!(ch.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn docker_version_falls_back_to_client() {
        let v = parse_docker_version(r#"{"Client":{"Version":"25.0.1"},"Server":null}"#).unwrap();
        assert_eq!(v.as_deref(), Some("25.0.1"));
        assert!(parse_docker_version("Cannot connect to the Docker daemon").is_err());
    }

    #[test]
    fn meminfo_without_available_uses_free_plus_cache() {
        let s = "MemTotal: 2048000 kB\nMemFree: 512000 kB\nBuffers: 0 kB\nCached: 512000 kB\n";
        assert_eq!(parse_meminfo(s), Some((2000, 1000)));
    }

    #[test]
    fn os_release_prefers_version_and_falls_back_to_id() {
        let os = parse_os_release("NAME=Alpine Linux\nVERSION_ID=3.19.1\n");
        assert_eq!(os.version.as_deref(), Some("3.19.1"));
        assert_eq!(os.pretty, None);
    }
}
