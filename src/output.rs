//! 输出层：接收快照与变更列表，渲染 text 或 json

use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write as _;

use crate::config::Config;
use crate::diff::{Change, ChangeSummary, Severity};
use crate::pipeline::{Comparison, CycleReport, CycleSink};
use crate::scan::{HostFacts, Service, Snapshot};
use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Prints every finished cycle to stdout.
pub struct ConsoleSink {
    pub format: OutputFormat,
    pub verbose: bool,
}

impl CycleSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn publish(&self, snapshot: &Snapshot, changes: &[Change], summary: &ChangeSummary) -> Result<()> {
        let out = match self.format {
            OutputFormat::Json => render_json(snapshot, changes, summary)?,
            OutputFormat::Text => {
                let mut s = render_snapshot(snapshot, self.verbose);
                s.push_str(&render_changes(changes, summary));
                s
            }
        };
        println!("{}", out);
        Ok(())
    }
}

/// One line saying how a finished cycle went.
pub fn cycle_outcome(report: &CycleReport) -> String {
    if !report.snapshot.complete {
        return "Scan cancelled: partial snapshot was neither compared nor saved".to_string();
    }
    if report.first_run {
        return "First snapshot, nothing to compare against".to_string();
    }
    match report.summary.highest_severity() {
        Some(worst) => format!(
            "{} changes since the previous snapshot (highest severity: {})",
            report.changes.len(),
            worst
        ),
        None => "No changes since the previous snapshot".to_string(),
    }
}

#[derive(Serialize)]
struct CycleView<'a> {
    snapshot: &'a Snapshot,
    changes: &'a [Change],
    summary: &'a ChangeSummary,
}

pub fn render_json(snapshot: &Snapshot, changes: &[Change], summary: &ChangeSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(&CycleView { snapshot, changes, summary })?)
}

pub fn display_comparison(cmp: &Comparison, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct ComparisonView<'a> {
                current: chrono::DateTime<chrono::Utc>,
                previous: Option<chrono::DateTime<chrono::Utc>>,
                changes: &'a [Change],
                summary: &'a ChangeSummary,
            }
            let view = ComparisonView {
                current: cmp.current.timestamp,
                previous: cmp.previous.as_ref().map(|p| p.timestamp),
                changes: &cmp.changes,
                summary: &cmp.summary,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        OutputFormat::Text => {
            let mut s = String::new();
            let _ = writeln!(s, "  Current      : {}", cmp.current.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
            match &cmp.previous {
                Some(p) => {
                    let _ = writeln!(s, "  Previous     : {}", p.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
                }
                None => {
                    let _ = writeln!(s, "  Previous     : (none, nothing to compare)");
                }
            }
            s.push_str(&render_changes(&cmp.changes, &cmp.summary));
            println!("{}", s);
        }
    }
    Ok(())
}

pub fn display_config(config: &Config) {
    print_section(&format!("HOSTS ({})", config.hosts.len()));
    for h in &config.hosts {
        let channel = match &h.ssh {
            Some(ssh) => format!("ssh {}@{}:{}", ssh.user, h.remote_address(), ssh.port),
            None => "local".to_string(),
        };
        println!("  {:<16} {:<18} {:<12} {}", h.name, h.role, h.criticality, channel);
    }

    print_section("SCANNING");
    let s = &config.scanning;
    let enabled: Vec<String> = s.enabled.iter().map(|c| c.to_string()).collect();
    println!("  Categories   : {}", enabled.join(", "));
    println!(
        "  Timeouts     : connect {}s  host_facts {}s  containers {}s  compose_files {}s",
        s.timeouts.connect.as_secs(),
        s.timeouts.host_facts.as_secs(),
        s.timeouts.containers.as_secs(),
        s.timeouts.compose_files.as_secs()
    );
    println!(
        "  Retries      : {} attempts  x{} backoff from {}ms",
        s.retries.max_attempts,
        s.retries.backoff_multiplier,
        s.retries.initial_backoff.as_millis()
    );
    println!("  Parallelism  : {} hosts", s.max_parallel_hosts);
    if !s.compose_paths.is_empty() {
        println!("  Compose      : {}", s.compose_paths.join(", "));
    }
    let retention = config
        .storage
        .retention_days
        .map(|d| format!("  (keep {} days)", d))
        .unwrap_or_default();
    println!("  Storage      : {}{}", config.storage.dir.display(), retention);
}

// ── Text ────────────────────────────────────────────────────────────────────

pub fn render_snapshot(s: &Snapshot, verbose: bool) -> String {
    let mut out = String::new();
    section(&mut out, "SNAPSHOT");
    let _ = writeln!(out, "  Taken at     : {}", s.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    let incomplete = if s.complete { "" } else { "  ⚠ incomplete (cancelled)" };
    let _ = writeln!(out, "  Duration     : {:.1}s{}", s.scan_duration_seconds, incomplete);
    let _ = writeln!(out, "  Servers      : {} ({} reachable)", s.total_servers, s.reachable_servers());
    let _ = writeln!(out, "  Services     : {}", s.total_services);
    let _ = writeln!(out, "  Containers   : {} total  {} running", s.total_containers, s.running_containers);

    section(&mut out, &format!("SERVERS ({})", s.servers.len()));
    for h in &s.servers {
        render_host(&mut out, h, verbose);
    }

    section(&mut out, &format!("SERVICES ({})", s.services.len()));
    for svc in &s.services {
        render_service(&mut out, svc, verbose);
    }

    if !s.scan_errors.is_empty() {
        section(&mut out, &format!("ERRORS ({})", s.scan_errors.len()));
        for e in &s.scan_errors {
            let _ = writeln!(out, "  ✗ {}", e);
        }
    }
    if verbose && !s.scan_warnings.is_empty() {
        section(&mut out, &format!("WARNINGS ({})", s.scan_warnings.len()));
        for w in &s.scan_warnings {
            let _ = writeln!(out, "  ⚠ {}", w);
        }
    }
    out
}

fn render_host(out: &mut String, h: &HostFacts, verbose: bool) {
    let icon = if h.reachable { "●" } else { "○" };
    let f = &h.system;
    let unreachable = if h.reachable { "" } else { "  ⚠ unreachable" };
    let _ = writeln!(out, "  {} {} [{}, {}]{}", icon, h.name, h.role, h.criticality, unreachable);
    let os = f.os_pretty.as_deref().or(f.os_name.as_deref()).unwrap_or("unknown");
    let _ = writeln!(out, "      OS         : {}  kernel {}", os, or_unknown(&f.kernel_version));
    let _ = writeln!(
        out,
        "      Docker     : {}  compose {}",
        or_unknown(&f.docker_version),
        or_unknown(&f.compose_version)
    );

    if let (Some(model), Some(cores)) = (&f.cpu_model, f.cpu_cores) {
        let _ = writeln!(out, "      CPU        : {} ({} cores)", model, cores);
    }
    if let Some([l1, l5, l15]) = f.load_average {
        let _ = writeln!(out, "      Load avg   : {:.2}  {:.2}  {:.2}  (1/5/15 min)", l1, l5, l15);
    }
    if let (Some(used), Some(total), Some(pct)) = (f.memory_used_mb, f.memory_total_mb, f.memory_percent()) {
        let _ = writeln!(
            out,
            "      Memory     : {} used / {} total  ({:.1}%)",
            fmt_mb(used),
            fmt_mb(total),
            pct
        );
    }
    if let (Some(used), Some(total), Some(pct)) = (f.disk_used_gb, f.disk_total_gb, f.disk_percent()) {
        let warn = if pct > 85.0 { " ⚠" } else { "" };
        let _ = writeln!(
            out,
            "      Disk /     : {:.1}GiB used / {:.1}GiB  ({:.1}%){}",
            used, total, pct, warn
        );
    }
    if let Some(up) = f.uptime_seconds {
        let _ = writeln!(out, "      Uptime     : {}", format_uptime(up));
    }
    if verbose {
        for iface in &f.interfaces {
            let _ = writeln!(
                out,
                "      {:<10} {:<16} {}{}",
                iface.name,
                iface.ip_address.as_deref().unwrap_or("-"),
                iface.mac_address.as_deref().unwrap_or("-"),
                if iface.is_up { "" } else { "  (down)" }
            );
        }
    }
    for e in &h.scan_errors {
        let _ = writeln!(out, "      ✗ {}", e);
    }
}

fn render_service(out: &mut String, svc: &Service, verbose: bool) {
    let running = svc.running_containers();
    let icon = match running {
        0 => "○",
        n if n == svc.containers.len() => "●",
        _ => "◐",
    };
    let version = svc.version.as_deref().map(|v| format!("  v{}", v)).unwrap_or_default();
    let _ = writeln!(
        out,
        "  {} {} @ {} [{}]  {}/{} running{}",
        icon,
        svc.key(),
        svc.host,
        svc.criticality,
        running,
        svc.containers.len(),
        version
    );
    if let Some(url) = &svc.url {
        let _ = writeln!(out, "      URL        : {}", url);
    }
    if !svc.depends_on.is_empty() {
        let _ = writeln!(out, "      Depends on : {}", svc.depends_on.join(", "));
    }
    if !svc.required_by.is_empty() {
        let _ = writeln!(out, "      Needed by  : {}", svc.required_by.join(", "));
    }
    if verbose {
        if let Some(file) = &svc.compose_file {
            let _ = writeln!(out, "      Compose    : {}", file);
        }
        for c in &svc.containers {
            let _ = writeln!(
                out,
                "      - {} [{}] {}  restarts={}",
                c.name, c.state, c.image, c.restart_count
            );
        }
    }
}

pub fn render_changes(changes: &[Change], summary: &ChangeSummary) -> String {
    let mut out = String::new();
    section(&mut out, &format!("CHANGES ({})", summary.total));
    if summary.is_empty() {
        let _ = writeln!(out, "  No changes detected");
        return out;
    }
    let counts: Vec<String> = summary
        .by_severity
        .iter()
        .rev()
        .map(|(sev, n)| format!("{} {}", n, sev))
        .collect();
    let _ = writeln!(out, "  {}", counts.join("  "));
    for c in changes {
        let icon = match c.severity {
            Severity::Critical => "✗",
            Severity::Warning => "⚠",
            Severity::Info => "·",
        };
        let _ = writeln!(out, "  {} [{:<8}] {:<10} {}", icon, c.severity, c.category, c.description);
    }
    out
}

// ── 格式化工具 ───────────────────────────────────────────────────────────────

fn print_section(title: &str) {
    let mut s = String::new();
    section(&mut s, title);
    print!("{}", s);
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{}", "─".repeat(60));
    let _ = writeln!(out, "  {}", title);
    let _ = writeln!(out, "{}", "─".repeat(60));
}

fn or_unknown(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("unknown")
}

fn fmt_mb(mb: u64) -> String {
    if mb >= 1024 {
        format!("{:.1}GiB", mb as f64 / 1024.0)
    } else {
        format!("{}MiB", mb)
    }
}

fn format_uptime(seconds: u64) -> String {
    let d = seconds / 86400;
    let h = (seconds % 86400) / 3600;
    let m = (seconds % 3600) / 60;
    if d > 0 {
        format!("{}d {}h {}m", d, h, m)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m", m)
    }
}
