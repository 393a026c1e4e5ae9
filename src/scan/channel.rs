//! 执行通道
//! 本地：直接读文件 + `sh -c`；远程：每条命令一次 `ssh` 往返
//! 每次调用自带超时，超时即杀掉子进程

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::Host;
use crate::scan::probe::ProbeError;

#[async_trait]
pub trait ExecChannel: Send + Sync {
    /// Human label used in log lines.
    fn describe(&self) -> String;

    /// Run one read-only command and return its stdout.
    async fn exec(&self, command: &str, deadline: Duration) -> Result<String, ProbeError>;

    async fn read_file(&self, path: &str, deadline: Duration) -> Result<String, ProbeError> {
        self.exec(&format!("cat {}", shell_words::quote(path)), deadline).await
    }
}

/// Picks the channel that serves a host.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, host: &Host) -> Arc<dyn ExecChannel>;
}

// ── 本地通道 ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct LocalChannel;

#[async_trait]
impl ExecChannel for LocalChannel {
    fn describe(&self) -> String {
        "local".to_string()
    }

    async fn exec(&self, command: &str, deadline: Duration) -> Result<String, ProbeError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_bounded(cmd, command, deadline).await.and_then(|out| {
            into_stdout(command, out, |code, stderr, stdout| ProbeError::Command {
                command: command.to_string(),
                code,
                stderr,
                stdout,
            })
        })
    }

    async fn read_file(&self, path: &str, deadline: Duration) -> Result<String, ProbeError> {
        match tokio::time::timeout(deadline, tokio::fs::read_to_string(path)).await {
            Err(_) => Err(ProbeError::Timeout(deadline)),
            Ok(Ok(s)) => Ok(s),
            Ok(Err(e)) => Err(ProbeError::Command {
                command: format!("read {}", path),
                code: e.raw_os_error(),
                stderr: e.to_string(),
                stdout: String::new(),
            }),
        }
    }
}

// ── SSH 通道 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SshChannel {
    pub target: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshChannel {
    pub fn for_host(host: &Host, connect_timeout: Duration) -> Option<Self> {
        let ssh = host.ssh.as_ref()?;
        Some(Self {
            target: host.remote_address().to_string(),
            user: ssh.user.clone(),
            port: ssh.port,
            key_path: ssh.key_path.clone(),
            connect_timeout,
        })
    }

    fn args(&self, command: &str) -> Vec<String> {
        // host keys stay under the user's ssh configuration; BatchMode refuses unknown ones
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.user, self.target));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl ExecChannel for SshChannel {
    fn describe(&self) -> String {
        format!("ssh {}@{}:{}", self.user, self.target, self.port)
    }

    async fn exec(&self, command: &str, deadline: Duration) -> Result<String, ProbeError> {
        if let Some(key) = &self.key_path {
            if !key.exists() {
                return Err(ProbeError::Config(format!("key file {} does not exist", key.display())));
            }
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.args(command));
        let out = run_bounded(cmd, command, deadline).await?;
        into_stdout(command, out, |code, stderr, stdout| {
            // ssh reserves 255 for its own failures
            if code == Some(255) {
                classify_ssh_failure(&stderr)
            } else {
                ProbeError::Command { command: command.to_string(), code, stderr, stdout }
            }
        })
    }
}

pub fn classify_ssh_failure(stderr: &str) -> ProbeError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("ssh failed")
        .to_string();

    if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
    {
        ProbeError::Auth(detail)
    } else if lower.contains("connection timed out") || lower.contains("operation timed out") {
        ProbeError::Connection(detail)
    } else if lower.contains("bad configuration option") || lower.contains("load key") {
        ProbeError::Config(detail)
    } else {
        ProbeError::Connection(detail)
    }
}

// ── 默认通道工厂 ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DefaultChannels {
    local_hostname: String,
    connect_timeout: Duration,
}

impl DefaultChannels {
    pub fn new(connect_timeout: Duration) -> Self {
        let local_hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { local_hostname, connect_timeout }
    }
}

impl ChannelFactory for DefaultChannels {
    fn open(&self, host: &Host) -> Arc<dyn ExecChannel> {
        if host.is_local(&self.local_hostname) {
            return Arc::new(LocalChannel);
        }
        match SshChannel::for_host(host, self.connect_timeout) {
            Some(ssh) => Arc::new(ssh),
            None => Arc::new(LocalChannel),
        }
    }
}

// ── 进程执行 ────────────────────────────────────────────────────────────────

async fn run_bounded(
    mut cmd: Command,
    label: &str,
    deadline: Duration,
) -> Result<std::process::Output, ProbeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = label, ?deadline, "exec");
    let child = cmd
        .spawn()
        .map_err(|e| ProbeError::Connection(format!("cannot spawn for `{}`: {}", label, e)))?;

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Err(_) => Err(ProbeError::Timeout(deadline)),
        Ok(Err(e)) => Err(ProbeError::Connection(format!("`{}` failed: {}", label, e))),
        Ok(Ok(out)) => Ok(out),
    }
}

fn into_stdout(
    command: &str,
    out: std::process::Output,
    on_failure: impl FnOnce(Option<i32>, String, String) -> ProbeError,
) -> Result<String, ProbeError> {
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    if out.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    debug!(command, code = ?out.status.code(), %stderr, "command failed");
    Err(on_failure(out.status.code(), stderr, stdout))
}

// ── 测试用脚本通道 ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Addresses, SshCredential};
    use crate::utils::{Criticality, HostRole};

    fn remote_host() -> Host {
        Host {
            name: "db-1".into(),
            hostname: "db-1.lan".into(),
            addresses: Addresses { local: Some("10.0.0.7".into()), vpn: None, public: None },
            ssh: Some(SshCredential { user: "ops".into(), port: 2222, key_path: None }),
            role: HostRole::PrimaryServer,
            criticality: Criticality::Critical,
        }
    }

    #[test]
    fn builds_batch_mode_ssh_invocation() {
        let ch = SshChannel::for_host(&remote_host(), Duration::from_secs(7)).unwrap();
        let args = ch.args("uname -rm");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("StrictHostKeyChecking")));
        assert_eq!(&args[args.len() - 3..], ["ops@10.0.0.7", "--", "uname -rm"]);
    }

    #[test]
    fn classifies_ssh_stderr() {
        assert!(matches!(
            classify_ssh_failure("ops@db: Permission denied (publickey).\n"),
            ProbeError::Auth(_)
        ));
        assert!(matches!(
            classify_ssh_failure("ssh: connect to host db port 22: Connection refused"),
            ProbeError::Connection(_)
        ));
        assert!(classify_ssh_failure("ssh: connect to host db port 22: Connection timed out").is_transient());
    }

    #[tokio::test]
    async fn missing_key_file_is_a_config_error() {
        let mut host = remote_host();
        host.ssh.as_mut().unwrap().key_path = Some(PathBuf::from("/nonexistent/fleetscan/key"));
        let ch = SshChannel::for_host(&host, Duration::from_secs(1)).unwrap();
        let err = ch.exec("true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn local_channel_runs_commands_and_reads_files() {
        let ch = LocalChannel;
        let out = ch.exec("echo fleet", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.trim(), "fleet");

        let err = ch.exec("exit 3", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Command { code: Some(3), .. }));

        // output printed before a failing exit is kept on the error
        let err = ch.exec("echo partial; exit 1", Duration::from_secs(5)).await.unwrap_err();
        match err {
            ProbeError::Command { code, stdout, .. } => {
                assert_eq!(code, Some(1));
                assert_eq!(stdout, "partial\n");
            }
            other => panic!("expected a command error, got {:?}", other),
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(&path, "NAME=Debian\n").unwrap();
        let text = ch.read_file(path.to_str().unwrap(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(text, "NAME=Debian\n");
    }

    #[tokio::test]
    async fn local_channel_enforces_deadline() {
        let err = LocalChannel
            .exec("sleep 5", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_millis(50)));
    }
}
