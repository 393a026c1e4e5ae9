//! 探针结果类型
//! 每次采集是一次有时限的尝试：带警告的结果，或一个类型化错误

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad credential: {0}")]
    Config(String),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
        /// Whatever the command printed before failing.
        stdout: String,
    },

    #[error("unparseable response: {0}")]
    Unparseable(String),

    #[error("scan cancelled")]
    Cancelled,
}

impl ProbeError {
    /// Worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Connection(_))
    }

    /// The execution channel itself failed, so the host counts as unreachable.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            ProbeError::Timeout(_)
                | ProbeError::Connection(_)
                | ProbeError::Auth(_)
                | ProbeError::Config(_)
                | ProbeError::Cancelled
        )
    }
}

/// A probe value plus the non-fatal problems met while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Partial<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Partial<T> {
    pub fn new(value: T) -> Self {
        Self { value, warnings: Vec::new() }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub type ProbeResult<T> = Result<Partial<T>, ProbeError>;

/// Soft-fail helper for optional sub-queries: channel failures stay fatal,
/// anything else is recorded and the field stays unknown.
pub fn soften<T>(
    res: Result<T, ProbeError>,
    what: &str,
    warnings: &mut Vec<String>,
) -> Result<Option<T>, ProbeError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_channel_failure() => Err(e),
        Err(e) => {
            warnings.push(format!("{}: {}", what, e));
            Ok(None)
        }
    }
}

/// Keep the output of a command that exited non-zero after printing something.
/// `docker inspect` and `find` both report what they could before failing on the rest.
pub fn salvage_stdout(res: Result<String, ProbeError>, warnings: &mut Vec<String>) -> Result<String, ProbeError> {
    match res {
        Err(ProbeError::Command { command, code, stderr, stdout }) if !stdout.trim().is_empty() => {
            let reason = if stderr.is_empty() { "no error output".to_string() } else { stderr };
            warnings.push(format!("`{}` exited with {:?}, kept partial output: {}", command, code, reason));
            Ok(stdout)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(ProbeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProbeError::Connection("refused".into()).is_transient());
        assert!(!ProbeError::Auth("denied".into()).is_transient());
        assert!(ProbeError::Auth("denied".into()).is_channel_failure());

        let cmd = ProbeError::Command {
            command: "docker ps".into(),
            code: Some(127),
            stderr: "not found".into(),
            stdout: String::new(),
        };
        assert!(!cmd.is_transient());
        assert!(!cmd.is_channel_failure());
    }

    #[test]
    fn soften_keeps_channel_failures_fatal() {
        let mut warnings = Vec::new();
        let cmd: Result<u32, _> = Err(ProbeError::Unparseable("garbage".into()));
        assert_eq!(soften(cmd, "uptime", &mut warnings), Ok(None));
        assert_eq!(warnings, vec!["uptime: unparseable response: garbage".to_string()]);

        let refused: Result<u32, _> = Err(ProbeError::Connection("refused".into()));
        assert!(soften(refused, "uptime", &mut warnings).is_err());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn salvage_keeps_partial_output_only() {
        let mut warnings = Vec::new();
        let partial = Err(ProbeError::Command {
            command: "docker inspect aaa bbb".into(),
            code: Some(1),
            stderr: "Error: No such object: bbb".into(),
            stdout: "[{\"Id\":\"aaa\"}]".into(),
        });
        assert_eq!(salvage_stdout(partial, &mut warnings).unwrap(), "[{\"Id\":\"aaa\"}]");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("No such object: bbb"));

        let empty = Err(ProbeError::Command {
            command: "docker ps".into(),
            code: Some(127),
            stderr: "not found".into(),
            stdout: "  \n".into(),
        });
        assert!(matches!(salvage_stdout(empty, &mut warnings), Err(ProbeError::Command { .. })));
        assert!(salvage_stdout(Err(ProbeError::Connection("reset".into())), &mut warnings).is_err());
        assert_eq!(warnings.len(), 1);
    }
}
