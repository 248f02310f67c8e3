//! Remote execution layer.
//!
//! Pluggable drivers for the three host flavours the agent manages:
//! Linux/PodNet over SSH, Windows over WinRM, and a mock for tests. The
//! worker layer is generic over [`Remote`] (run a script, collect output)
//! and, where artifacts are staged on the host itself, [`FileTransfer`].
//!
//! Success is never judged by exit code here: the remote scripts compose
//! many commands and assert their own status with an explicit echo that the
//! workers match against stdout.

use std::fmt;

pub mod mock;
pub mod ssh;
pub mod winrm;

pub use ssh::LinuxSsh;
pub use winrm::WindowsWinRm;

/// Marker prefix PowerShell puts on serialized stderr; its presence means
/// the stderr stream is progress chatter, not a real error.
const CLIXML_MARKER: &str = "#< CLIXML";

#[derive(Debug)]
pub enum ExecError {
    /// Connect errors, protocol errors and timeouts on the SSH channel all
    /// surface as one failure class.
    Ssh(String),
    WinRm(String),
}

impl ExecError {
    /// The failure-reason tag recorded in traces and logs.
    pub fn class(&self) -> &'static str {
        match self {
            ExecError::Ssh(_) => "ssh_error",
            ExecError::WinRm(_) => "winrm_error",
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Ssh(msg) => write!(f, "ssh error: {msg}"),
            ExecError::WinRm(msg) => write!(f, "winrm error: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Collected output of one remote script.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// The stderr content that should be treated as an actual error, if
    /// any. Empty streams and CLIXML-framed PowerShell chatter are not
    /// errors.
    pub fn real_stderr(&self) -> Option<&str> {
        let trimmed = self.stderr.trim();
        if trimmed.is_empty() || self.stderr.contains(CLIXML_MARKER) {
            None
        } else {
            Some(trimmed)
        }
    }
}

/// A connected remote host that can run a script.
pub trait Remote {
    fn exec_script(&self, script: &str) -> impl Future<Output = Result<ExecOutput>> + Send;

    /// Failure class for this transport, used in traces when the transport
    /// itself fails.
    fn failure_class(&self) -> &'static str;
}

/// Hosts where the agent stages files directly (PodNet, KVM hypervisors).
pub trait FileTransfer {
    fn put_file(&self, path: &str, contents: &str) -> impl Future<Output = Result<()>> + Send;

    fn file_exists(&self, path: &str) -> impl Future<Output = Result<bool>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stderr_is_not_an_error() {
        let output = ExecOutput { stdout: "ok".into(), stderr: "  \n".into() };
        assert!(output.real_stderr().is_none());
    }

    #[test]
    fn clixml_stderr_is_not_an_error() {
        let output = ExecOutput {
            stdout: String::new(),
            stderr: "#< CLIXML\r\n<Objs Version=\"1.1.0.1\"><S S=\"progress\">x</S></Objs>".into(),
        };
        assert!(output.real_stderr().is_none());
    }

    #[test]
    fn plain_stderr_is_an_error() {
        let output = ExecOutput { stdout: String::new(), stderr: "bash: boom\n".into() };
        assert_eq!(output.real_stderr(), Some("bash: boom"));
    }
}
