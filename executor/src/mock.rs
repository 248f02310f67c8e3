//! Mock remote driver for unit testing the worker layer.
//!
//! Records every script and file write so tests can assert on the sequence
//! of remote operations, serves canned outputs per call, and injects
//! failures on demand. No sockets, no processes.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::{ExecError, ExecOutput, FileTransfer, Remote, Result};

/// Controls what the mock does. All defaults are success with empty output.
#[derive(Debug, Clone, Default)]
pub struct MockRemoteConfig {
    /// If set, every `exec_script` returns this error message
    pub exec_error: Option<String>,
    /// If set, every `put_file` returns this error message
    pub put_error: Option<String>,
    /// Paths `file_exists` reports as present
    pub existing_files: HashSet<String>,
}

/// Shared recorder of what was called, cloneable into assertions.
#[derive(Debug, Clone, Default)]
pub struct MockCallTracker {
    scripts: Arc<Mutex<Vec<String>>>,
    files: Arc<Mutex<Vec<(String, String)>>>,
    existence_checks: Arc<Mutex<Vec<String>>>,
}

impl MockCallTracker {
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn script_count(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }

    pub fn files(&self) -> Vec<(String, String)> {
        self.files.lock().unwrap().clone()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn existence_checks(&self) -> Vec<String> {
        self.existence_checks.lock().unwrap().clone()
    }
}

pub struct MockRemote {
    tracker: MockCallTracker,
    config: MockRemoteConfig,
    /// Outputs served to successive `exec_script` calls; once drained,
    /// further calls get empty output.
    responses: Arc<Mutex<VecDeque<ExecOutput>>>,
}

impl MockRemote {
    pub fn new() -> (Self, MockCallTracker) {
        Self::with_config(MockRemoteConfig::default())
    }

    pub fn with_config(config: MockRemoteConfig) -> (Self, MockCallTracker) {
        let tracker = MockCallTracker::default();
        let mock = Self {
            tracker: tracker.clone(),
            config,
            responses: Arc::new(Mutex::new(VecDeque::new())),
        };
        (mock, tracker)
    }

    /// Queue the output for the next unanswered `exec_script` call.
    pub fn push_output(&self, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push_back(ExecOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }
}

impl Remote for MockRemote {
    async fn exec_script(&self, script: &str) -> Result<ExecOutput> {
        self.tracker.scripts.lock().unwrap().push(script.to_string());
        if let Some(ref msg) = self.config.exec_error {
            return Err(ExecError::Ssh(msg.clone()));
        }
        Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn failure_class(&self) -> &'static str {
        "ssh_error"
    }
}

impl FileTransfer for MockRemote {
    async fn put_file(&self, path: &str, contents: &str) -> Result<()> {
        if let Some(ref msg) = self.config.put_error {
            return Err(ExecError::Ssh(msg.clone()));
        }
        self.tracker
            .files
            .lock()
            .unwrap()
            .push((path.to_string(), contents.to_string()));
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.tracker.existence_checks.lock().unwrap().push(path.to_string());
        Ok(self.config.existing_files.contains(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_scripts_and_serves_canned_output() {
        let (mock, tracker) = MockRemote::new();
        mock.push_output("Domain creation completed", "");
        let output = mock.exec_script("virsh define ...").await.unwrap();
        assert_eq!(output.stdout, "Domain creation completed");
        assert_eq!(tracker.scripts(), vec!["virsh define ...".to_string()]);

        // Drained queue falls back to empty output
        let output = mock.exec_script("echo").await.unwrap();
        assert!(output.stdout.is_empty());
        assert_eq!(tracker.script_count(), 2);
    }

    #[tokio::test]
    async fn injected_exec_failure() {
        let (mock, tracker) = MockRemote::with_config(MockRemoteConfig {
            exec_error: Some("connection reset".to_string()),
            ..Default::default()
        });
        let err = mock.exec_script("echo hi").await.unwrap_err();
        assert_eq!(err.class(), "ssh_error");
        assert_eq!(tracker.script_count(), 1);
    }

    #[tokio::test]
    async fn tracks_file_writes_and_existence() {
        let mut config = MockRemoteConfig::default();
        config.existing_files.insert("/etc/netplan/55-config.yaml".to_string());
        let (mock, tracker) = MockRemote::with_config(config);

        assert!(mock.file_exists("/etc/netplan/55-config.yaml").await.unwrap());
        assert!(!mock.file_exists("/etc/netplan/77-config.yaml").await.unwrap());

        mock.put_file("/home/robot/P9_firewall.nft", "table inet P9 {}").await.unwrap();
        assert_eq!(tracker.file_paths(), vec!["/home/robot/P9_firewall.nft".to_string()]);
        assert_eq!(tracker.existence_checks().len(), 2);
    }
}
