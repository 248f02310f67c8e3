//! SSH driver for Linux hypervisors and the PodNet appliance.
//!
//! Hosts are addressed by stable per-region IPv6 and trusted, so unknown
//! host keys are accepted. Authentication is the fixed RSA key; there is no
//! interactive password. Output is collected in coarse polling waves (15 s,
//! 64 bytes) so long-running builds that trickle output do not starve the
//! reader.

use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{ExecError, ExecOutput, FileTransfer, Remote, Result};

/// Username on hypervisor hosts.
pub const HYPERVISOR_USER: &str = "administrator";
/// Username on the PodNet appliance.
pub const PODNET_USER: &str = "robot";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_WAVE: Duration = Duration::from_secs(15);
const READ_CHUNK: usize = 64;

/// Read a channel to EOF in waves, sleeping `wave` between reads of at most
/// `chunk` bytes.
pub(crate) async fn read_in_waves<R>(
    reader: Option<R>,
    wave: Duration,
    chunk: usize,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut collected: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        tokio::time::sleep(wave).await;
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

pub struct LinuxSsh {
    session: Session,
    host: String,
    wave: Duration,
}

impl LinuxSsh {
    /// Connect to `[host]:22` over IPv6 with the region key.
    pub async fn connect(host: &str, username: &str, key_path: &str) -> Result<Self> {
        let mut builder = SessionBuilder::default();
        builder
            .user(username.to_string())
            .port(22)
            .keyfile(key_path)
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(CONNECT_TIMEOUT);
        let session = builder
            .connect(format!("[{host}]"))
            .await
            .map_err(|err| ExecError::Ssh(format!("connect to {host} failed: {err}")))?;
        debug!(host, username, "ssh session established");
        Ok(Self {
            session,
            host: host.to_string(),
            wave: READ_WAVE,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Remote for LinuxSsh {
    async fn exec_script(&self, script: &str) -> Result<ExecOutput> {
        debug!(host = %self.host, "deploying script over ssh");
        let mut child = self
            .session
            .command("bash")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|err| ExecError::Ssh(format!("exec on {} failed: {err}", self.host)))?;

        let stdout = child.stdout().take();
        let stderr = child.stderr().take();
        let (stdout, stderr) = tokio::join!(
            read_in_waves(stdout, self.wave, READ_CHUNK),
            read_in_waves(stderr, self.wave, READ_CHUNK),
        );
        let stdout = stdout.map_err(|err| ExecError::Ssh(format!("reading stdout: {err}")))?;
        let stderr = stderr.map_err(|err| ExecError::Ssh(format!("reading stderr: {err}")))?;

        child
            .wait()
            .await
            .map_err(|err| ExecError::Ssh(format!("waiting for script on {}: {err}", self.host)))?;

        Ok(ExecOutput { stdout, stderr })
    }

    fn failure_class(&self) -> &'static str {
        "ssh_error"
    }
}

impl FileTransfer for LinuxSsh {
    async fn put_file(&self, path: &str, contents: &str) -> Result<()> {
        debug!(host = %self.host, path, "writing remote file");
        let mut child = self
            .session
            .command("sh")
            .arg("-c")
            .arg(format!("cat > '{path}'"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|err| ExecError::Ssh(format!("open {path} on {}: {err}", self.host)))?;

        let mut stdin = child
            .stdin()
            .take()
            .ok_or_else(|| ExecError::Ssh(format!("no stdin channel for {path}")))?;
        stdin
            .write_all(contents.as_bytes())
            .await
            .map_err(|err| ExecError::Ssh(format!("writing {path}: {err}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|err| ExecError::Ssh(format!("closing {path}: {err}")))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|err| ExecError::Ssh(format!("waiting on write of {path}: {err}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Ssh(format!("write of {path} exited with {status}")))
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let status = self
            .session
            .command("test")
            .arg("-f")
            .arg(path)
            .status()
            .await
            .map_err(|err| ExecError::Ssh(format!("stat of {path} on {}: {err}", self.host)))?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_in_waves_collects_to_eof() {
        let data = b"Domain creation completed for 12_42".to_vec();
        let reader = std::io::Cursor::new(data.clone());
        let collected = read_in_waves(Some(reader), Duration::ZERO, 8).await.unwrap();
        assert_eq!(collected.as_bytes(), &data[..]);
    }

    #[tokio::test]
    async fn read_in_waves_handles_missing_channel() {
        let collected = read_in_waves(None::<std::io::Cursor<Vec<u8>>>, Duration::ZERO, 64)
            .await
            .unwrap();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn read_in_waves_chunks_do_not_split_utf8_result() {
        // Chunk boundary lands mid-codepoint; the join must still be lossless
        // because decoding happens once at the end.
        let data = "éêëæøå output done".as_bytes().to_vec();
        let reader = std::io::Cursor::new(data.clone());
        let collected = read_in_waves(Some(reader), Duration::ZERO, 3).await.unwrap();
        assert_eq!(collected, "éêëæøå output done");
    }
}
