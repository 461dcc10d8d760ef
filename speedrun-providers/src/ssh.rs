use crate::transport::{ExecOutput, RemoteProcess, RemoteSession, RemoteTransport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use speedrun_common::Endpoint;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Transport over the OpenSSH client binaries.
///
/// `connect` opens a ControlMaster connection; every later `ssh`/`scp` call of
/// the session is multiplexed over it, and `close` tears the master down.
pub struct SshTransport {
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
    ssh_bin: String,
    scp_bin: String,
}

impl SshTransport {
    pub fn new(user: String, identity_file: Option<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            user,
            identity_file,
            connect_timeout,
            ssh_bin: "ssh".to_string(),
            scp_bin: "scp".to_string(),
        }
    }
}

pub struct SshSession {
    target: String,
    port: u16,
    control_path: PathBuf,
    identity_file: Option<PathBuf>,
    ssh_bin: String,
    scp_bin: String,
    closed: AtomicBool,
    // Holds the control socket; removed when the session is dropped.
    _control_dir: tempfile::TempDir,
}

/// Options shared by every ssh/scp invocation. Instances are ephemeral, so
/// host keys are neither checked nor remembered.
fn base_options(control_path: &Path, identity_file: Option<&Path>) -> Vec<String> {
    let mut opts = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
    ];
    if let Some(key) = identity_file {
        opts.push("-i".to_string());
        opts.push(key.display().to_string());
    }
    opts
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteSession>> {
        let control_dir = tempfile::Builder::new()
            .prefix("speedrun-ssh-")
            .tempdir()
            .context("failed to create ssh control directory")?;
        let control_path = control_dir.path().join("ctl");
        // The backgrounded master inherits stderr, so it goes to a file rather than a pipe.
        let connect_log = control_dir.path().join("connect.log");
        let log_file = std::fs::File::create(&connect_log).context("failed to create ssh connect log")?;
        let target = format!("{}@{}", self.user, endpoint.host);

        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(base_options(&control_path, self.identity_file.as_deref()))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-p")
            .arg(endpoint.port.to_string())
            .arg("-N")
            .arg("-f")
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.ssh_bin))?;

        // `-f` makes ssh return once authenticated; allow a margin over ConnectTimeout.
        let deadline = self.connect_timeout + Duration::from_secs(15);
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(res) => res?,
            Err(_) => anyhow::bail!(
                "ssh connection to {} timed out after {}s",
                endpoint,
                deadline.as_secs()
            ),
        };
        if !status.success() {
            let diag = tokio::fs::read_to_string(&connect_log).await.unwrap_or_default();
            anyhow::bail!(
                "ssh connection to {} failed ({}): {}",
                endpoint,
                status,
                diag.trim()
            );
        }

        tracing::debug!(endpoint = %endpoint, control = %control_path.display(), "ssh master connected");

        Ok(Box::new(SshSession {
            target,
            port: endpoint.port,
            control_path,
            identity_file: self.identity_file.clone(),
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            closed: AtomicBool::new(false),
            _control_dir: control_dir,
        }))
    }
}

impl SshSession {
    fn ssh_command(&self, tty: bool, command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(base_options(&self.control_path, self.identity_file.as_deref()));
        if tty {
            cmd.arg("-tt");
        }
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg(&self.target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn scp(&self, from: &str, to: &str) -> Result<()> {
        let output = Command::new(&self.scp_bin)
            .args(base_options(&self.control_path, self.identity_file.as_deref()))
            .arg("-q")
            .arg("-P")
            .arg(self.port.to_string())
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.scp_bin))?;
        if !output.status.success() {
            anyhow::bail!(
                "scp {} -> {} failed ({}): {}",
                from,
                to,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn remote_spec(&self, remote: &str) -> String {
        format!("{}:{}", self.target, remote)
    }

    fn exit_master_blocking(&self) {
        let _ = std::process::Command::new(&self.ssh_bin)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = self
            .ssh_command(false, command)
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.ssh_bin))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn exec_streaming(&self, command: &str) -> Result<RemoteProcess> {
        let mut cmd = self.ssh_command(true, command);
        // With -tt remote stderr arrives on the pty; only local ssh diagnostics remain.
        cmd.stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.ssh_bin))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ssh stdout not captured"))?;

        let (tx, rx) = mpsc::channel(256);
        let exit = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                // Pseudo-terminals terminate lines with CRLF.
                let line = line.trim_end_matches('\r').to_string();
                if tx.send(line).await.is_err() {
                    // Receiver gone; keep draining so the remote side is not blocked.
                    continue;
                }
            }
            drop(tx);
            let status = child.wait().await?;
            Ok::<i32, anyhow::Error>(status.code().unwrap_or(-1))
        });

        Ok(RemoteProcess { lines: rx, exit })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.scp(&local.display().to_string(), &self.remote_spec(remote))
            .await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.scp(&self.remote_spec(remote), &local.display().to_string())
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let output = Command::new(&self.ssh_bin)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to spawn '{}'", self.ssh_bin))?;
        if !output.status.success() {
            anyhow::bail!(
                "closing ssh master for {} failed: {}",
                self.target,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // ControlPersist=yes keeps the master alive until told to exit.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.exit_master_blocking();
        }
    }
}
