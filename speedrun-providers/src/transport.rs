use anyhow::{anyhow, Result};
use async_trait::async_trait;
use speedrun_common::Endpoint;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A remote command whose output is consumed while it runs.
///
/// `lines` yields stdout lines as they arrive and closes when the remote
/// side closes the stream; `exit` then resolves to the exit status.
pub struct RemoteProcess {
    pub lines: mpsc::Receiver<String>,
    pub exit: JoinHandle<Result<i32>>,
}

impl RemoteProcess {
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn wait(self) -> Result<i32> {
        self.exit
            .await
            .map_err(|e| anyhow!("remote process task failed: {}", e))?
    }
}

/// A live shell + file-transfer connection to one host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command to completion and capture its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Run a command under a pseudo-terminal so output is line-buffered,
    /// returning before it finishes.
    async fn exec_streaming(&self, command: &str) -> Result<RemoteProcess>;

    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    async fn get(&self, remote: &str, local: &Path) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteSession>>;
}
