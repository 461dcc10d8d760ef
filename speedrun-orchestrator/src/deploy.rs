use anyhow::Result;
use speedrun_common::shell::{remote_parent, sh_escape_single};
use speedrun_common::{Instance, RunResult, SpeedrunError};
use speedrun_providers::{RemoteSession, RemoteTransport};
use std::path::Path;
use std::sync::Arc;

use crate::artifacts::ArtifactCollector;
use crate::cancel::{until_cancelled, CancelSignal};
use crate::connection;
use crate::packaging;

pub const ENTRY_POINT: &str = "train.py";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const REMOTE_BASE: &str = "/root";
pub const REMOTE_ARCHIVE_NAME: &str = "project.tar.gz";

fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().rev().take(max_chars).collect::<String>().chars().rev().collect()
}

/// Wrap a transport-level failure as a deployment error, keeping typed errors as-is.
fn deployment_error(step: &str, e: anyhow::Error) -> anyhow::Error {
    match e.downcast::<SpeedrunError>() {
        Ok(known) => known.into(),
        Err(other) => SpeedrunError::Deployment(format!("{}: {:#}", step, other)).into(),
    }
}

/// Ships a project to a running instance, runs it and brings results back.
pub struct DeploymentDriver {
    transport: Arc<dyn RemoteTransport>,
    collector: ArtifactCollector,
    cancel: CancelSignal,
}

impl DeploymentDriver {
    pub fn new(transport: Arc<dyn RemoteTransport>, collector: ArtifactCollector, cancel: CancelSignal) -> Self {
        Self {
            transport,
            collector,
            cancel,
        }
    }

    /// Full remote phase. The local package and the session are released on
    /// every exit path, cancellation included; the instance itself is not
    /// touched here.
    pub async fn deploy(&self, instance: &Instance, project_dir: &Path) -> Result<RunResult> {
        let package = packaging::package_project(project_dir)
            .await
            .map_err(|e| deployment_error("packaging", e))?;
        let project_name = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let endpoint = match connection::advertised(instance) {
            Some(endpoint) => endpoint,
            None => {
                println!("⚠️ No specific SSH port found, trying default port 22");
                connection::default_endpoint(instance)
            }
        };
        println!("🔗 Connecting to {}...", endpoint);
        let connect = async {
            self.transport
                .connect(&endpoint)
                .await
                .map_err(|e| deployment_error("ssh connection", e))
        };
        let session = until_cancelled(&self.cancel, connect).await?;
        println!("✅ Connected via SSH");

        let result = until_cancelled(
            &self.cancel,
            self.run_in_session(session.as_ref(), package.path(), &project_name),
        )
        .await;

        if let Err(e) = session.close().await {
            tracing::warn!(endpoint = %endpoint, error = %e, "failed to close remote session");
        }
        drop(package);
        result
    }

    async fn run_in_session(
        &self,
        session: &dyn RemoteSession,
        package: &Path,
        project_name: &str,
    ) -> Result<RunResult> {
        let remote_archive = format!("{}/{}", REMOTE_BASE, REMOTE_ARCHIVE_NAME);

        println!("📤 Uploading project...");
        session
            .put(package, &remote_archive)
            .await
            .map_err(|e| deployment_error("upload", e))?;

        println!("📂 Extracting project...");
        let extract_cmd = format!(
            "cd {} && tar -xzf {} && rm {}",
            sh_escape_single(REMOTE_BASE),
            REMOTE_ARCHIVE_NAME,
            REMOTE_ARCHIVE_NAME
        );
        let extract = session
            .exec(&extract_cmd)
            .await
            .map_err(|e| deployment_error("extract", e))?;
        if !extract.success() {
            return Err(SpeedrunError::Deployment(format!(
                "extracting project failed (exit {}): {}",
                extract.exit_code,
                tail_str(extract.stderr.trim(), 400)
            ))
            .into());
        }

        if let Ok(listing) = session.exec(&format!("ls -la {}/", REMOTE_BASE)).await {
            tracing::debug!(listing = %listing.stdout.trim_end(), "remote base after extraction");
        }

        let remote_root = self.locate_project_root(session, project_name).await?;
        tracing::info!(remote_root = %remote_root, "project root located");

        self.install_requirements(session, &remote_root).await?;

        let exit_code = self.run_entry_point(session, &remote_root).await?;
        if exit_code != 0 {
            return Err(SpeedrunError::JobFailed { exit_code }.into());
        }
        println!("✅ Training completed");

        let collected = self
            .collector
            .collect(session, &remote_root)
            .await
            .map_err(|e| deployment_error("artifact download", e))?;

        Ok(RunResult {
            exit_code,
            remote_root,
            remote_artifacts: collected.remote_files,
            results_dir: collected.results_dir,
            artifacts: collected.local_files,
        })
    }

    /// Directory holding the entry point. Among several matches the shallowest
    /// wins; with none, `<base>/<project name>` is assumed.
    async fn locate_project_root(&self, session: &dyn RemoteSession, project_name: &str) -> Result<String> {
        let cmd = format!(
            "find {} -name {} -type f",
            sh_escape_single(REMOTE_BASE),
            sh_escape_single(ENTRY_POINT)
        );
        let out = session
            .exec(&cmd)
            .await
            .map_err(|e| deployment_error("locate entry point", e))?;

        let found = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .min_by_key(|l| (l.matches('/').count(), l.len()))
            .and_then(remote_parent)
            .map(str::to_string);

        Ok(match found {
            Some(root) => root,
            None => {
                tracing::warn!(project = project_name, "entry point not found remotely, using default root");
                format!("{}/{}", REMOTE_BASE, project_name)
            }
        })
    }

    async fn install_requirements(&self, session: &dyn RemoteSession, remote_root: &str) -> Result<()> {
        let requirements = format!("{}/{}", remote_root, REQUIREMENTS_FILE);
        let has_requirements = session
            .exec(&format!("test -f {}", sh_escape_single(&requirements)))
            .await
            .map_err(|e| deployment_error("dependency check", e))?;
        if !has_requirements.success() {
            tracing::debug!(path = %requirements, "no requirements file");
            return Ok(());
        }

        println!("📋 Installing requirements...");
        let install = session
            .exec(&format!(
                "cd {} && pip install -r {}",
                sh_escape_single(remote_root),
                REQUIREMENTS_FILE
            ))
            .await
            .map_err(|e| deployment_error("dependency install", e))?;
        if !install.success() {
            return Err(SpeedrunError::Deployment(format!(
                "pip install failed (exit {}): {}",
                install.exit_code,
                tail_str(install.stderr.trim(), 800)
            ))
            .into());
        }
        Ok(())
    }

    /// Run the entry point, echoing its output as it arrives.
    async fn run_entry_point(&self, session: &dyn RemoteSession, remote_root: &str) -> Result<i32> {
        println!("🚀 Running {}...", ENTRY_POINT);
        let cmd = format!("cd {} && python {}", sh_escape_single(remote_root), ENTRY_POINT);
        let mut process = session
            .exec_streaming(&cmd)
            .await
            .map_err(|e| deployment_error("start job", e))?;

        while let Some(line) = process.next_line().await {
            println!("  {}", line);
        }

        process
            .wait()
            .await
            .map_err(|e| deployment_error("job stream", e))
    }
}
