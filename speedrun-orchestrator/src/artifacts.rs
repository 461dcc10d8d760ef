use anyhow::{Context, Result};
use speedrun_common::artifact_patterns::ArtifactPatterns;
use speedrun_common::shell::{remote_file_name, sh_escape_single};
use speedrun_providers::RemoteSession;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const RESULTS_DIR_PREFIX: &str = "speedrun_results_";

/// What one collection pass found and fetched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Collected {
    pub remote_files: Vec<String>,
    pub results_dir: Option<PathBuf>,
    pub local_files: Vec<PathBuf>,
}

/// Finds model files in the remote project and downloads them locally.
pub struct ArtifactCollector {
    patterns: ArtifactPatterns,
    results_base: PathBuf,
}

impl ArtifactCollector {
    pub fn new(patterns: ArtifactPatterns, results_base: PathBuf) -> Self {
        Self {
            patterns,
            results_base,
        }
    }

    /// Remote artifact paths under `remote_root`, one `find` per pattern,
    /// deduplicated in first-seen order.
    pub async fn discover(&self, session: &dyn RemoteSession, remote_root: &str) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for pattern in self.patterns.as_strs() {
            let cmd = format!(
                "find {} -name {} -type f",
                sh_escape_single(remote_root),
                sh_escape_single(pattern)
            );
            let out = session.exec(&cmd).await?;
            if !out.success() {
                // find still prints what it could read (e.g. permission errors on subdirs).
                tracing::warn!(pattern = %pattern, exit_code = out.exit_code, stderr = %out.stderr.trim(), "artifact search incomplete");
            }
            for path in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !self.patterns.matches_file(path) {
                    continue;
                }
                if seen.insert(path.to_string()) {
                    found.push(path.to_string());
                }
            }
        }

        Ok(found)
    }

    /// Download every artifact into a fresh results directory, keeping only
    /// file names. No directory is created when nothing was found.
    pub async fn collect(&self, session: &dyn RemoteSession, remote_root: &str) -> Result<Collected> {
        println!("📥 Downloading model artifacts...");
        let remote_files = self.discover(session, remote_root).await?;
        if remote_files.is_empty() {
            println!("⚠️ No model artifacts found");
            return Ok(Collected::default());
        }

        let results_dir = create_results_dir(&self.results_base).await?;
        let mut local_files: Vec<PathBuf> = Vec::with_capacity(remote_files.len());

        for remote in &remote_files {
            let Some(name) = remote_file_name(remote) else {
                continue;
            };
            let local = results_dir.join(name);
            if local_files.contains(&local) {
                tracing::warn!(remote = %remote, local = %local.display(), "artifact name collision, later file wins");
            }
            println!("  Downloading {}...", name);
            session
                .get(remote, &local)
                .await
                .with_context(|| format!("failed to download {}", remote))?;
            if !local_files.contains(&local) {
                local_files.push(local);
            }
        }

        println!(
            "✅ Downloaded {} files to {}",
            remote_files.len(),
            results_dir.display()
        );
        Ok(Collected {
            remote_files,
            results_dir: Some(results_dir),
            local_files,
        })
    }
}

/// Create `speedrun_results_<unix-ts>` under `base`, suffixing `_2`, `_3`, ...
/// when a directory of that name already exists.
pub async fn create_results_dir(base: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(base)
        .await
        .with_context(|| format!("failed to create {}", base.display()))?;

    let ts = chrono::Utc::now().timestamp();
    let mut n: u32 = 1;
    loop {
        let name = if n == 1 {
            format!("{}{}", RESULTS_DIR_PREFIX, ts)
        } else {
            format!("{}{}_{}", RESULTS_DIR_PREFIX, ts, n)
        };
        let path = base.join(name);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to create results directory {}", path.display())))
            }
        }
    }
}
