//! Project packaging: a gzip-compressed tar of the project directory.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;

/// Package every top-level entry of `project_dir` whose name does not start
/// with a dot into a temporary `.tar.gz`.
///
/// The archive is removed when the returned handle is dropped.
pub async fn package_project(project_dir: &Path) -> Result<NamedTempFile> {
    println!("📦 Packaging project...");
    let src = project_dir.to_owned();
    let package = spawn_blocking(move || package_project_sync(&src))
        .await
        .context("packaging task failed")??;

    let size = package.as_file().metadata().map(|m| m.len()).unwrap_or(0);
    println!("✅ Packaged project ({:.1}MB)", size as f64 / (1024.0 * 1024.0));
    Ok(package)
}

fn package_project_sync(project_dir: &Path) -> Result<NamedTempFile> {
    let package = tempfile::Builder::new()
        .prefix("speedrun-")
        .suffix(".tar.gz")
        .tempfile()
        .context("failed to create package file")?;

    let file = package.reopen().context("failed to open package file")?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = tar::Builder::new(encoder);
    tar_builder.follow_symlinks(false);

    for entry in top_level_entries(project_dir)? {
        let name = entry
            .file_name()
            .map(PathBuf::from)
            .context("project entry without a file name")?;
        if entry.is_dir() {
            tar_builder
                .append_dir_all(&name, &entry)
                .with_context(|| format!("failed to add {}", entry.display()))?;
        } else {
            tar_builder
                .append_path_with_name(&entry, &name)
                .with_context(|| format!("failed to add {}", entry.display()))?;
        }
    }

    let encoder = tar_builder.into_inner().context("failed to finish tar archive")?;
    encoder.finish().context("failed to finish gzip stream")?;

    tracing::debug!(path = %package.path().display(), "project packaged");
    Ok(package)
}

/// Top-level entries to ship, sorted by name. Dotfiles are skipped only at the
/// top level.
fn top_level_entries(project_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(project_dir)
        .with_context(|| format!("failed to read {}", project_dir.display()))?
    {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
