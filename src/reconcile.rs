use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::QueueError;
use crate::transfer::display_path;

/// One archive file awaiting (or undergoing) transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Result of snapshotting the source directory into staging.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub moved: Vec<String>,
    pub failures: Vec<(String, QueueError)>,
}

/// Case-insensitive extension check; `ext` may be given with or without the dot.
pub fn is_eligible(filename: &str, ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    match filename.rsplit_once('.') {
        Some((stem, e)) => !stem.is_empty() && e.eq_ignore_ascii_case(ext),
        None => false,
    }
}

/// Eligible regular files directly inside `dir`, sorted by filename.
/// A missing directory yields an empty list.
pub fn list_artifacts(dir: &Path, ext: &str) -> Result<Vec<Artifact>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            tracing::warn!("[reconcile] skipping non-UTF-8 filename in {}", dir.display());
            continue;
        };
        if !is_eligible(name, ext) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push(Artifact { filename: name.to_string(), path: entry.path().to_path_buf(), size });
    }
    out.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(out)
}

/// Move every eligible artifact from `source` into `staging` before any
/// network activity, so the run works on a frozen snapshot. Per-file move
/// failures are recorded and the file stays where it is. A missing source
/// directory is not an error: whatever already sits in staging is still owed
/// a transfer attempt.
pub fn stage_artifacts(source: &Path, staging: &Path, ext: &str) -> Result<StageOutcome> {
    std::fs::create_dir_all(staging)
        .with_context(|| format!("create staging directory {}", staging.display()))?;
    let mut outcome = StageOutcome::default();
    if !source.exists() {
        tracing::warn!("[reconcile] source directory {} does not exist", display_path(source));
        return Ok(outcome);
    }
    for artifact in list_artifacts(source, ext)? {
        let dest = staging.join(&artifact.filename);
        if dest.exists() {
            outcome.failures.push((
                artifact.filename.clone(),
                QueueError::StageMoveFailed(
                    artifact.filename.clone(),
                    "a file with the same name is already staged".to_string(),
                ),
            ));
            continue;
        }
        match move_file(&artifact.path, &dest) {
            Ok(()) => {
                tracing::debug!(
                    "[reconcile] staged {} -> {}",
                    display_path(&artifact.path),
                    display_path(&dest)
                );
                outcome.moved.push(artifact.filename);
            }
            Err(e) => {
                tracing::warn!("[reconcile] cannot stage {}: {}", artifact.filename, e);
                outcome.failures.push((
                    artifact.filename.clone(),
                    QueueError::StageMoveFailed(artifact.filename, e.to_string()),
                ));
            }
        }
    }
    Ok(outcome)
}

// rename first; fall back to copy + remove when source and staging sit on different devices
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            std::fs::copy(from, to)?;
            if let Err(rm) = std::fs::remove_file(from) {
                // keep a single copy: the source stays authoritative
                let _ = std::fs::remove_file(to);
                return Err(rm);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
