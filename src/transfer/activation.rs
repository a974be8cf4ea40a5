use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use crate::QueueError;
use crate::job::{Job, META_FILE_NAME};
use crate::transfer::helpers::{display_path, remote_join};
use crate::transfer::sftp_like::SftpLike;
use crate::util::payload_progress;

/// Lifecycle of one job on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    TempCreated,
    MetaStaged,
    PayloadStaged,
    Activated,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::TempCreated => "TEMP-CREATED",
            JobState::MetaStaged => "META-STAGED",
            JobState::PayloadStaged => "PAYLOAD-STAGED",
            JobState::Activated => "ACTIVATED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Remote locations used by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJobPaths {
    pub temp_dir: String,
    pub meta: String,
    pub payload: String,
    pub final_dir: String,
}

impl RemoteJobPaths {
    pub fn for_job(queue_dir: &str, job: &Job) -> Self {
        let temp_dir = remote_join(queue_dir, &job.temp_dir_name());
        RemoteJobPaths {
            meta: remote_join(&temp_dir, META_FILE_NAME),
            payload: remote_join(&temp_dir, job.filename()),
            final_dir: remote_join(queue_dir, &job.id),
            temp_dir,
        }
    }
}

/// What a rollback removed and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of running the protocol for one job.
#[derive(Debug, Clone)]
pub struct Activation {
    pub job_id: String,
    pub filename: String,
    pub category: String,
    pub state: JobState,
    /// Last state reached before a failure.
    pub reached: JobState,
    pub error: Option<QueueError>,
    pub cleanup: Option<CleanupReport>,
    pub bytes: u64,
    /// Local `<job-id>_meta.json` working copy, when it could be written.
    pub scratch_meta: Option<PathBuf>,
}

impl Activation {
    pub fn is_activated(&self) -> bool {
        self.state == JobState::Activated
    }
}

pub struct ActivationCtx<'a> {
    pub queue_dir: &'a str,
    /// Where the local metadata working copy is written.
    pub scratch_dir: &'a Path,
    pub progress: bool,
}

/// Remote entries one job has created so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedEntries {
    pub temp_dir: bool,
    pub meta: bool,
    pub payload: bool,
}

/// Remove what a failed job created in its temp directory, and nothing
/// else. Every error is collected, none is raised.
pub fn cleanup(remote: &dyn SftpLike, paths: &RemoteJobPaths, staged: StagedEntries) -> CleanupReport {
    let mut report = CleanupReport::default();
    for (file, created) in [(&paths.payload, staged.payload), (&paths.meta, staged.meta)] {
        if !created {
            continue;
        }
        match remote.remove_file(Path::new(file)) {
            Ok(()) => report.removed.push(file.clone()),
            Err(e) => report.errors.push((file.clone(), e)),
        }
    }
    if staged.temp_dir {
        match remote.rmdir(Path::new(&paths.temp_dir)) {
            Ok(()) => report.removed.push(paths.temp_dir.clone()),
            Err(e) => report.errors.push((paths.temp_dir.clone(), e)),
        }
    }
    if report.is_clean() {
        tracing::info!("[activate] cleaned up {}", paths.temp_dir);
    } else {
        tracing::warn!(
            "[activate] cleanup of {} incomplete: removed {:?}, errors {:?}",
            paths.temp_dir,
            report.removed,
            report.errors
        );
    }
    report
}

fn write_scratch_meta(dir: &Path, job: &Job, body: &[u8]) -> Option<PathBuf> {
    let path = dir.join(format!("{}_meta.json", job.id));
    match std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body)) {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!("[activate] cannot write {}: {}", display_path(&path), e);
            None
        }
    }
}

// `created` is set once the remote file exists, even if writing it fails later
fn upload_meta(remote: &dyn SftpLike, path: &str, body: &[u8], created: &mut bool) -> Result<(), String> {
    let mut w = remote.create_write(Path::new(path))?;
    *created = true;
    w.write_all(body).map_err(|e| e.to_string())?;
    w.flush().map_err(|e| e.to_string())
}

fn upload_payload(
    remote: &dyn SftpLike,
    job: &Job,
    path: &str,
    progress: bool,
    created: &mut bool,
) -> Result<u64, String> {
    let f = File::open(&job.artifact.path)
        .map_err(|e| format!("open {}: {}", display_path(&job.artifact.path), e))?;
    let len = f.metadata().map(|m| m.len()).unwrap_or(job.artifact.size);
    let mut reader = BufReader::with_capacity(64 * 1024, f);
    let w = remote.create_write(Path::new(path))?;
    *created = true;
    let pb = payload_progress(len, job.filename(), progress);
    let mut w = pb.wrap_write(w);
    let res = std::io::copy(&mut reader, &mut w).and_then(|n| w.flush().map(|_| n));
    pb.finish_and_clear();
    res.map_err(|e| e.to_string())
}

/// Drive one job from PENDING to ACTIVATED. Metadata is staged before the
/// payload, and the final name only appears through a single rename of the
/// fully staged directory. Any failure after the temp directory exists rolls
/// it back.
pub fn activate(remote: &dyn SftpLike, job: &Job, ctx: &ActivationCtx<'_>) -> Activation {
    let paths = RemoteJobPaths::for_job(ctx.queue_dir, job);
    let mut act = Activation {
        job_id: job.id.clone(),
        filename: job.filename().to_string(),
        category: job.category().to_string(),
        state: JobState::Pending,
        reached: JobState::Pending,
        error: None,
        cleanup: None,
        bytes: 0,
        scratch_meta: None,
    };

    let body = match serde_json::to_vec_pretty(&job.meta) {
        Ok(b) => b,
        Err(e) => {
            return fail(act, QueueError::MetaUploadFailed(paths.meta.clone(), e.to_string()), None);
        }
    };
    act.scratch_meta = write_scratch_meta(ctx.scratch_dir, job, &body);

    if let Err(e) = remote.mkdir(Path::new(&paths.temp_dir), 0o755) {
        return fail(act, QueueError::CreateTempDirFailed(paths.temp_dir.clone(), e), None);
    }
    let mut staged = StagedEntries { temp_dir: true, ..Default::default() };
    act.reached = JobState::TempCreated;
    tracing::debug!("[activate] {} {}", job.id, act.reached);

    if let Err(e) = upload_meta(remote, &paths.meta, &body, &mut staged.meta) {
        let err = QueueError::MetaUploadFailed(paths.meta.clone(), e);
        return fail(act, err, Some((remote, &paths, staged)));
    }
    act.reached = JobState::MetaStaged;
    tracing::debug!("[activate] {} {}", job.id, act.reached);

    match upload_payload(remote, job, &paths.payload, ctx.progress, &mut staged.payload) {
        Ok(n) => act.bytes = n,
        Err(e) => {
            let err = QueueError::PayloadUploadFailed(paths.payload.clone(), e);
            return fail(act, err, Some((remote, &paths, staged)));
        }
    }
    act.reached = JobState::PayloadStaged;
    tracing::debug!("[activate] {} {} ({} bytes)", job.id, act.reached, act.bytes);

    if let Err(e) = remote.rename_dir(Path::new(&paths.temp_dir), Path::new(&paths.final_dir)) {
        let err = QueueError::ActivateFailed(paths.temp_dir.clone(), e);
        return fail(act, err, Some((remote, &paths, staged)));
    }
    act.reached = JobState::Activated;
    act.state = JobState::Activated;
    tracing::info!("[activate] {} -> {}", job.filename(), paths.final_dir);
    act
}

fn fail(
    mut act: Activation,
    err: QueueError,
    rollback: Option<(&dyn SftpLike, &RemoteJobPaths, StagedEntries)>,
) -> Activation {
    tracing::warn!("[activate] {} failed after {}: {}", act.job_id, act.reached, err);
    if let Some((remote, paths, staged)) = rollback
        && err.needs_remote_cleanup()
    {
        act.cleanup = Some(cleanup(remote, paths, staged));
    }
    act.state = JobState::Failed;
    act.error = Some(err);
    act
}
