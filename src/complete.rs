use std::path::Path;

use crate::ledger::LedgerBook;
use crate::transfer::Activation;
use crate::transfer::display_path;

/// What happens to the local artifact once its job is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPolicy {
    DeleteOnActivation,
    Keep,
}

/// Local side effects applied after one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub artifact_removed: bool,
    pub scratch_removed: bool,
    pub ledger_recorded: bool,
    /// Local deletions that failed; they never change the job outcome.
    pub errors: Vec<String>,
}

/// Remove the artifact iff the job was activated (and the policy allows),
/// and always remove the metadata scratch file. With a `(book, slug)`
/// ledger, an activated filename is appended before anything is deleted.
pub fn finalize_job(
    act: &Activation,
    artifact: &Path,
    policy: LocalPolicy,
    ledger: Option<(&LedgerBook, &str)>,
) -> Completion {
    let mut done = Completion::default();

    if act.is_activated()
        && let Some((book, slug)) = ledger
    {
        match book.record(slug, &act.filename) {
            Ok(()) => done.ledger_recorded = true,
            Err(e) => {
                tracing::warn!("[complete] {} activated but not recorded: {:#}", act.job_id, e);
                done.errors.push(format!("{:#}", e));
            }
        }
    }

    if let Some(scratch) = &act.scratch_meta {
        match std::fs::remove_file(scratch) {
            Ok(()) => done.scratch_removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("[complete] cannot remove {}: {}", display_path(scratch), e);
                done.errors.push(format!("{}: {}", display_path(scratch), e));
            }
        }
    }

    if act.is_activated() && policy == LocalPolicy::DeleteOnActivation {
        match std::fs::remove_file(artifact) {
            Ok(()) => {
                done.artifact_removed = true;
                tracing::debug!("[complete] removed {}", display_path(artifact));
            }
            Err(e) => {
                tracing::warn!(
                    "[complete] {} activated but local copy not removed: {}",
                    act.job_id,
                    e
                );
                done.errors.push(format!("{}: {}", display_path(artifact), e));
            }
        }
    }
    done
}
