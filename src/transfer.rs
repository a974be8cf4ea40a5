// transfer module: sessions, the activation protocol and per-host execution
mod activation;
mod helpers;
pub mod memory;
mod session;
mod sftp_like;

pub use activation::{
    Activation, ActivationCtx, CleanupReport, JobState, RemoteJobPaths, StagedEntries, activate, cleanup,
};
pub(crate) use helpers::display_path;
pub use helpers::{normalize_path, remote_join};
pub use session::{
    AdminKeys, Connector, Credential, CredentialSource, SharedPassword, Ssh2Connector, TransferSession,
};
pub use sftp_like::{SftpLike, Ssh2Adapter};

use crossbeam_channel::unbounded;

use crate::QueueError;
use crate::complete::{Completion, LocalPolicy, finalize_job};
use crate::config::EnvSource;
use crate::group::{Destination, HostGroup};
use crate::job::Job;
use crate::ledger::LedgerBook;

/// What became of one job inside its host group.
#[derive(Debug, Clone)]
pub enum JobResult {
    Attempted { activation: Activation, completion: Completion },
    /// The group never reached this job (credential, connection or auth failure).
    NotAttempted(QueueError),
}

#[derive(Debug, Clone)]
pub struct GroupResult {
    pub destination: Destination,
    pub jobs: Vec<(Job, JobResult)>,
    /// Set when the whole group was abandoned.
    pub connect_error: Option<QueueError>,
}

/// Everything a host worker needs; shared read-only across workers.
pub struct GroupCtx<'a> {
    pub connector: &'a dyn Connector,
    pub credentials: &'a dyn CredentialSource,
    pub env: &'a dyn EnvSource,
    pub activation: ActivationCtx<'a>,
    pub policy: LocalPolicy,
    /// Ledger mode: activated filenames are recorded per job.
    pub ledger: Option<&'a LedgerBook>,
}

fn abandon(group: HostGroup, err: QueueError) -> GroupResult {
    tracing::error!(
        "[transfer] {}: {} ({} job(s) not attempted)",
        group.destination,
        err,
        group.jobs.len()
    );
    let jobs = group.jobs.into_iter().map(|j| (j, JobResult::NotAttempted(err.clone()))).collect();
    GroupResult { destination: group.destination, jobs, connect_error: Some(err) }
}

/// One session for the whole group; jobs run strictly one after another and
/// a job failure never stops the next job. The session is torn down when
/// this returns.
pub fn run_group(group: HostGroup, ctx: &GroupCtx<'_>) -> GroupResult {
    let cred = match ctx.credentials.resolve(&group.destination.scope, ctx.env) {
        Ok(c) => c,
        Err(e) => return abandon(group, e),
    };
    let session = match TransferSession::open(ctx.connector, &group.destination, &cred) {
        Ok(s) => s,
        Err(e) => return abandon(group, e),
    };
    tracing::info!("[transfer] {}: {} job(s)", group.destination, group.jobs.len());

    let mut jobs = Vec::with_capacity(group.jobs.len());
    for job in group.jobs {
        let activation = activate(session.remote(), &job, &ctx.activation);
        let ledger = ctx.ledger.map(|book| (book, job.slug.as_str()));
        let completion = finalize_job(&activation, &job.artifact.path, ctx.policy, ledger);
        jobs.push((job, JobResult::Attempted { activation, completion }));
    }
    drop(session);
    GroupResult { destination: group.destination, jobs, connect_error: None }
}

/// Run every group, either in order on this thread or one worker per group.
/// Results come back in group order either way.
pub fn run_groups(groups: Vec<HostGroup>, ctx: &GroupCtx<'_>, parallel: bool) -> Vec<GroupResult> {
    if !parallel || groups.len() < 2 {
        return groups.into_iter().map(|g| run_group(g, ctx)).collect();
    }
    let total = groups.len();
    let (result_tx, result_rx) = unbounded::<(usize, GroupResult)>();
    std::thread::scope(|s| {
        for (i, group) in groups.into_iter().enumerate() {
            let tx = result_tx.clone();
            s.spawn(move || {
                let _ = tx.send((i, run_group(group, ctx)));
            });
        }
    });
    drop(result_tx);
    let mut results: Vec<(usize, GroupResult)> = result_rx.iter().collect();
    if results.len() != total {
        tracing::error!("[transfer] {} of {} host workers reported back", results.len(), total);
    }
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}
