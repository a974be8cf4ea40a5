use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, FixedOffset};

use crate::QueueError;
use crate::complete::LocalPolicy;
use crate::config::{Config, EnvSource};
use crate::group::group_jobs;
use crate::job::{IdentityPolicy, Job, Packager, PassThrough};
use crate::ledger::{DedupLedger, LedgerBook};
use crate::notify::{Notifier, deliver};
use crate::reconcile::{Artifact, list_artifacts, stage_artifacts};
use crate::report::{ReportEngine, ReportOutcome};
use crate::transfer::{ActivationCtx, Connector, CredentialSource, GroupCtx, JobResult, run_groups};
use crate::util::write_failures_jsonl;

/// Which workflow a run follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Key-authenticated; artifacts are staged first and deleted once queued.
    Admin,
    /// Password-authenticated; artifacts are read from the input directory
    /// under the operator's own identity.
    User,
    /// Key-authenticated; artifacts stay in place and a per-site ledger
    /// skips anything already sent.
    Ledger,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Admin => "admin",
            RunMode::User => "user",
            RunMode::Ledger => "ledger",
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub parallel_hosts: bool,
    /// Admin mode only: process what is already staged without scanning the source.
    pub skip_stage: bool,
    pub dry_run: bool,
    /// User mode: delete artifacts once queued even if the config says keep.
    pub delete_after_upload: bool,
    pub progress: bool,
}

/// One line of the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEntry {
    Queued { filename: String, host: String, job_id: String },
    Failed { filename: String, reason: String },
    Skipped { filename: String },
    Planned { filename: String, host: String, job_id: String },
}

impl fmt::Display for RunEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEntry::Queued { filename, host, .. } => write!(f, "[OK] {} -> {}", filename, host),
            RunEntry::Failed { filename, reason } => write!(f, "[ERR] {} ({})", filename, reason),
            RunEntry::Skipped { filename } => write!(f, "[SKIP] {} (already uploaded)", filename),
            RunEntry::Planned { filename, host, job_id } => {
                write!(f, "[PLAN] {} -> {} as {}", filename, host, job_id)
            }
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub mode: RunMode,
    pub entries: Vec<RunEntry>,
    /// Every failure of the run with its subject (filename or address).
    pub failures: Vec<(String, QueueError)>,
    pub bytes: u64,
    pub new_counts: BTreeMap<String, u64>,
    pub report: Option<ReportOutcome>,
    pub notified: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(mode: RunMode) -> Self {
        RunSummary {
            mode,
            entries: Vec::new(),
            failures: Vec::new(),
            bytes: 0,
            new_counts: BTreeMap::new(),
            report: None,
            notified: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn queued(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e, RunEntry::Queued { .. })).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e, RunEntry::Failed { .. })).count()
    }

    fn fail(&mut self, subject: String, err: QueueError) {
        if err.is_configuration() {
            tracing::warn!("[run] {}: {}", subject, err);
        } else {
            tracing::error!("[run] {}: {}", subject, err);
        }
        self.entries.push(RunEntry::Failed { filename: subject.clone(), reason: err.to_string() });
        self.failures.push((subject, err));
    }

    /// Plain-text run log: header, one line per entry, closing total.
    pub fn run_log(&self, identity: Option<&str>) -> String {
        let mut out = format!("--- Queue run ({}) ---\n", self.mode);
        if let Some(who) = identity {
            out.push_str(&format!("User: {}\n", who));
        }
        for e in &self.entries {
            out.push_str(&format!("{}\n", e));
        }
        match self.queued() {
            0 => out.push_str("\nNo files were queued."),
            n => out.push_str(&format!("\nTotal: {} file(s) queued.", n)),
        }
        out
    }
}

// what staging would add: source files whose name is not staged yet
fn with_unstaged(staged: Vec<Artifact>, source: Vec<Artifact>) -> Vec<Artifact> {
    let names: HashSet<String> = staged.iter().map(|a| a.filename.clone()).collect();
    let mut all = staged;
    all.extend(source.into_iter().filter(|a| !names.contains(&a.filename)));
    all.sort_by(|a, b| a.filename.cmp(&b.filename));
    all
}

/// One end-to-end run against injected collaborators.
pub struct Pipeline<'a> {
    config: &'a Config,
    env: &'a dyn EnvSource,
    connector: &'a dyn Connector,
    credentials: &'a dyn CredentialSource,
    notifier: &'a dyn Notifier,
    clock: Box<dyn Fn() -> i64 + 'a>,
    report_time: Option<DateTime<FixedOffset>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        env: &'a dyn EnvSource,
        connector: &'a dyn Connector,
        credentials: &'a dyn CredentialSource,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Pipeline {
            config,
            env,
            connector,
            credentials,
            notifier,
            clock: Box::new(|| chrono::Utc::now().timestamp()),
            report_time: None,
        }
    }

    /// Override the unix-seconds clock used for job ids.
    pub fn with_clock<C: Fn() -> i64 + 'a>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Pin the report timestamp instead of reading the wall clock.
    pub fn with_report_time(mut self, at: DateTime<FixedOffset>) -> Self {
        self.report_time = Some(at);
        self
    }

    fn working_dir(&self, mode: RunMode) -> PathBuf {
        match mode {
            RunMode::Admin => self.config.staging_dir.clone(),
            RunMode::User => self.config.input_dir.clone(),
            RunMode::Ledger => self.config.source_dir.clone(),
        }
    }

    fn local_policy(&self, mode: RunMode, opts: &RunOptions) -> LocalPolicy {
        match mode {
            RunMode::Admin => LocalPolicy::DeleteOnActivation,
            RunMode::User if opts.delete_after_upload || self.config.delete_zip_after_upload => {
                LocalPolicy::DeleteOnActivation
            }
            RunMode::User | RunMode::Ledger => LocalPolicy::Keep,
        }
    }

    fn report_engine(&self) -> ReportEngine {
        ReportEngine::new(
            &self.config.report_path,
            &self.config.report_state_path,
            self.config.report_offset(),
        )
    }

    // drop jobs whose filename is already in their site's ledger
    fn filter_ledger(
        &self,
        jobs: Vec<Job>,
        ledgers: &mut HashMap<String, DedupLedger>,
        summary: &mut RunSummary,
    ) -> Vec<Job> {
        let mut keep = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !ledgers.contains_key(&job.slug) {
                let path = self.config.ledger_path(&job.slug);
                match DedupLedger::open(&path) {
                    Ok(l) => {
                        tracing::debug!("[ledger] {} has {} entries", path.display(), l.len());
                        ledgers.insert(job.slug.clone(), l);
                    }
                    Err(e) => {
                        let err = QueueError::LocalIo(path.display().to_string(), format!("{:#}", e));
                        summary.fail(job.filename().to_string(), err);
                        continue;
                    }
                }
            }
            if ledgers.get(&job.slug).is_some_and(|l| l.contains(job.filename())) {
                tracing::info!("[ledger] {} already uploaded for {}", job.filename(), job.slug);
                summary.entries.push(RunEntry::Skipped { filename: job.filename().to_string() });
                continue;
            }
            keep.push(job);
        }
        keep
    }

    pub fn run(&self, mode: RunMode, opts: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let cfg = self.config;
        let mut summary = RunSummary::new(mode);
        let work_dir = self.working_dir(mode);
        let ext = cfg.artifact_extension.as_str();

        if mode == RunMode::Admin && !opts.skip_stage && !opts.dry_run {
            let staged = stage_artifacts(&cfg.source_dir, &work_dir, ext)?;
            if !staged.moved.is_empty() {
                tracing::info!("[run] staged {} artifact(s)", staged.moved.len());
            }
            for (name, err) in staged.failures {
                summary.fail(name, err);
            }
        }

        let mut artifacts = list_artifacts(&work_dir, ext)?;
        tracing::info!("[run] {} artifact(s) in {}", artifacts.len(), work_dir.display());
        if mode == RunMode::Admin && !opts.skip_stage && opts.dry_run {
            artifacts = with_unstaged(artifacts, list_artifacts(&cfg.source_dir, ext)?);
        }

        let policy = match mode {
            RunMode::User => IdentityPolicy::DefaultOnly,
            RunMode::Admin | RunMode::Ledger => IdentityPolicy::SiteFirst,
        };
        let mut packager =
            Packager::new(cfg, PassThrough::from_env(self.env)).with_identity_policy(policy);
        let packed = packager.package_all(artifacts, &self.clock);
        for (name, err) in packed.failures {
            summary.fail(name, err);
        }

        let mut ledgers = HashMap::new();
        let jobs = if mode == RunMode::Ledger {
            self.filter_ledger(packed.jobs, &mut ledgers, &mut summary)
        } else {
            packed.jobs
        };
        let book = LedgerBook::new(ledgers);

        let grouped = group_jobs(jobs, self.env);
        for (job, err) in grouped.failures {
            summary.fail(job.filename().to_string(), err);
        }

        if opts.dry_run {
            for g in &grouped.groups {
                for job in &g.jobs {
                    summary.entries.push(RunEntry::Planned {
                        filename: job.filename().to_string(),
                        host: g.destination.host.clone(),
                        job_id: job.id.clone(),
                    });
                }
            }
            summary.elapsed = started.elapsed();
            return Ok(summary);
        }

        let queue_dir = cfg.queue_dir();
        let ctx = GroupCtx {
            connector: self.connector,
            credentials: self.credentials,
            env: self.env,
            activation: ActivationCtx {
                queue_dir: &queue_dir,
                scratch_dir: &work_dir,
                progress: opts.progress && !opts.parallel_hosts,
            },
            policy: self.local_policy(mode, opts),
            ledger: (mode == RunMode::Ledger).then_some(&book),
        };

        for result in run_groups(grouped.groups, &ctx, opts.parallel_hosts) {
            if let Some(err) = &result.connect_error {
                summary.failures.push((result.destination.addr(), err.clone()));
            }
            for (job, outcome) in result.jobs {
                match outcome {
                    JobResult::Attempted { activation, .. } if activation.is_activated() => {
                        summary.bytes += activation.bytes;
                        *summary.new_counts.entry(activation.category.clone()).or_insert(0) += 1;
                        summary.entries.push(RunEntry::Queued {
                            filename: job.filename().to_string(),
                            host: result.destination.host.clone(),
                            job_id: activation.job_id.clone(),
                        });
                    }
                    JobResult::Attempted { activation, .. } => {
                        let err = activation.error.unwrap_or_else(|| {
                            QueueError::ActivateFailed(activation.job_id.clone(), "unknown".into())
                        });
                        summary.fail(job.filename().to_string(), err);
                    }
                    JobResult::NotAttempted(err) => {
                        // counted once per group above
                        summary.entries.push(RunEntry::Failed {
                            filename: job.filename().to_string(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        let engine = self.report_engine();
        let at = self.report_time.unwrap_or_else(|| engine.now());
        match engine.run_at(at, &summary.new_counts) {
            Ok(report) => summary.report = Some(report),
            Err(e) => tracing::error!("[report] {:#}", e),
        }

        let mut message = summary.run_log(cfg.default_author());
        if let Some(report) = &summary.report {
            message.push_str("\n\n");
            message.push_str(&report.text);
        }
        summary.notified = deliver(self.notifier, &message);

        if let Err(e) = write_failures_jsonl(&cfg.logs_dir, &summary.failures) {
            tracing::warn!("[run] {:#}", e);
        }
        summary.elapsed = started.elapsed();
        tracing::info!(
            "[run] {} mode finished: {} queued, {} failed in {:.2}s",
            mode,
            summary.queued(),
            summary.failed(),
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}
