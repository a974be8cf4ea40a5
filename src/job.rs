use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::QueueError;
use crate::config::{Config, EnvSource};
use crate::reconcile::Artifact;
use crate::site::match_binding;

pub const META_FILE_NAME: &str = "meta.json";
pub const TEMP_DIR_PREFIX: &str = "tmp_";

/// Flat key/value document staged next to the artifact as `meta.json`.
/// Consumers ignore fields they do not know.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    pub wp_author: String,
    pub wp_path: String,
    pub zip_filename: String,
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
}

/// Notification credentials forwarded to the remote consumer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassThrough {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl PassThrough {
    pub fn from_env(env: &dyn EnvSource) -> Self {
        PassThrough {
            telegram_bot_token: env.var("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env.var("TELEGRAM_CHAT_ID"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub artifact: Artifact,
    pub meta: JobMeta,
    /// Credential scope of the matched binding.
    pub scope: String,
    pub slug: String,
}

impl Job {
    pub fn temp_dir_name(&self) -> String {
        format!("{}{}", TEMP_DIR_PREFIX, self.id)
    }

    pub fn category(&self) -> &str {
        &self.meta.prefix
    }

    pub fn filename(&self) -> &str {
        &self.artifact.filename
    }
}

/// Which identity a job is queued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// The binding's own author, falling back to the configured default.
    #[default]
    SiteFirst,
    /// Always the configured default author (the operator's own identity).
    DefaultOnly,
}

/// Issues `job_<secs>_<identity>_<name prefix>` identifiers, unique within
/// one run. A second request that would compose the same identifier (same
/// second, same identity, same truncated filename) receives a `_2`, `_3`, ...
/// suffix instead of colliding on the remote side.
#[derive(Debug)]
pub struct JobIdAllocator {
    prefix_len: usize,
    issued: HashSet<String>,
}

impl JobIdAllocator {
    pub fn new(prefix_len: usize) -> Self {
        JobIdAllocator { prefix_len: prefix_len.max(1), issued: HashSet::new() }
    }

    pub fn compose(unix_secs: i64, identity: &str, filename: &str, prefix_len: usize) -> String {
        format!(
            "job_{}_{}_{}",
            unix_secs,
            sanitize_component(identity),
            sanitize_component(truncate_chars(filename, prefix_len))
        )
    }

    pub fn allocate(&mut self, unix_secs: i64, identity: &str, filename: &str) -> String {
        let base = Self::compose(unix_secs, identity, filename, self.prefix_len);
        if self.issued.insert(base.clone()) {
            return base;
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.issued.insert(candidate.clone()) {
                tracing::warn!(
                    "[package] job id {} already issued in this run, using {}",
                    base,
                    candidate
                );
                return candidate;
            }
            n += 1;
        }
    }
}

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// path separators and whitespace would split or break the remote directory name
fn sanitize_component(s: &str) -> String {
    s.chars().map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c }).collect()
}

#[derive(Debug, Default)]
pub struct PackOutcome {
    pub jobs: Vec<Job>,
    pub failures: Vec<(String, QueueError)>,
}

/// Resolves each artifact's binding and builds its job. Pure in-memory work.
pub struct Packager<'a> {
    config: &'a Config,
    pass_through: PassThrough,
    policy: IdentityPolicy,
    ids: JobIdAllocator,
}

impl<'a> Packager<'a> {
    pub fn new(config: &'a Config, pass_through: PassThrough) -> Self {
        Packager {
            config,
            pass_through,
            policy: IdentityPolicy::default(),
            ids: JobIdAllocator::new(config.job_name_prefix_len),
        }
    }

    pub fn with_identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn package(&mut self, artifact: Artifact, unix_secs: i64) -> Result<Job, QueueError> {
        let filename = artifact.filename.clone();
        let binding = match_binding(&self.config.sites, &filename)
            .ok_or_else(|| QueueError::NoBinding(filename.clone()))?;
        let wp_path = binding
            .remote_path()
            .ok_or_else(|| QueueError::MissingRemotePath(filename.clone()))?
            .to_string();
        let identity = match self.policy {
            IdentityPolicy::SiteFirst => binding.author().or(self.config.default_author()),
            IdentityPolicy::DefaultOnly => self.config.default_author(),
        }
        .ok_or_else(|| QueueError::MissingIdentity(filename.clone()))?
        .to_string();

        let id = self.ids.allocate(unix_secs, &identity, &filename);
        let meta = JobMeta {
            wp_author: identity,
            wp_path,
            zip_filename: filename,
            prefix: binding.prefix.clone(),
            telegram_bot_token: self.pass_through.telegram_bot_token.clone(),
            telegram_chat_id: self.pass_through.telegram_chat_id.clone(),
        };
        Ok(Job {
            id,
            artifact,
            meta,
            scope: binding.vps_secret_prefix.clone(),
            slug: binding.slug().to_string(),
        })
    }

    /// Package every artifact, reading the clock once per job.
    pub fn package_all<C>(&mut self, artifacts: Vec<Artifact>, clock: C) -> PackOutcome
    where
        C: Fn() -> i64,
    {
        let mut outcome = PackOutcome::default();
        for artifact in artifacts {
            let name = artifact.filename.clone();
            match self.package(artifact, clock()) {
                Ok(job) => {
                    tracing::debug!("[package] {} -> {} ({})", name, job.id, job.scope);
                    outcome.jobs.push(job);
                }
                Err(e) => {
                    tracing::warn!("[package] {}: {}", name, e);
                    outcome.failures.push((name, e));
                }
            }
        }
        outcome
    }
}
