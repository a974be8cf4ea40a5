use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::site::SiteBinding;
use crate::store::JsonStore;

/// Lookup of secrets and host coordinates. Secrets never live in
/// `config.json`; they come from the process environment (optionally
/// populated from a `.env` file at startup).
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment. Blank values count as unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// How the staged directory is renamed to its final name.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMethod {
    /// `mv` executed over the SSH session; the exit status decides success.
    #[default]
    Exec,
    /// SFTP rename request.
    Sftp,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub remote_queue_dir: String,
    #[serde(default)]
    pub default_user_author: Option<String>,
    #[serde(default)]
    pub sites: Vec<SiteBinding>,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default = "default_report_state_path")]
    pub report_state_path: PathBuf,
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,
    #[serde(default = "default_job_name_prefix_len")]
    pub job_name_prefix_len: usize,
    /// Offset of the reporting calendar day; `null` uses the local clock.
    #[serde(default = "default_report_utc_offset_hours")]
    pub report_utc_offset_hours: Option<i32>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default)]
    pub activation_method: ActivationMethod,
    #[serde(default)]
    pub delete_zip_after_upload: bool,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("../ktbproject/ktbimage/OutputImage")
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("Processing")
}
fn default_input_dir() -> PathBuf {
    PathBuf::from("InputZip")
}
fn default_report_path() -> PathBuf {
    PathBuf::from("upload.log")
}
fn default_report_state_path() -> PathBuf {
    PathBuf::from("report_state.json")
}
fn default_ledger_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_artifact_extension() -> String {
    "zip".to_string()
}
fn default_job_name_prefix_len() -> usize {
    10
}
fn default_report_utc_offset_hours() -> Option<i32> {
    Some(7)
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_io_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A configuration with every optional key at its default.
    pub fn with_queue_dir(remote_queue_dir: impl Into<String>) -> Self {
        Config {
            remote_queue_dir: remote_queue_dir.into(),
            default_user_author: None,
            sites: Vec::new(),
            source_dir: default_source_dir(),
            staging_dir: default_staging_dir(),
            input_dir: default_input_dir(),
            report_path: default_report_path(),
            report_state_path: default_report_state_path(),
            ledger_dir: default_ledger_dir(),
            logs_dir: default_logs_dir(),
            artifact_extension: default_artifact_extension(),
            job_name_prefix_len: default_job_name_prefix_len(),
            report_utc_offset_hours: default_report_utc_offset_hours(),
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            activation_method: ActivationMethod::default(),
            delete_zip_after_upload: false,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let cfg = Config::read_from(path)
            .with_context(|| format!("load configuration {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_queue_dir.trim().is_empty() {
            bail!("'remote_queue_dir' must be set in the configuration");
        }
        if self.job_name_prefix_len == 0 {
            bail!("'job_name_prefix_len' must be at least 1");
        }
        if self.artifact_extension.trim_start_matches('.').is_empty() {
            bail!("'artifact_extension' must not be empty");
        }
        for (i, site) in self.sites.iter().enumerate() {
            if site.prefix.is_empty() {
                bail!("sites[{}]: 'prefix' must not be empty", i);
            }
            if site.vps_secret_prefix.trim().is_empty() {
                bail!("sites[{}] ({}): 'vps_secret_prefix' must not be empty", i, site.prefix);
            }
        }
        Ok(())
    }

    /// Remote queue directory without trailing slashes.
    pub fn queue_dir(&self) -> String {
        crate::transfer::normalize_path(&self.remote_queue_dir, false)
    }

    /// Fixed offset used to decide the reporting calendar day. `None` when
    /// unset or out of range, in which case callers fall back to local time.
    pub fn report_offset(&self) -> Option<FixedOffset> {
        self.report_utc_offset_hours.and_then(|h| FixedOffset::east_opt(h.checked_mul(3600)?))
    }

    pub fn ledger_path(&self, slug: &str) -> PathBuf {
        crate::ledger::DedupLedger::path_for(&self.ledger_dir, slug)
    }

    pub fn default_author(&self) -> Option<&str> {
        self.default_user_author.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}
