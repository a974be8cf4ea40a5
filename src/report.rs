use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::JsonStore;

pub const REPORT_HEADER: &str = "--- Summary of Last Upload ---";
pub const STATUS_SUCCEEDED: &str = "Upload succeeded.";
pub const STATUS_NOTHING_NEW: &str = "No new files were uploaded.";
pub const STATUS_EMPTY: &str = "Upload failed or no new files.";

/// Per-category running totals for one reporting day.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportState {
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub totals: BTreeMap<String, u64>,
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Timestamp: (\d{4}-\d{2}-\d{2})").expect("valid date regex"))
}

fn total_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?):.*?Total (\d+)$").expect("valid totals regex"))
}

/// Recover date and totals from a previously rendered report. Later lines
/// win for repeated categories; unparsable lines are ignored.
pub fn parse_report_text(text: &str) -> ReportState {
    let mut state = ReportState::default();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(c) = date_re().captures(line) {
            state.date = NaiveDate::parse_from_str(&c[1], "%Y-%m-%d").ok();
        }
        if let Some(c) = total_re().captures(line)
            && let Ok(total) = c[2].parse::<u64>()
        {
            state.totals.insert(c[1].trim().to_string(), total);
        }
    }
    state
}

/// Carry `prev` forward when it is dated `today`, otherwise start from zero,
/// then add this run's counts over the union of categories.
pub fn merge(prev: &ReportState, today: NaiveDate, new_counts: &BTreeMap<String, u64>) -> ReportState {
    let mut totals = if prev.date == Some(today) { prev.totals.clone() } else { BTreeMap::new() };
    for (category, n) in new_counts {
        *totals.entry(category.clone()).or_insert(0) += n;
    }
    ReportState { date: Some(today), totals }
}

/// Render the text report for an already merged state.
pub fn render(state: &ReportState, new_counts: &BTreeMap<String, u64>, now: DateTime<FixedOffset>) -> String {
    let mut out = format!("{}\nTimestamp: {}\n\n", REPORT_HEADER, now.format("%Y-%m-%d %H:%M:%S %z"));
    if state.totals.is_empty() {
        out.push_str(STATUS_EMPTY);
        return out;
    }
    for (category, total) in &state.totals {
        let new = new_counts.get(category).copied().unwrap_or(0);
        out.push_str(&format!("{}: {} images: Total {}\n", category, new, total));
    }
    out.push('\n');
    if new_counts.values().any(|n| *n > 0) {
        out.push_str(STATUS_SUCCEEDED);
    } else {
        out.push_str(STATUS_NOTHING_NEW);
    }
    out
}

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub state: ReportState,
    pub text: String,
    /// Whether previous totals were dropped because the day changed.
    pub reset: bool,
}

/// Reads the previous report, merges, and overwrites both the text report
/// and its structured state.
#[derive(Debug, Clone)]
pub struct ReportEngine {
    report_path: PathBuf,
    state_path: PathBuf,
    offset: Option<FixedOffset>,
}

impl ReportEngine {
    pub fn new(report_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>, offset: Option<FixedOffset>) -> Self {
        ReportEngine { report_path: report_path.into(), state_path: state_path.into(), offset }
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        match self.offset {
            Some(off) => Utc::now().with_timezone(&off),
            None => Local::now().fixed_offset(),
        }
    }

    /// The structured state wins; the text report is the fallback for
    /// directories written before the state file existed.
    pub fn load_previous(&self) -> ReportState {
        if self.state_path.exists() {
            match ReportState::read_from(&self.state_path) {
                Ok(state) => return state,
                Err(e) => tracing::warn!(
                    "[report] ignoring unreadable state {}: {:#}",
                    self.state_path.display(),
                    e
                ),
            }
        }
        match std::fs::read_to_string(&self.report_path) {
            Ok(text) => parse_report_text(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReportState::default(),
            Err(e) => {
                tracing::warn!("[report] cannot read {}: {}", self.report_path.display(), e);
                ReportState::default()
            }
        }
    }

    pub fn run(&self, new_counts: &BTreeMap<String, u64>) -> Result<ReportOutcome> {
        self.run_at(self.now(), new_counts)
    }

    pub fn run_at(&self, now: DateTime<FixedOffset>, new_counts: &BTreeMap<String, u64>) -> Result<ReportOutcome> {
        let prev = self.load_previous();
        let today = now.date_naive();
        let reset = prev.date.is_some() && prev.date != Some(today) && !prev.totals.is_empty();
        if reset {
            tracing::info!(
                "[report] previous report dated {:?}, today is {}: totals reset",
                prev.date,
                today
            );
        }
        let state = merge(&prev, today, new_counts);
        let text = render(&state, new_counts, now);

        if let Some(parent) = self.report_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        std::fs::write(&self.report_path, &text)
            .with_context(|| format!("write report {}", self.report_path.display()))?;
        state.save_to(&self.state_path)?;
        tracing::debug!("[report] wrote {} categories to {}", state.totals.len(), self.report_path.display());
        Ok(ReportOutcome { state, text, reset })
    }
}
