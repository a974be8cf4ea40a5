use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};

/// Append-only record of filenames already transferred to one destination.
/// One filename per line; lookups are exact line matches.
#[derive(Debug)]
pub struct DedupLedger {
    path: PathBuf,
    entries: HashSet<String>,
}

impl DedupLedger {
    pub fn path_for(dir: &Path, slug: &str) -> PathBuf {
        dir.join(format!("uploaded_files_{}.log", slug))
    }

    /// Load the ledger; a missing file is an empty ledger.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .lines()
                .map(|l| l.trim_end_matches('\r'))
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read ledger {}", path.display()));
            }
        };
        Ok(DedupLedger { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.contains(filename)
    }

    /// Append `filename` unless it is already recorded.
    pub fn record(&mut self, filename: &str) -> Result<()> {
        if self.entries.contains(filename) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        writeln!(f, "{}", filename).with_context(|| format!("append to {}", self.path.display()))?;
        self.entries.insert(filename.to_string());
        Ok(())
    }
}

/// The ledgers of one run keyed by site slug. Host workers append through
/// it right after each activation, so an interrupted run never loses the
/// record of a file that already reached the queue.
#[derive(Debug, Default)]
pub struct LedgerBook {
    ledgers: Mutex<HashMap<String, DedupLedger>>,
}

impl LedgerBook {
    pub fn new(ledgers: HashMap<String, DedupLedger>) -> Self {
        LedgerBook { ledgers: Mutex::new(ledgers) }
    }

    pub fn record(&self, slug: &str, filename: &str) -> Result<()> {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(|p| p.into_inner());
        match ledgers.get_mut(slug) {
            Some(ledger) => ledger.record(filename),
            None => bail!("no ledger open for '{}'", slug),
        }
    }
}
