//! In-memory remote used by tests and `--dry-run` style experiments.
//!
//! The filesystem is a set of directories plus a map of files, shared behind
//! an `Arc` so clones observe the same state. After every mutation the remote
//! checks that no final-named job directory is missing its files, and records
//! a violation if one is.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::QueueError;
use crate::group::Destination;
use crate::job::{META_FILE_NAME, TEMP_DIR_PREFIX};
use crate::transfer::session::{Connector, Credential};
use crate::transfer::sftp_like::SftpLike;

/// Failure injection points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOn {
    Mkdir,
    /// Writes to a file with this basename fail after creation.
    WriteFile(String),
    Rename,
    /// Every remove and rmdir fails.
    Cleanup,
}

#[derive(Debug, Default)]
struct State {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    fail: Vec<FailOn>,
    writes: Vec<String>,
    violations: Vec<String>,
    shutdowns: usize,
}

impl State {
    fn check_final_dirs(&mut self) {
        let finals: Vec<String> = self
            .dirs
            .iter()
            .filter(|d| basename(d).starts_with("job_"))
            .cloned()
            .collect();
        for dir in finals {
            let prefix = format!("{}/", dir);
            let names: Vec<&str> = self
                .files
                .keys()
                .filter_map(|f| f.strip_prefix(&prefix))
                .collect();
            let has_meta = names.contains(&META_FILE_NAME);
            let has_payload = names.iter().any(|n| *n != META_FILE_NAME);
            if !has_meta || !has_payload {
                self.violations.push(format!("{} observable with files {:?}", dir, names));
            }
        }
    }
}

fn basename(p: &str) -> &str {
    p.rsplit('/').next().unwrap_or(p)
}

fn parent(p: &str) -> &str {
    match p.rfind('/') {
        Some(0) => "/",
        Some(i) => &p[..i],
        None => "",
    }
}

fn key(p: &Path) -> String {
    crate::transfer::normalize_path(&p.to_string_lossy(), false)
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn with_dirs(dirs: &[&str]) -> Self {
        let remote = MemoryRemote::default();
        {
            let mut st = remote.lock();
            for d in dirs {
                st.dirs.insert(crate::transfer::normalize_path(d, false));
            }
        }
        remote
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn failing(&self, f: &FailOn) -> bool {
        self.lock().fail.contains(f)
    }

    pub fn fail_on(&self, f: FailOn) {
        self.lock().fail.push(f);
    }

    pub fn clear_failures(&self) {
        self.lock().fail.clear();
    }

    pub fn has_dir(&self, p: &str) -> bool {
        self.lock().dirs.contains(p)
    }

    pub fn file(&self, p: &str) -> Option<Vec<u8>> {
        self.lock().files.get(p).cloned()
    }

    /// Files and directories strictly below `dir`.
    pub fn entries_under(&self, dir: &str) -> Vec<String> {
        let st = self.lock();
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        st.dirs
            .iter()
            .chain(st.files.keys())
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Final-named job directories directly inside `queue_dir`.
    pub fn job_dirs(&self, queue_dir: &str) -> Vec<String> {
        let st = self.lock();
        st.dirs
            .iter()
            .filter(|d| parent(d) == queue_dir && basename(d).starts_with("job_"))
            .cloned()
            .collect()
    }

    /// Staged `tmp_` directories directly inside `queue_dir`.
    pub fn temp_dirs(&self, queue_dir: &str) -> Vec<String> {
        let st = self.lock();
        st.dirs
            .iter()
            .filter(|d| parent(d) == queue_dir && basename(d).starts_with(TEMP_DIR_PREFIX))
            .cloned()
            .collect()
    }

    /// Paths opened for writing, in order.
    pub fn write_order(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Moments at which a final-named directory was visible without its files.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.lock().shutdowns
    }
}

struct MemoryWriter {
    remote: MemoryRemote,
    path: String,
    fail: bool,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated remote write failure"));
        }
        let mut st = self.remote.lock();
        match st.files.get_mut(&self.path) {
            Some(data) => data.extend_from_slice(buf),
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SftpLike for MemoryRemote {
    fn mkdir(&self, p: &Path, _mode: i32) -> Result<(), String> {
        if self.failing(&FailOn::Mkdir) {
            return Err("simulated mkdir failure".into());
        }
        let path = key(p);
        let mut st = self.lock();
        if st.dirs.contains(&path) || st.files.contains_key(&path) {
            return Err(format!("{} already exists", path));
        }
        if !st.dirs.contains(parent(&path)) {
            return Err(format!("no such directory: {}", parent(&path)));
        }
        st.dirs.insert(path);
        st.check_final_dirs();
        Ok(())
    }

    fn create_write(&self, p: &Path) -> Result<Box<dyn Write + Send + '_>, String> {
        let path = key(p);
        let fail = {
            let st = self.lock();
            st.fail.iter().any(|f| matches!(f, FailOn::WriteFile(n) if n == basename(&path)))
        };
        let mut st = self.lock();
        if !st.dirs.contains(parent(&path)) {
            return Err(format!("no such directory: {}", parent(&path)));
        }
        st.files.insert(path.clone(), Vec::new());
        st.writes.push(path.clone());
        st.check_final_dirs();
        Ok(Box::new(MemoryWriter { remote: self.clone(), path, fail }))
    }

    fn remove_file(&self, p: &Path) -> Result<(), String> {
        if self.failing(&FailOn::Cleanup) {
            return Err("simulated remove failure".into());
        }
        let path = key(p);
        let mut st = self.lock();
        if st.files.remove(&path).is_none() {
            return Err(format!("no such file: {}", path));
        }
        st.check_final_dirs();
        Ok(())
    }

    fn rmdir(&self, p: &Path) -> Result<(), String> {
        if self.failing(&FailOn::Cleanup) {
            return Err("simulated rmdir failure".into());
        }
        let path = key(p);
        let mut st = self.lock();
        let prefix = format!("{}/", path);
        if st.dirs.iter().chain(st.files.keys()).any(|e| e.starts_with(&prefix)) {
            return Err(format!("directory not empty: {}", path));
        }
        if !st.dirs.remove(&path) {
            return Err(format!("no such directory: {}", path));
        }
        st.check_final_dirs();
        Ok(())
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), String> {
        if self.failing(&FailOn::Rename) {
            return Err("mv exited with status 1: Permission denied".into());
        }
        let (from, to) = (key(from), key(to));
        let mut st = self.lock();
        if !st.dirs.contains(&from) {
            return Err(format!("no such directory: {}", from));
        }
        if st.dirs.contains(&to) || st.files.contains_key(&to) {
            return Err(format!("{} already exists", to));
        }
        let old_prefix = format!("{}/", from);
        let moved_dirs: Vec<String> =
            st.dirs.iter().filter(|d| **d == from || d.starts_with(&old_prefix)).cloned().collect();
        for d in moved_dirs {
            st.dirs.remove(&d);
            st.dirs.insert(format!("{}{}", to, &d[from.len()..]));
        }
        let moved_files: Vec<String> =
            st.files.keys().filter(|f| f.starts_with(&old_prefix)).cloned().collect();
        for f in moved_files {
            if let Some(data) = st.files.remove(&f) {
                st.files.insert(format!("{}{}", to, &f[from.len()..]), data);
            }
        }
        st.check_final_dirs();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.lock().shutdowns += 1;
    }
}

/// Hands out one `MemoryRemote` per host, creating each with `base_dirs`.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    base_dirs: Vec<String>,
    remotes: Arc<Mutex<HashMap<String, MemoryRemote>>>,
    unreachable: HashSet<String>,
    reject_auth: bool,
    attempts: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnector {
    pub fn new(base_dirs: &[&str]) -> Self {
        MemoryConnector { base_dirs: base_dirs.iter().map(|d| d.to_string()).collect(), ..Default::default() }
    }

    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    pub fn reject_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    /// The remote for `host`, created on first use.
    pub fn remote(&self, host: &str) -> MemoryRemote {
        let mut remotes = self.remotes.lock().unwrap_or_else(|p| p.into_inner());
        remotes
            .entry(host.to_string())
            .or_insert_with(|| {
                let dirs: Vec<&str> = self.base_dirs.iter().map(String::as_str).collect();
                MemoryRemote::with_dirs(&dirs)
            })
            .clone()
    }

    /// Addresses connected to, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, dest: &Destination, cred: &Credential) -> Result<Box<dyn SftpLike>, QueueError> {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner()).push(dest.addr());
        if self.unreachable.contains(&dest.host) {
            return Err(QueueError::SshConnectFailed(dest.addr(), "connection refused".into()));
        }
        if self.reject_auth {
            return Err(QueueError::SshAuthFailed(format!("{}@{}", cred.username(), dest.addr())));
        }
        Ok(Box::new(self.remote(&dest.host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_moves_whole_tree() {
        let r = MemoryRemote::with_dirs(&["/q"]);
        r.mkdir(Path::new("/q/tmp_job_1"), 0o755).unwrap();
        r.create_write(Path::new("/q/tmp_job_1/meta.json")).unwrap().write_all(b"{}").unwrap();
        r.create_write(Path::new("/q/tmp_job_1/a.zip")).unwrap().write_all(b"z").unwrap();
        r.rename_dir(Path::new("/q/tmp_job_1"), Path::new("/q/job_1")).unwrap();
        assert_eq!(r.job_dirs("/q"), vec!["/q/job_1".to_string()]);
        assert!(r.temp_dirs("/q").is_empty());
        assert_eq!(r.file("/q/job_1/a.zip").unwrap(), b"z");
        assert!(r.violations().is_empty());
    }

    #[test]
    fn writing_straight_into_a_final_dir_is_a_violation() {
        let r = MemoryRemote::with_dirs(&["/q"]);
        r.mkdir(Path::new("/q/job_1"), 0o755).unwrap();
        assert_eq!(r.violations().len(), 1);
    }

    #[test]
    fn rename_refuses_existing_target() {
        let r = MemoryRemote::with_dirs(&["/q", "/q/tmp_job_1", "/q/job_1"]);
        assert!(r.rename_dir(Path::new("/q/tmp_job_1"), Path::new("/q/job_1")).is_err());
    }

    #[test]
    fn rmdir_requires_empty_directory() {
        let r = MemoryRemote::with_dirs(&["/q", "/q/d"]);
        r.create_write(Path::new("/q/d/f")).unwrap();
        assert!(r.rmdir(Path::new("/q/d")).is_err());
        r.remove_file(Path::new("/q/d/f")).unwrap();
        r.rmdir(Path::new("/q/d")).unwrap();
        assert!(r.entries_under("/q").is_empty());
    }
}
