use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, TimeZone};
use hostqueue::QueueError;
use hostqueue::config::Config;
use hostqueue::group::Destination;
use hostqueue::notify::RecordingNotifier;
use hostqueue::pipeline::{Pipeline, RunEntry, RunMode, RunOptions, RunSummary};
use hostqueue::site::SiteBinding;
use hostqueue::transfer::memory::{FailOn, MemoryConnector};
use hostqueue::transfer::{AdminKeys, Connector, Credential, CredentialSource, SftpLike, SharedPassword};

const QUEUE: &str = "/srv/queue";

struct Fixture {
    dir: tempfile::TempDir,
    config: Config,
    env: HashMap<String, String>,
    connector: MemoryConnector,
    notifier: RecordingNotifier,
}

fn site(prefix: &str, scope: &str, author: Option<&str>) -> SiteBinding {
    let mut s = SiteBinding::new(prefix, scope);
    s.wp_path = Some(format!("/var/www/{}", prefix));
    s.wp_author = author.map(str::to_string);
    s
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut config = Config::with_queue_dir(QUEUE);
    config.default_user_author = Some("bob".into());
    config.source_dir = root.join("out");
    config.staging_dir = root.join("Processing");
    config.input_dir = root.join("InputZip");
    config.report_path = root.join("upload.log");
    config.report_state_path = root.join("report_state.json");
    config.ledger_dir = root.to_path_buf();
    config.logs_dir = root.join("logs");
    config.sites = vec![site("site1", "SITE1", Some("alice")), site("shop", "SHOP", None)];
    std::fs::create_dir_all(&config.source_dir).unwrap();
    std::fs::create_dir_all(&config.input_dir).unwrap();

    let env: HashMap<String, String> = [
        ("SITE1_VPS_HOST", "h1"),
        ("SITE1_VPS_PORT", "22"),
        ("SHOP_VPS_HOST", "h2"),
        ("SHOP_VPS_PORT", "2222"),
        ("VPS_USERNAME", "ops"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    Fixture {
        dir,
        config,
        env,
        connector: MemoryConnector::new(&["/srv", QUEUE]),
        notifier: RecordingNotifier::default(),
    }
}

fn report_day(day: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(7 * 3600).unwrap().with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
}

fn put(dir: &Path, name: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, format!("archive {}", name)).unwrap();
    p
}

impl Fixture {
    fn run_with(
        &self,
        mode: RunMode,
        opts: RunOptions,
        creds: &dyn CredentialSource,
        ts: i64,
    ) -> RunSummary {
        Pipeline::new(&self.config, &self.env, &self.connector, creds, &self.notifier)
            .with_clock(move || ts)
            .with_report_time(report_day(5))
            .run(mode, &opts)
            .unwrap()
    }

    fn run(&self, mode: RunMode, ts: i64) -> RunSummary {
        self.run_with(mode, RunOptions::default(), &AdminKeys, ts)
    }
}

fn failed_files(s: &RunSummary) -> Vec<String> {
    s.entries
        .iter()
        .filter_map(|e| match e {
            RunEntry::Failed { filename, .. } => Some(filename.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn admin_run_queues_artifact_and_cleans_local_state() {
    let f = fixture();
    put(&f.config.source_dir, "site1.alice.zip");

    let s = f.run(RunMode::Admin, 1_700_000_000);
    assert_eq!(s.queued(), 1, "{:?}", s.entries);
    assert!(s.failures.is_empty());

    let remote = f.connector.remote("h1");
    let final_dir = "/srv/queue/job_1700000000_alice_site1.alic";
    assert_eq!(remote.job_dirs(QUEUE), vec![final_dir.to_string()]);
    assert!(remote.temp_dirs(QUEUE).is_empty());
    assert_eq!(
        remote.file(&format!("{}/site1.alice.zip", final_dir)).unwrap(),
        b"archive site1.alice.zip"
    );
    let meta: serde_json::Value =
        serde_json::from_slice(&remote.file(&format!("{}/meta.json", final_dir)).unwrap()).unwrap();
    assert_eq!(meta["wp_author"], "alice");
    assert_eq!(meta["wp_path"], "/var/www/site1");
    assert_eq!(meta["zip_filename"], "site1.alice.zip");
    assert_eq!(meta["prefix"], "site1");

    // local artifact gone from source and staging, scratch metadata removed
    assert!(std::fs::read_dir(&f.config.source_dir).unwrap().next().is_none());
    assert!(std::fs::read_dir(&f.config.staging_dir).unwrap().next().is_none());

    let report = s.report.unwrap();
    assert_eq!(report.state.totals.get("site1"), Some(&1));
    let sent = f.notifier.messages();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("[OK] site1.alice.zip -> h1"));
    assert!(sent[0].contains("site1: 1 images: Total 1"));
    assert!(sent[0].contains("Upload succeeded."));

    assert!(remote.violations().is_empty());
    assert_eq!(remote.shutdowns(), 1);
}

#[test]
fn rename_failure_keeps_artifact_and_retry_gets_fresh_id() {
    let f = fixture();
    put(&f.config.source_dir, "site1.alice.zip");
    let remote = f.connector.remote("h1");
    remote.fail_on(FailOn::Rename);

    let s = f.run(RunMode::Admin, 100);
    assert_eq!(s.queued(), 0);
    assert_eq!(failed_files(&s), vec!["site1.alice.zip".to_string()]);
    assert!(matches!(s.failures[0].1, QueueError::ActivateFailed(_, _)));
    assert!(remote.job_dirs(QUEUE).is_empty());
    assert!(remote.temp_dirs(QUEUE).is_empty());
    assert!(remote.entries_under(QUEUE).is_empty());
    let left: Vec<_> = std::fs::read_dir(&f.config.staging_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, vec!["site1.alice.zip".to_string()]);
    assert!(f.notifier.messages()[0].contains("[ERR] site1.alice.zip"));

    let log = std::fs::read_to_string(f.config.logs_dir.join("failures.jsonl")).unwrap();
    assert!(log.contains("\"variant\":\"ActivateFailed\""));

    remote.clear_failures();
    let s = f.run(RunMode::Admin, 101);
    assert_eq!(s.queued(), 1);
    assert_eq!(remote.job_dirs(QUEUE), vec!["/srv/queue/job_101_alice_site1.alic".to_string()]);
    assert!(!f.config.staging_dir.join("site1.alice.zip").exists());
    assert!(remote.violations().is_empty());
}

#[test]
fn payload_failure_rolls_back_and_next_job_still_runs() {
    let f = fixture();
    put(&f.config.source_dir, "site1.a.zip");
    put(&f.config.source_dir, "site1.b.zip");
    let remote = f.connector.remote("h1");
    remote.fail_on(FailOn::WriteFile("site1.a.zip".into()));

    let s = f.run(RunMode::Admin, 7);
    assert_eq!(s.queued(), 1);
    assert_eq!(failed_files(&s), vec!["site1.a.zip".to_string()]);
    assert_eq!(remote.job_dirs(QUEUE), vec!["/srv/queue/job_7_alice_site1.b.zi".to_string()]);
    assert!(remote.temp_dirs(QUEUE).is_empty());
    assert!(f.config.staging_dir.join("site1.a.zip").exists());
    assert!(!f.config.staging_dir.join("site1.b.zip").exists());
}

#[test]
fn connection_failure_abandons_only_that_host() {
    let mut f = fixture();
    f.connector = MemoryConnector::new(&["/srv", QUEUE]).unreachable("h2");
    put(&f.config.source_dir, "site1.a.zip");
    put(&f.config.source_dir, "shop.b.zip");
    put(&f.config.source_dir, "shop.c.zip");

    let s = f.run(RunMode::Admin, 9);
    assert_eq!(s.queued(), 1);
    assert_eq!(failed_files(&s), vec!["shop.b.zip".to_string(), "shop.c.zip".to_string()]);
    assert!(
        s.failures
            .iter()
            .any(|(who, e)| who == "h2:2222" && matches!(e, QueueError::SshConnectFailed(_, _)))
    );
    assert!(f.connector.remote("h2").entries_under(QUEUE).is_empty());
    assert!(f.config.staging_dir.join("shop.b.zip").exists());
    assert!(f.config.staging_dir.join("shop.c.zip").exists());
    assert_eq!(s.report.unwrap().state.totals.get("shop"), None);
}

#[test]
fn auth_failure_attempts_no_job() {
    let mut f = fixture();
    f.connector = MemoryConnector::new(&["/srv", QUEUE]).reject_auth();
    put(&f.config.source_dir, "site1.a.zip");

    let s = f.run(RunMode::Admin, 9);
    assert_eq!(s.queued(), 0);
    assert!(matches!(s.failures[0].1, QueueError::SshAuthFailed(_)));
    assert!(f.connector.remote("h1").entries_under(QUEUE).is_empty());
    assert!(f.config.staging_dir.join("site1.a.zip").exists());
    let report = s.report.unwrap();
    assert!(report.text.ends_with("Upload failed or no new files."));
}

#[test]
fn unresolvable_artifacts_stay_in_staging() {
    let mut f = fixture();
    f.config.sites.push(site("blog", "BLOG", Some("carol")));
    put(&f.config.source_dir, "other.zip");
    put(&f.config.source_dir, "blog.post.zip");
    put(&f.config.source_dir, "notes.txt");

    let s = f.run(RunMode::Admin, 1);
    assert_eq!(s.queued(), 0);
    assert!(s.failures.contains(&("other.zip".to_string(), QueueError::NoBinding("other.zip".into()))));
    assert!(s.failures.contains(&("blog.post.zip".to_string(), QueueError::HostUnresolved("BLOG".into()))));
    assert!(f.config.staging_dir.join("other.zip").exists());
    assert!(f.config.staging_dir.join("blog.post.zip").exists());
    // only eligible artifacts are staged
    assert!(f.config.source_dir.join("notes.txt").exists());
    assert!(f.connector.attempts().is_empty());
}

#[test]
fn same_second_truncation_collision_gets_suffix() {
    let f = fixture();
    put(&f.config.source_dir, "site1.alice_a.zip");
    put(&f.config.source_dir, "site1.alice_b.zip");

    let s = f.run(RunMode::Admin, 42);
    assert_eq!(s.queued(), 2);
    assert_eq!(
        f.connector.remote("h1").job_dirs(QUEUE),
        vec![
            "/srv/queue/job_42_alice_site1.alic".to_string(),
            "/srv/queue/job_42_alice_site1.alic_2".to_string()
        ]
    );
}

#[test]
fn ledger_mode_skips_recorded_files_and_keeps_sources() {
    let f = fixture();
    put(&f.config.source_dir, "site1.a.zip");
    put(&f.config.source_dir, "site1.b.zip");
    let ledger = f.config.ledger_path("site1");
    std::fs::write(&ledger, "site1.a.zip\n").unwrap();

    let s = f.run(RunMode::Ledger, 5);
    assert_eq!(s.queued(), 1);
    assert!(s.entries.contains(&RunEntry::Skipped { filename: "site1.a.zip".into() }));
    assert_eq!(std::fs::read_to_string(&ledger).unwrap(), "site1.a.zip\nsite1.b.zip\n");
    assert!(f.config.source_dir.join("site1.a.zip").exists());
    assert!(f.config.source_dir.join("site1.b.zip").exists());
    assert!(!f.config.staging_dir.exists());

    let again = f.run(RunMode::Ledger, 6);
    assert_eq!(again.queued(), 0);
    assert_eq!(again.entries.len(), 2);
    assert_eq!(f.connector.remote("h1").job_dirs(QUEUE).len(), 1);
    let report = again.report.unwrap();
    assert_eq!(report.state.totals.get("site1"), Some(&1));
    assert!(report.text.ends_with("No new files were uploaded."));
}

#[test]
fn user_mode_uses_default_identity_and_keeps_archives() {
    let f = fixture();
    let archive = put(&f.config.input_dir, "site1.x.zip");
    let creds = SharedPassword::new("ops", "secret");

    let s = f.run_with(RunMode::User, RunOptions::default(), &creds, 3);
    assert_eq!(s.queued(), 1);
    let remote = f.connector.remote("h1");
    let meta: serde_json::Value = serde_json::from_slice(
        &remote.file("/srv/queue/job_3_bob_site1.x.zi/meta.json").unwrap(),
    )
    .unwrap();
    assert_eq!(meta["wp_author"], "bob");
    assert!(archive.exists());

    let second = put(&f.config.input_dir, "shop.y.zip");
    std::fs::remove_file(&archive).unwrap();
    let opts = RunOptions { delete_after_upload: true, ..Default::default() };
    let s = f.run_with(RunMode::User, opts, &creds, 4);
    assert_eq!(s.queued(), 1);
    assert!(!second.exists());
}

#[test]
fn telegram_credentials_pass_through_to_metadata() {
    let mut f = fixture();
    f.env.insert("TELEGRAM_BOT_TOKEN".into(), "123:ABC".into());
    f.env.insert("TELEGRAM_CHAT_ID".into(), "-100".into());
    put(&f.config.source_dir, "shop.z.zip");

    f.run(RunMode::Admin, 8);
    let meta: serde_json::Value = serde_json::from_slice(
        &f.connector.remote("h2").file("/srv/queue/job_8_bob_shop.z.zip/meta.json").unwrap(),
    )
    .unwrap();
    assert_eq!(meta["telegram_bot_token"], "123:ABC");
    assert_eq!(meta["telegram_chat_id"], "-100");
}

#[test]
fn parallel_hosts_queue_every_group() {
    let f = fixture();
    for name in ["site1.a.zip", "shop.b.zip", "site1.c.zip", "shop.d.zip"] {
        put(&f.config.source_dir, name);
    }
    let opts = RunOptions { parallel_hosts: true, ..Default::default() };
    let s = f.run_with(RunMode::Admin, opts, &AdminKeys, 11);
    assert_eq!(s.queued(), 4);
    assert_eq!(f.connector.remote("h1").job_dirs(QUEUE).len(), 2);
    assert_eq!(f.connector.remote("h2").job_dirs(QUEUE).len(), 2);
    assert!(f.connector.remote("h1").violations().is_empty());
    assert!(f.connector.remote("h2").violations().is_empty());
    assert_eq!(s.report.unwrap().state.totals.get("shop"), Some(&2));
    // results keep group order: shop (h2) sorts first
    match &s.entries[0] {
        RunEntry::Queued { host, .. } => assert_eq!(host, "h2"),
        other => panic!("unexpected entry {:?}", other),
    }
}

#[test]
fn dry_run_touches_nothing() {
    let f = fixture();
    put(&f.config.source_dir, "site1.a.zip");
    std::fs::create_dir_all(&f.config.staging_dir).unwrap();
    put(&f.config.staging_dir, "shop.b.zip");

    let opts = RunOptions { dry_run: true, ..Default::default() };
    let s = f.run_with(RunMode::Admin, opts, &AdminKeys, 1);
    assert_eq!(s.queued(), 0);
    assert!(s.entries.contains(&RunEntry::Planned {
        filename: "shop.b.zip".into(),
        host: "h2".into(),
        job_id: "job_1_bob_shop.b.zip".into()
    }));
    // unstaged source files are planned as a real run would stage them
    assert!(s.entries.contains(&RunEntry::Planned {
        filename: "site1.a.zip".into(),
        host: "h1".into(),
        job_id: "job_1_alice_site1.a.zi".into()
    }));
    assert_eq!(s.entries.len(), 2);
    assert!(f.connector.attempts().is_empty());
    assert!(f.config.source_dir.join("site1.a.zip").exists());
    assert!(!f.config.staging_dir.join("site1.a.zip").exists());
    assert!(!f.config.report_path.exists());
    assert!(f.notifier.messages().is_empty());

    let opts = RunOptions { dry_run: true, skip_stage: true, ..Default::default() };
    let s = f.run_with(RunMode::Admin, opts, &AdminKeys, 1);
    assert_eq!(s.entries.len(), 1);
    drop(f.dir);
}

#[test]
fn staged_name_clash_leaves_source_copy_and_sends_staged_one() {
    let f = fixture();
    std::fs::create_dir_all(&f.config.staging_dir).unwrap();
    put(&f.config.staging_dir, "site1.a.zip");
    put(&f.config.source_dir, "site1.a.zip");

    let s = f.run(RunMode::Admin, 12);
    assert_eq!(s.queued(), 1);
    assert!(matches!(s.failures[0].1, QueueError::StageMoveFailed(_, _)));
    assert!(f.config.source_dir.join("site1.a.zip").exists());
    assert!(!f.config.staging_dir.join("site1.a.zip").exists());
}

// Snapshots a ledger file every time a job's temp directory is created.
struct LedgerSnapshots {
    inner: Box<dyn SftpLike>,
    ledger: PathBuf,
    seen: Arc<Mutex<Vec<String>>>,
}

impl SftpLike for LedgerSnapshots {
    fn mkdir(&self, p: &Path, mode: i32) -> Result<(), String> {
        let on_disk = std::fs::read_to_string(&self.ledger).unwrap_or_default();
        self.seen.lock().unwrap().push(on_disk);
        self.inner.mkdir(p, mode)
    }

    fn create_write(&self, p: &Path) -> Result<Box<dyn Write + Send + '_>, String> {
        self.inner.create_write(p)
    }

    fn remove_file(&self, p: &Path) -> Result<(), String> {
        self.inner.remove_file(p)
    }

    fn rmdir(&self, p: &Path) -> Result<(), String> {
        self.inner.rmdir(p)
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), String> {
        self.inner.rename_dir(from, to)
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

struct SnapshottingConnector {
    inner: MemoryConnector,
    ledger: PathBuf,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Connector for SnapshottingConnector {
    fn connect(&self, dest: &Destination, cred: &Credential) -> Result<Box<dyn SftpLike>, QueueError> {
        let inner = self.inner.connect(dest, cred)?;
        Ok(Box::new(LedgerSnapshots { inner, ledger: self.ledger.clone(), seen: self.seen.clone() }))
    }
}

#[test]
fn ledger_line_is_written_before_the_next_job_starts() {
    let f = fixture();
    put(&f.config.source_dir, "site1.a.zip");
    put(&f.config.source_dir, "site1.b.zip");
    put(&f.config.source_dir, "site1.c.zip");
    let ledger = f.config.ledger_path("site1");
    let connector = SnapshottingConnector {
        inner: f.connector.clone(),
        ledger: ledger.clone(),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    f.connector.remote("h1").fail_on(FailOn::WriteFile("site1.b.zip".into()));

    let s = Pipeline::new(&f.config, &f.env, &connector, &AdminKeys, &f.notifier)
        .with_clock(|| 30)
        .with_report_time(report_day(5))
        .run(RunMode::Ledger, &RunOptions::default())
        .unwrap();
    assert_eq!(s.queued(), 2);
    assert_eq!(
        *connector.seen.lock().unwrap(),
        vec![String::new(), "site1.a.zip\n".to_string(), "site1.a.zip\n".to_string()]
    );
    assert_eq!(std::fs::read_to_string(&ledger).unwrap(), "site1.a.zip\nsite1.c.zip\n");
}

#[test]
fn meta_failure_leaves_queue_empty_and_artifact_staged() {
    let f = fixture();
    put(&f.config.source_dir, "site1.alice.zip");
    let remote = f.connector.remote("h1");
    remote.fail_on(FailOn::WriteFile("meta.json".into()));

    let s = f.run(RunMode::Admin, 50);
    assert_eq!(s.queued(), 0);
    assert!(matches!(s.failures[0].1, QueueError::MetaUploadFailed(_, _)));
    assert!(remote.entries_under(QUEUE).is_empty());
    assert!(remote.violations().is_empty());
    assert!(f.config.staging_dir.join("site1.alice.zip").exists());
}
