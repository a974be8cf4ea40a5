use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::QueueError;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// other platforms support ANSI out of the box
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    true
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Byte progress bar for one payload upload; hidden when `visible` is false.
pub fn payload_progress(len: u64, name: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::with_template(
            "{msg:24!} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12}",
        )
        .expect("valid payload template")
        .progress_chars("=> "),
    );
    pb.set_message(name.to_string());
    pb
}

pub fn ok_line(filename: &str, host: &str) -> String {
    let line = format!("[OK] {} -> {}", filename, host);
    if try_enable_ansi_on_windows() { line.green().to_string() } else { line }
}

pub fn err_line(filename: &str, reason: &str) -> String {
    let line = format!("[ERR] {} ({})", filename, reason);
    if try_enable_ansi_on_windows() { line.red().to_string() } else { line }
}

/// Print a concise summary line for a finished run.
pub fn print_summary(activated: usize, failed: usize, total_bytes: u64, elapsed_secs: f64) {
    let rate = if elapsed_secs > 0.0 { total_bytes as f64 / 1024.0 / 1024.0 / elapsed_secs } else { 0.0 };
    let counts = format!("{} queued, {} failed", activated, failed);
    let counts = if !try_enable_ansi_on_windows() {
        counts
    } else if failed > 0 {
        counts.yellow().to_string()
    } else {
        counts.green().to_string()
    };
    println!(
        "{} | {} in {:.2}s ({:.2} MB/s)",
        counts,
        human_bytes(total_bytes),
        elapsed_secs,
        rate
    );
}

/// Append a run's failures to `<logs_dir>/failures.jsonl`, one object per line.
pub fn write_failures_jsonl(logs_dir: &Path, failures: &[(String, QueueError)]) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create directory {}", logs_dir.display()))?;
    let path = logs_dir.join("failures.jsonl");
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let at = Utc::now().to_rfc3339();
    for (subject, err) in failures {
        let obj = serde_json::json!({
            "at": at,
            "subject": subject,
            "variant": err.variant(),
            "message": err.to_string(),
        });
        writeln!(f, "{}", obj).with_context(|| format!("append to {}", path.display()))?;
    }
    Ok(())
}

/// Warnings always reach stderr. With `verbose`, everything down to `debug`
/// (or `RUST_LOG`) also goes to `<logs_dir>/hq.log`. Keep the guard alive
/// until exit so buffered lines are flushed.
pub fn init_tracing(verbose: bool, logs_dir: &Path) -> Result<Option<WorkerGuard>> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(LevelFilter::WARN);

    if !verbose {
        tracing_subscriber::registry().with(console).try_init().context("install logger")?;
        return Ok(None);
    }

    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create directory {}", logs_dir.display()))?;
    let appender = tracing_appender::rolling::never(logs_dir, "hq.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter);
    tracing_subscriber::registry().with(console).with(file).try_init().context("install logger")?;
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn failures_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let failures = vec![
            ("a.zip".to_string(), QueueError::NoBinding("a.zip".into())),
            ("h1:22".to_string(), QueueError::SshAuthFailed("h1:22".into())),
        ];
        write_failures_jsonl(dir.path(), &failures).unwrap();
        write_failures_jsonl(dir.path(), &failures[..1]).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("failures.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> =
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["variant"], "NoBinding");
        assert_eq!(lines[1]["subject"], "h1:22");
    }

    #[test]
    fn result_lines_name_the_file() {
        assert!(ok_line("a.zip", "h1").contains("[OK] a.zip -> h1"));
        assert!(err_line("a.zip", "boom").contains("[ERR] a.zip (boom)"));
    }
}
