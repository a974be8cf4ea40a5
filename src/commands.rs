use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};

use crate::config::{Config, EnvSource, ProcessEnv};
use crate::notify::notifier_from_env;
use crate::pipeline::{Pipeline, RunEntry, RunMode, RunOptions, RunSummary};
use crate::report::ReportEngine;
use crate::site::show_table;
use crate::transfer::{AdminKeys, SharedPassword, Ssh2Connector};
use crate::util::{err_line, ok_line, print_summary};

fn print_run(summary: &RunSummary) {
    for entry in &summary.entries {
        match entry {
            RunEntry::Queued { filename, host, .. } => println!("{}", ok_line(filename, host)),
            RunEntry::Failed { filename, reason } => println!("{}", err_line(filename, reason)),
            other => println!("{}", other),
        }
    }
    if let Some(report) = &summary.report {
        println!("\n{}", report.text);
    }
    print_summary(summary.queued(), summary.failed(), summary.bytes, summary.elapsed.as_secs_f64());
}

fn run_with_keys(config: &Config, mode: RunMode, opts: RunOptions) -> Result<()> {
    let env = ProcessEnv;
    let connector = Ssh2Connector::from_config(config);
    let notifier = notifier_from_env(&env);
    let pipeline = Pipeline::new(config, &env, &connector, &AdminKeys, notifier.as_ref());
    let summary = pipeline.run(mode, &opts)?;
    print_run(&summary);
    Ok(())
}

pub fn handle_run(config: &Config, parallel_hosts: bool, skip_stage: bool, dry_run: bool) -> Result<()> {
    let opts = RunOptions { parallel_hosts, skip_stage, dry_run, delete_after_upload: false, progress: true };
    run_with_keys(config, RunMode::Admin, opts)
}

pub fn handle_sync(config: &Config, parallel_hosts: bool) -> Result<()> {
    let opts = RunOptions { parallel_hosts, progress: true, ..Default::default() };
    run_with_keys(config, RunMode::Ledger, opts)
}

pub fn handle_push(config: &Config, parallel_hosts: bool, delete: bool) -> Result<()> {
    let env = ProcessEnv;
    let Some(username) = env.var("VPS_USERNAME") else {
        bail!("VPS_USERNAME must be set (environment or .env) for push");
    };
    if config.default_author().is_none() {
        bail!("'default_user_author' must be set in the configuration for push");
    }
    let password = match env.var("VPS_PASSWORD") {
        Some(p) => p,
        None => dialoguer::Password::new()
            .with_prompt(format!("VPS password for '{}'", username))
            .interact()
            .context("read VPS password")?,
    };
    if password.is_empty() {
        bail!("a VPS password is required");
    }

    let connector = Ssh2Connector::from_config(config);
    let credentials = SharedPassword::new(username, password);
    let notifier = notifier_from_env(&env);
    let pipeline = Pipeline::new(config, &env, &connector, &credentials, notifier.as_ref());
    let opts = RunOptions { parallel_hosts, delete_after_upload: delete, progress: true, ..Default::default() };
    let summary = pipeline.run(RunMode::User, &opts)?;
    print_run(&summary);
    Ok(())
}

pub fn handle_report(config: &Config, show: bool) -> Result<()> {
    if show {
        match std::fs::read_to_string(&config.report_path) {
            Ok(text) => println!("{}", text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                println!("No report yet at {}", config.report_path.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", config.report_path.display()));
            }
        }
        return Ok(());
    }
    let engine = ReportEngine::new(&config.report_path, &config.report_state_path, config.report_offset());
    let report = engine.run(&BTreeMap::new())?;
    println!("{}", report.text);
    Ok(())
}

pub fn handle_sites(config: &Config) -> Result<()> {
    show_table(&config.sites, config.default_author())
}
