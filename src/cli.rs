use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(long, global = true, default_value = "config.json", help = "Configuration file")]
    pub config: PathBuf,
    #[clap(short, long, global = true, help = "Also write debug logs to <logs_dir>/hq.log")]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Stage artifacts and queue them with the admin SSH keys", display_order = 1)]
    Run {
        #[clap(long, help = "Process independent hosts concurrently")]
        parallel_hosts: bool,
        #[clap(long, help = "Only process what is already in the staging directory")]
        skip_stage: bool,
        #[clap(long, help = "Show what would be queued without connecting")]
        dry_run: bool,
    },
    #[clap(about = "Queue artifacts from the input directory with a VPS password", display_order = 2)]
    Push {
        #[clap(long, help = "Process independent hosts concurrently")]
        parallel_hosts: bool,
        #[clap(long, help = "Delete local archives once queued")]
        delete: bool,
    },
    #[clap(about = "Queue artifacts not yet recorded in each site's upload ledger", display_order = 3)]
    Sync {
        #[clap(long, help = "Process independent hosts concurrently")]
        parallel_hosts: bool,
    },
    #[clap(about = "Regenerate the cumulative report, or print it with --show", display_order = 4)]
    Report {
        #[clap(long, help = "Print the current report without changing it")]
        show: bool,
    },
    #[clap(about = "List configured site bindings", name = "sites", display_order = 5)]
    Sites {},
}
