use anyhow::Result;
use clap::Parser;

use hostqueue::cli::{Cli, Commands};
use hostqueue::commands;
use hostqueue::config::Config;

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let _guard = hostqueue::util::init_tracing(cli.verbose, &config.logs_dir)?;
    tracing::debug!("[main] loaded {} with {} site(s)", cli.config.display(), config.sites.len());

    match cli.command {
        Commands::Run { parallel_hosts, skip_stage, dry_run } => {
            commands::handle_run(&config, parallel_hosts, skip_stage, dry_run)
        }
        Commands::Push { parallel_hosts, delete } => commands::handle_push(&config, parallel_hosts, delete),
        Commands::Sync { parallel_hosts } => commands::handle_sync(&config, parallel_hosts),
        Commands::Report { show } => commands::handle_report(&config, show),
        Commands::Sites {} => commands::handle_sites(&config),
    }
}
