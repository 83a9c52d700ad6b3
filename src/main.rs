use std::io::{self, Write};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use headline_lab::cli::{self, Args};
use headline_lab::config::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(db) = args.db {
        config.db_path = db;
    }

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    cli::run(args.command, &config, stdin.lock(), &mut stdout)?;
    stdout.flush()?;
    Ok(())
}
