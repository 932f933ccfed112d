mod backup;
mod config;
mod dedup;
mod entry;
mod hashing;
mod metadata;
mod owners;
mod restore;
mod store;
mod tarstream;
mod walker;

#[cfg(test)]
mod tests;

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::{Level, LevelFilter, error};

use crate::config::Config;
use crate::restore::Restorer;
use crate::store::{GroupStore, Observers};

/// A deduplicating filesystem backup tool with group-based retention
#[derive(Parser)]
#[command(name = "snapvault", version)]
struct Args {
    /// Configuration file path (default is ~/.snapvault.conf)
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Restore the specified backup instead of creating a new one
    #[arg(short = 'r', long, value_name = "BACKUP_PATH")]
    restore: Option<PathBuf>,

    /// Directory to restore into (default is ./restore)
    #[arg(short = 'o', long, value_name = "PATH", requires = "restore")]
    output: Option<PathBuf>,

    /// Don't use extra disk space by decompressing backup archives first
    /// (significantly slows down the restore)
    #[arg(short = 'i', long, requires = "restore")]
    in_place: bool,

    /// Paths to restore (default is everything)
    #[arg(value_name = "PATH", requires = "restore")]
    paths: Vec<PathBuf>,

    /// Show only warning and error messages (intended to be used from cron)
    #[arg(long, conflicts_with = "debug")]
    cron: bool,

    /// Turn on debug messages
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(args.debug, args.cron);

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        if let Err(e) = ctrlc::set_handler(move || cancelled.store(true, Ordering::Relaxed)) {
            error!("Failed to set the signal handler: {}.", e);
        }
    }

    let success = match run(&args, &cancelled) {
        Ok(success) => success,
        Err(e) => {
            error!("{:#}.", e);
            false
        }
    };

    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run(args: &Args, cancelled: &AtomicBool) -> Result<bool> {
    if let Some(backup_path) = &args.restore {
        let backup_path = absolute(backup_path)?;
        let paths = args
            .paths
            .iter()
            .map(|path| absolute(path))
            .collect::<Result<Vec<_>>>()?;
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from("restore"));

        let restorer = Restorer::new(&backup_path, args.in_place).context("restore failed")?;
        restorer.restore(&output, &paths).context("restore failed")
    } else {
        let config_path = match &args.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let config = Config::load(&config_path)?;

        let store = GroupStore::open(&config.backup_root, Observers::default())?;
        walker::backup(&config, &store, cancelled).context("backup failed")
    }
}

fn setup_logging(debug: bool, cron: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else if cron {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format(move |buf, record| {
            let level = match record.level() {
                Level::Error => "E",
                Level::Warn => "W",
                Level::Info => "I",
                Level::Debug => "D",
                Level::Trace => "T",
            };

            if debug {
                writeln!(
                    buf,
                    "{}: [{}:{:03}] {}",
                    level,
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            } else {
                writeln!(buf, "{}: {}", level, record.args())
            }
        })
        .init();
}

fn default_config_path() -> Result<PathBuf> {
    let home = env::var_os("HOME")
        .context("HOME is not set; please specify the configuration file path")?;
    Ok(PathBuf::from(home).join(".snapvault.conf"))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir()
            .context("failed to get the current directory")?
            .join(path))
    }
}
