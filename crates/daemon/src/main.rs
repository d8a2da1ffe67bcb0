// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xsyncd - The xsync daemon.
//!
//! Hosts the sync engine against the store in the state directory
//! (`~/.local/state/xsync/` by default) until signalled. The API token is
//! read from `XSYNC_API_TOKEN`.
//!
//! Usage:
//!   xsyncd [--state-dir <path>] [--config <path>] [--verbose]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use xs_sync::config::{self, Config};
use xs_sync::{default_state_dir, StaticCredentials, SyncEngine};

mod shutdown;

/// PID filename within the state directory.
const PID_NAME: &str = "xsyncd.pid";
/// Lock filename for single instance guarantee.
const LOCK_NAME: &str = "xsyncd.lock";
const LOG_NAME: &str = "xsyncd.log";
const TOKEN_ENV: &str = "XSYNC_API_TOKEN";

#[derive(Debug, Parser)]
#[command(name = "xsyncd", version, about = "Offline-first sync daemon")]
struct Args {
    /// State directory holding the store, config, and logs.
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Config file (default: <state-dir>/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let state_dir = args.state_dir.clone().unwrap_or_else(default_state_dir);
    if let Err(e) = fs::create_dir_all(&state_dir) {
        eprintln!("xsyncd: cannot create {}: {e}", state_dir.display());
        return ExitCode::FAILURE;
    }

    setup_logging(&state_dir.join(LOG_NAME), args.verbose);
    info!(state_dir = %state_dir.display(), "xsyncd starting");

    let lock_file = match acquire_lock(&state_dir.join(LOCK_NAME)) {
        Ok(f) => f,
        Err(e) => {
            error!("failed to acquire lock: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let pid_path = state_dir.join(PID_NAME);
    if let Err(e) = write_pid_file(&pid_path) {
        error!("failed to write PID file: {}", e);
        return ExitCode::FAILURE;
    }

    let code = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => match runtime.block_on(serve(&args, &state_dir)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "xsyncd failed");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!("failed to start runtime: {}", e);
            ExitCode::FAILURE
        }
    };

    cleanup(&pid_path);
    drop(lock_file);
    info!("xsyncd stopped");
    code
}

async fn serve(args: &Args, state_dir: &Path) -> xs_sync::Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::config_path(state_dir));
    let config = Config::load(&config_path)?;

    let token = std::env::var(TOKEN_ENV).unwrap_or_default();
    if token.is_empty() {
        warn!("{} is not set; requests will be sent without a token", TOKEN_ENV);
    }
    let credentials = Arc::new(StaticCredentials::new(token, config.api.device_id.clone()));

    let engine = SyncEngine::builder(config)
        .db_path(config::db_path(state_dir))
        .credentials(credentials)
        .build()?;
    let shutdown = shutdown::install_signal_handler();
    engine.start()?;

    // Signal readiness to a supervising process
    println!("READY");
    let _ = std::io::stdout().flush();

    shutdown.cancelled().await;
    engine.stop().await;
    Ok(())
}

fn setup_logging(log_path: &Path, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Try to open log file, fall back to stderr
    if let Ok(file) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn acquire_lock(lock_path: &Path) -> std::io::Result<fs::File> {
    use fs2::FileExt;

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(lock_path)?;
    file.try_lock_exclusive()
        .map_err(|_| std::io::Error::other("another xsyncd instance is already running"))?;
    Ok(file)
}

fn write_pid_file(pid_path: &Path) -> std::io::Result<()> {
    fs::write(pid_path, format!("{}", std::process::id()))
}

fn cleanup(pid_path: &Path) {
    let _ = fs::remove_file(pid_path);
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
