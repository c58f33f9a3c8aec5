//! tcp-splice-proxy: a multi-threaded, zero-copy TCP reverse proxy
//! built on `splice(2)` and kernel pipes.
//!
//! - One `SO_REUSEPORT` listener per worker thread, kernel-sharded
//! - Per-worker `mio` reactor (epoll/kqueue), no async runtime
//! - Non-blocking upstream connect, bidirectional splice relay
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod net;
mod runtime;
mod supervisor;

use config::Config;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        upstream = %config.upstream,
        nproc = config.nproc,
        pipe_size = config.pipe_size,
        minconn = config.minconn,
        maxconn = config.maxconn,
        "starting tcp-splice-proxy"
    );

    if let Err(e) = supervisor::run(Arc::new(config)) {
        error!(error = %e, "fatal error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
