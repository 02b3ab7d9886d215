//! forkit - fork server for jailed document workers
//!
//! Started by the supervisor with the jail layout on the command line, then
//! driven through stdin:
//! - `spawn <N>` forks N workers, each chrooted into a fresh jail
//! - `setconfig limit_<resource> <value>` adjusts limits for later forks

use anyhow::Result;
use clap::Parser;
use forkit_core::error::{EX_SOFTWARE, EX_USAGE};
use forkit_core::{CommandChannel, ForkitError, LinuxPlatform, PoolManager};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing_subscriber::EnvFilter;

mod config;
mod renderer;

use config::Cli;
use renderer::IdleRenderer;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too.
            let code = if e.use_stderr() { EX_USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if let Err(e) = init_tracing() {
        eprintln!("forkit: failed to initialize logging: {e}");
        return ExitCode::from(EX_SOFTWARE);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fork server failed");
            let code = e
                .downcast_ref::<ForkitError>()
                .map_or(EX_SOFTWARE, ForkitError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("forkit=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&terminate))?;
    }

    let config = cli.into_config();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        child_root = ?config.child_root,
        sys_template = ?config.sys_template,
        lo_template = ?config.lo_template,
        lo_subpath = ?config.lo_subpath,
        "forkit starting"
    );

    // SAFETY: stdin is the control channel and is not read through
    // `std::io::stdin` anywhere else in this process.
    #[allow(unsafe_code)]
    let control = unsafe { File::from_raw_fd(std::io::stdin().as_raw_fd()) };
    let mut channel = CommandChannel::new(control, config.poll_timeout, Arc::clone(&terminate));

    let renderer = IdleRenderer::new(Arc::clone(&terminate));
    let mut pool = PoolManager::new(config, LinuxPlatform, renderer, terminate)
        .control_fd(channel.raw_fd())
        .initialize()?
        .start_forking()?;

    pool.control_loop(&mut channel)?;

    let status = pool.status();
    tracing::info!(
        live = status.live,
        pending = status.pending,
        bind_mounts = status.bind_mounts,
        "forkit exiting"
    );
    Ok(())
}
