//! What runs inside a freshly forked worker, and the parent's record of it

use crate::config::{ForkitConfig, sleep_for_debugger};
use crate::jail::JailBuilder;
use crate::platform::Platform;
use crate::seccomp::{FilterPolicy, SandboxInstaller};
use crate::Result;
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Exit status of a worker that could not build its sandbox (sysexits `EX_OSERR`)
pub const EXIT_SETUP_FAILURE: i32 = 71;

/// The document engine hosted by each worker
pub trait Renderer {
    /// Expensive one-time setup, done in the fork server before any fork so
    /// every worker inherits the result copy-on-write
    fn preinit(&mut self, lo_template: &Path) -> Result<()>;

    /// Serve sessions inside the jail. The return value is the worker's exit
    /// status.
    fn run(&self, ctx: &WorkerContext<'_>) -> i32;
}

/// Everything a renderer learns about its jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext<'a> {
    pub jail_id: &'a str,
    /// Jail root as seen by the worker: `/` once chrooted
    pub root: PathBuf,
    /// Renderer installation as seen by the worker
    pub lo_path: PathBuf,
    pub client_port: u16,
    pub master_location: &'a str,
}

/// Parent-side bookkeeping for one live worker
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: Pid,
    pub jail_id: String,
    pub jail_path: PathBuf,
    pub spawned_at: Instant,
}

/// Borrowed state a forked child needs to turn itself into a worker
pub(crate) struct WorkerSetup<'a, P, R> {
    pub platform: &'a P,
    pub jails: &'a JailBuilder,
    pub sandbox: SandboxInstaller,
    pub renderer: &'a R,
    pub config: &'a ForkitConfig,
    pub control_fd: RawFd,
}

impl<P: Platform, R: Renderer> WorkerSetup<'_, P, R> {
    /// Child entry point; returns the exit status.
    pub fn run(&self, jail_id: &str) -> i32 {
        self.platform.close_fd(self.control_fd);
        sleep_for_debugger(self.config.debug_delay, "worker");

        match self.enter_jail(jail_id) {
            Ok(root) => {
                let ctx = WorkerContext {
                    jail_id,
                    lo_path: root.join(self.config.lo_subpath_relative()),
                    root,
                    client_port: self.config.client_port,
                    master_location: &self.config.master_location,
                };
                tracing::debug!(jail_id, root = ?ctx.root, "worker sandbox ready");
                self.renderer.run(&ctx)
            }
            Err(e) => {
                tracing::error!(jail_id, error = %e, "worker setup failed");
                EXIT_SETUP_FAILURE
            }
        }
    }

    /// Build the jail, enter it and lock the process down.
    fn enter_jail(&self, jail_id: &str) -> Result<PathBuf> {
        let jail = self.jails.mount_for_worker(self.platform, jail_id)?;

        let root = if self.config.no_capabilities {
            tracing::warn!(jail = ?jail, "running without chroot");
            jail
        } else {
            self.platform.change_root(&jail)?;
            self.platform.drop_capabilities()?;
            PathBuf::from("/")
        };

        self.sandbox.install(self.platform, FilterPolicy::Worker)?;
        Ok(root)
    }
}
