//! The pre-forking worker pool
//!
//! [`PoolManager`] walks through three states:
//!
//! 1. [`Uninitialized`]: configured, nothing touched yet
//! 2. [`Preinitialized`]: privileges checked, shared jail state prepared,
//!    renderer pre-initialized
//! 3. [`Forking`]: single-threadedness verified, supervisor filter
//!    installed; workers may now be forked
//!
//! Only a `Forking` manager can fork, so nothing can be forked before the
//! process has been checked for extra threads.

use crate::command::{ChannelEvent, Command, CommandChannel};
use crate::config::{ForkitConfig, sleep_for_debugger};
use crate::jail::{JailBuilder, TeardownOutcome, generate_jail_id};
use crate::platform::{ExitedChild, Platform};
use crate::privilege::PrivilegeGate;
use crate::rlimit::ResourceLimitConfigurator;
use crate::seccomp::{FilterPolicy, SandboxInstaller};
use crate::worker::{EXIT_SETUP_FAILURE, Renderer, WorkerRecord, WorkerSetup};
use crate::{ForkitError, Result};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::Read;
use std::marker::PhantomData;
use std::os::fd::{AsFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Consecutive setup failures after which exited workers are no longer replaced
pub const MAX_SETUP_RETRIES: u32 = 8;

/// Descriptor of the control channel unless told otherwise
const DEFAULT_CONTROL_FD: RawFd = 0;

/// Configured, nothing done yet
#[derive(Debug)]
pub struct Uninitialized;

/// Shared state prepared; still no children
#[derive(Debug)]
pub struct Preinitialized;

/// Single-threaded and sandboxed; forking allowed
#[derive(Debug)]
pub struct Forking;

/// Snapshot of the pool for status logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub live: usize,
    pub pending: usize,
    pub bind_mounts: bool,
}

/// Result of one fork pass
#[derive(Debug, Default)]
struct ForkPass {
    forked: usize,
    last_error: Option<ForkitError>,
}

struct PoolCore<P, R> {
    config: ForkitConfig,
    platform: P,
    renderer: R,
    jails: JailBuilder,
    worker_sandbox: SandboxInstaller,
    limits: ResourceLimitConfigurator,
    terminate: Arc<AtomicBool>,
    control_fd: RawFd,
    workers: HashMap<Pid, WorkerRecord>,
    pool_target: usize,
    setup_failures: u32,
}

/// Owns every live worker and the jail each one runs in
pub struct PoolManager<P, R, S> {
    core: PoolCore<P, R>,
    _state: PhantomData<S>,
}

impl<P, R, S> PoolManager<P, R, S> {
    fn into_state<T>(self) -> PoolManager<P, R, T> {
        PoolManager {
            core: self.core,
            _state: PhantomData,
        }
    }

    #[must_use]
    pub const fn platform(&self) -> &P {
        &self.core.platform
    }

    #[must_use]
    pub const fn renderer(&self) -> &R {
        &self.core.renderer
    }

    /// Number of workers forked and not yet reaped
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.core.workers.len()
    }

    /// Pids of every live worker, ascending
    #[must_use]
    pub fn worker_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.core.workers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    #[must_use]
    pub fn worker(&self, pid: Pid) -> Option<&WorkerRecord> {
        self.core.workers.get(&pid)
    }

    /// Forks still owed to the supervisor
    #[must_use]
    pub const fn pool_target(&self) -> usize {
        self.core.pool_target
    }

    #[must_use]
    pub fn bind_mounts_enabled(&self) -> bool {
        self.core.jails.bind_mounts_enabled()
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            live: self.live_workers(),
            pending: self.pool_target(),
            bind_mounts: self.bind_mounts_enabled(),
        }
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.core.terminate.load(Ordering::SeqCst)
    }
}

impl<P: Platform, R: Renderer> PoolManager<P, R, Uninitialized> {
    pub fn new(config: ForkitConfig, platform: P, renderer: R, terminate: Arc<AtomicBool>) -> Self {
        let jails = JailBuilder::new(&config);
        let worker_sandbox = SandboxInstaller::new(!config.no_seccomp);
        Self {
            core: PoolCore {
                config,
                platform,
                renderer,
                jails,
                worker_sandbox,
                limits: ResourceLimitConfigurator,
                terminate,
                control_fd: DEFAULT_CONTROL_FD,
                workers: HashMap::new(),
                pool_target: 0,
                setup_failures: 0,
            },
            _state: PhantomData,
        }
    }

    /// Descriptor of the control channel, closed in every worker
    #[must_use]
    pub fn control_fd(mut self, fd: RawFd) -> Self {
        self.core.control_fd = fd;
        self
    }

    /// One-time startup work done before any fork.
    ///
    /// Fails without touching the jail root when capabilities are missing.
    pub fn initialize(mut self) -> Result<PoolManager<P, R, Preinitialized>> {
        let core = &mut self.core;
        sleep_for_debugger(core.config.debug_delay, "forkit");

        PrivilegeGate::new(core.config.no_capabilities).check(&core.platform)?;
        core.limits.apply_all(&core.platform, &core.config.rlimits);
        core.jails.setup_shared_state(&core.platform)?;

        tracing::info!(lo_template = ?core.config.lo_template, "pre-initializing renderer");
        core.renderer
            .preinit(&core.config.lo_template)
            .map_err(|e| match e {
                ForkitError::Preinit(_) => e,
                other => ForkitError::Preinit(other.to_string()),
            })?;

        tracing::info!(
            child_root = ?core.config.child_root,
            bind_mounts = core.jails.bind_mounts_enabled(),
            "fork server initialized"
        );
        Ok(self.into_state())
    }
}

impl<P: Platform, R: Renderer> PoolManager<P, R, Preinitialized> {
    /// Verify the process is single-threaded, sandbox it and fork the
    /// prespawned workers.
    pub fn start_forking(mut self) -> Result<PoolManager<P, R, Forking>> {
        let core = &mut self.core;

        let threads = core.platform.thread_count()?;
        if threads != 1 {
            return Err(ForkitError::Preinit(format!(
                "fork server must be single-threaded before forking, found {threads} threads"
            )));
        }

        SandboxInstaller::new(!core.config.no_seccomp)
            .install(&core.platform, FilterPolicy::Supervisor)?;

        let prespawn = core.config.prespawn;
        if prespawn > 0 {
            core.pool_target = prespawn;
            let pass = core.fork_pending();
            if pass.forked == 0 {
                return Err(pass
                    .last_error
                    .unwrap_or(ForkitError::Fork(Errno::EAGAIN)));
            }
        }

        Ok(self.into_state())
    }
}

impl<P: Platform, R: Renderer> PoolManager<P, R, Forking> {
    /// Serve commands until termination is requested or the channel closes.
    ///
    /// Live workers are left running on the way out.
    pub fn control_loop<C: Read + AsFd>(&mut self, channel: &mut CommandChannel<C>) -> Result<()> {
        tracing::info!(live = self.live_workers(), "fork server ready");

        while !self.is_terminating() {
            self.reap_exited();

            if !self.poll_and_dispatch(channel)? {
                break;
            }

            if self.core.pool_target > 0 {
                self.fork_pending();
            }
        }

        self.reap_exited();
        tracing::info!(
            live = self.live_workers(),
            terminating = self.is_terminating(),
            "control loop finished"
        );
        Ok(())
    }

    /// Wait for at most one command and act on it. `false` once the channel
    /// is closed.
    pub fn poll_and_dispatch<C: Read + AsFd>(
        &mut self,
        channel: &mut CommandChannel<C>,
    ) -> Result<bool> {
        match channel.read_line()? {
            ChannelEvent::Line(line) => {
                self.dispatch(&line);
                Ok(true)
            }
            ChannelEvent::Idle => Ok(true),
            ChannelEvent::Closed => {
                tracing::info!("control channel closed");
                Ok(false)
            }
        }
    }

    /// Act on one command line. Bad commands are logged, never fatal.
    pub fn dispatch(&mut self, line: &str) {
        self.core.dispatch(line);
    }

    /// Fork outstanding workers; returns how many were forked.
    pub fn fork_pending(&mut self) -> usize {
        self.core.fork_pending().forked
    }

    /// Collect every exited worker and tear down its jail; returns how many
    /// children were collected.
    pub fn reap_exited(&mut self) -> usize {
        self.core.reap_exited()
    }
}

impl<P: Platform, R: Renderer> PoolCore<P, R> {
    fn dispatch(&mut self, line: &str) {
        tracing::trace!(line, "command received");

        match Command::parse(line) {
            Ok(None) => {}
            Ok(Some(Command::Spawn(count))) => match usize::try_from(count) {
                Ok(count) if count > 0 => {
                    tracing::debug!(count, "spawn requested");
                    self.pool_target = count;
                }
                _ => tracing::warn!(count, "cannot spawn a non-positive number of workers"),
            },
            Ok(Some(Command::SetConfig { name, value })) => {
                if let Err(e) = self.limits.apply(&self.platform, &name, &value) {
                    tracing::error!(name = %name, value = %value, error = %e, "setconfig rejected");
                }
            }
            Ok(Some(Command::Unknown(line))) => {
                tracing::warn!(line = %line, "unknown command");
            }
            Err(e) => tracing::error!(line, error = %e, "malformed command"),
        }
    }

    /// Fork until the target is met, giving up after twice as many attempts
    /// as were requested. Failed forks stay owed.
    fn fork_pending(&mut self) -> ForkPass {
        let requested = self.pool_target;
        let max_attempts = requested.saturating_mul(2);
        let mut attempts = 0;
        let mut pass = ForkPass::default();

        while self.pool_target > 0 && attempts < max_attempts {
            attempts += 1;
            self.pool_target -= 1;

            match self.spawn_worker() {
                Ok(_) => pass.forked += 1,
                Err(e) => {
                    self.pool_target += 1;
                    tracing::error!(attempt = attempts, error = %e, "failed to fork worker");
                    pass.last_error = Some(e);
                }
            }
        }

        if self.pool_target > 0 {
            tracing::warn!(
                remaining = self.pool_target,
                attempts,
                "fork attempts exhausted, will retry"
            );
        }

        tracing::info!(
            forked = pass.forked,
            requested,
            live = self.workers.len(),
            "fork pass finished"
        );
        pass
    }

    fn spawn_worker(&mut self) -> Result<Pid> {
        let jail_id = generate_jail_id();
        let jail_path = self.jails.jail_path(&jail_id);

        let setup = WorkerSetup {
            platform: &self.platform,
            jails: &self.jails,
            sandbox: self.worker_sandbox,
            renderer: &self.renderer,
            config: &self.config,
            control_fd: self.control_fd,
        };
        let pid = self.platform.fork(&mut || setup.run(&jail_id))?;

        tracing::info!(pid = %pid, jail_id = %jail_id, "forked worker");
        self.workers.insert(
            pid,
            WorkerRecord {
                pid,
                jail_id,
                jail_path,
                spawned_at: Instant::now(),
            },
        );
        Ok(pid)
    }

    fn reap_exited(&mut self) -> usize {
        let mut exited: Vec<ExitedChild> = Vec::new();
        loop {
            match self.platform.try_reap() {
                Ok(Some(child)) => exited.push(child),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to reap children");
                    break;
                }
            }
        }

        for child in &exited {
            let Some(record) = self.workers.remove(&child.pid) else {
                tracing::error!(pid = %child.pid, "unknown child exited");
                continue;
            };

            tracing::info!(
                pid = %child.pid,
                code = ?child.code,
                uptime_secs = record.spawned_at.elapsed().as_secs(),
                "worker exited"
            );
            self.note_exit(child.code);

            match self.jails.teardown_for_worker(&self.platform, &record.jail_path) {
                Ok(TeardownOutcome::Removed) => {}
                Ok(TeardownOutcome::Preserved) => {
                    tracing::warn!(jail = ?record.jail_path, "jail preserved, will be retried at next startup");
                }
                Err(e) => {
                    tracing::error!(jail = ?record.jail_path, error = %e, "failed to remove jail");
                }
            }
        }

        if !exited.is_empty()
            && self.workers.is_empty()
            && !self.terminate.load(Ordering::SeqCst)
        {
            tracing::warn!("all workers have exited, waiting for spawn requests");
        }

        exited.len()
    }

    /// Replace workers that died during setup, within bounds.
    fn note_exit(&mut self, code: Option<i32>) {
        if code != Some(EXIT_SETUP_FAILURE) {
            self.setup_failures = 0;
            return;
        }

        self.setup_failures += 1;
        if self.setup_failures <= MAX_SETUP_RETRIES {
            tracing::warn!(
                failures = self.setup_failures,
                "worker failed to set up its jail, replacing it"
            );
            self.pool_target += 1;
        } else {
            tracing::error!(
                failures = self.setup_failures,
                "too many consecutive worker setup failures, not replacing"
            );
        }
    }
}
