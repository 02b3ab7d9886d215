//! In-memory platform and fixtures for unit tests
//!
//! `FakePlatform::fork` runs the child closure inline and hands out made-up
//! pids. Bind mounts are simulated by copying the source into the target;
//! unmounting empties the target again.

use crate::config::{ForkitConfig, ForkitConfigBuilder};
use crate::platform::{ExitedChild, Platform};
use crate::rlimit::RlimitResource;
use crate::worker::{Renderer, WorkerContext};
use crate::{ForkitError, Result};
use caps::Capability;
use nix::errno::Errno;
use nix::unistd::Pid;
use seccompiler::BpfProgram;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const FIRST_FAKE_PID: i32 = 1000;

#[derive(Debug)]
pub struct FakePlatform {
    next_pid: Cell<i32>,
    fork_attempts: Cell<usize>,
    failing_forks: Cell<usize>,
    live: RefCell<BTreeSet<Pid>>,
    exit_codes: RefCell<HashMap<Pid, i32>>,
    exits: RefCell<VecDeque<ExitedChild>>,
    rlimits_at_fork: RefCell<HashMap<Pid, Vec<(RlimitResource, u64)>>>,
    threads: Cell<usize>,
    closed_fds: RefCell<Vec<RawFd>>,
    mounted: RefCell<HashSet<PathBuf>>,
    bind_calls: Cell<usize>,
    fail_binds: Cell<bool>,
    unmounts: RefCell<Vec<PathBuf>>,
    stuck_mounts: RefCell<HashSet<PathBuf>>,
    mknods: Cell<usize>,
    fail_mknod: Cell<bool>,
    chroots: RefCell<Vec<PathBuf>>,
    revoked: RefCell<Vec<Capability>>,
    cap_queries: Cell<usize>,
    cap_drops: Cell<usize>,
    filters: Cell<usize>,
    fail_filter: Cell<bool>,
    rlimits: RefCell<Vec<(RlimitResource, u64)>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            next_pid: Cell::new(FIRST_FAKE_PID),
            fork_attempts: Cell::new(0),
            failing_forks: Cell::new(0),
            live: RefCell::new(BTreeSet::new()),
            exit_codes: RefCell::new(HashMap::new()),
            exits: RefCell::new(VecDeque::new()),
            rlimits_at_fork: RefCell::new(HashMap::new()),
            threads: Cell::new(1),
            closed_fds: RefCell::new(Vec::new()),
            mounted: RefCell::new(HashSet::new()),
            bind_calls: Cell::new(0),
            fail_binds: Cell::new(false),
            unmounts: RefCell::new(Vec::new()),
            stuck_mounts: RefCell::new(HashSet::new()),
            mknods: Cell::new(0),
            fail_mknod: Cell::new(false),
            chroots: RefCell::new(Vec::new()),
            revoked: RefCell::new(Vec::new()),
            cap_queries: Cell::new(0),
            cap_drops: Cell::new(0),
            filters: Cell::new(0),
            fail_filter: Cell::new(false),
            rlimits: RefCell::new(Vec::new()),
        }
    }

    // Process control

    pub fn fail_forks(&self, count: usize) {
        self.failing_forks.set(count);
    }

    pub fn fork_attempts(&self) -> usize {
        self.fork_attempts.get()
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.live.borrow().iter().copied().collect()
    }

    /// Make `pid` exit with `code`; it is reported by the next `try_reap`.
    pub fn exit(&self, pid: Pid, code: i32) {
        self.live.borrow_mut().remove(&pid);
        self.exits.borrow_mut().push_back(ExitedChild {
            pid,
            code: Some(code),
        });
    }

    /// Let every live child exit with the status its closure returned.
    pub fn exit_all(&self) {
        let pids = self.live_pids();
        for pid in pids {
            let code = self.exit_codes.borrow().get(&pid).copied().unwrap_or(0);
            self.exit(pid, code);
        }
    }

    pub fn set_thread_count(&self, threads: usize) {
        self.threads.set(threads);
    }

    pub fn closed_fds(&self) -> Vec<RawFd> {
        self.closed_fds.borrow().clone()
    }

    /// Limit that was in force when `pid` was forked
    pub fn rlimit_seen_by(&self, pid: Pid, resource: RlimitResource) -> Option<u64> {
        self.rlimits_at_fork
            .borrow()
            .get(&pid)
            .and_then(|limits| lookup(limits, resource))
    }

    // Mounts and devices

    pub fn fail_bind_mounts(&self) {
        self.fail_binds.set(true);
    }

    pub fn bind_mount_calls(&self) -> usize {
        self.bind_calls.get()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.borrow().contains(path)
    }

    /// Make unmounting `path` fail, leaving its contents in place
    pub fn fail_unmount(&self, path: &Path) {
        self.stuck_mounts.borrow_mut().insert(path.to_path_buf());
    }

    pub fn unmount_log(&self) -> Vec<PathBuf> {
        self.unmounts.borrow().clone()
    }

    pub fn fail_mknod(&self) {
        self.fail_mknod.set(true);
    }

    pub fn mknod_calls(&self) -> usize {
        self.mknods.get()
    }

    pub fn chroots(&self) -> Vec<PathBuf> {
        self.chroots.borrow().clone()
    }

    // Privileges and sandboxing

    pub fn revoke_capability(&self, cap: Capability) {
        self.revoked.borrow_mut().push(cap);
    }

    pub fn capability_queries(&self) -> usize {
        self.cap_queries.get()
    }

    pub fn capability_drops(&self) -> usize {
        self.cap_drops.get()
    }

    pub fn fail_filter(&self) {
        self.fail_filter.set(true);
    }

    pub fn filters_applied(&self) -> usize {
        self.filters.get()
    }

    pub fn rlimit(&self, resource: RlimitResource) -> Option<u64> {
        lookup(&self.rlimits.borrow(), resource)
    }
}

impl Platform for FakePlatform {
    fn fork(&self, child: &mut dyn FnMut() -> i32) -> Result<Pid> {
        self.fork_attempts.set(self.fork_attempts.get() + 1);

        let failing = self.failing_forks.get();
        if failing > 0 {
            self.failing_forks.set(failing - 1);
            return Err(ForkitError::Fork(Errno::EAGAIN));
        }

        let pid = Pid::from_raw(self.next_pid.get());
        self.next_pid.set(self.next_pid.get() + 1);
        self.rlimits_at_fork
            .borrow_mut()
            .insert(pid, self.rlimits.borrow().clone());

        let code = child();

        self.exit_codes.borrow_mut().insert(pid, code);
        self.live.borrow_mut().insert(pid);
        Ok(pid)
    }

    fn try_reap(&self) -> Result<Option<ExitedChild>> {
        Ok(self.exits.borrow_mut().pop_front())
    }

    fn thread_count(&self) -> Result<usize> {
        Ok(self.threads.get())
    }

    fn close_fd(&self, fd: RawFd) {
        self.closed_fds.borrow_mut().push(fd);
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.bind_calls.set(self.bind_calls.get() + 1);

        if self.fail_binds.get() {
            return Err(ForkitError::JailConstruction(format!(
                "failed to bind mount {} to {}: EPERM",
                source.display(),
                target.display()
            )));
        }
        if !target.is_dir() {
            return Err(ForkitError::JailConstruction(format!(
                "mount point {} does not exist",
                target.display()
            )));
        }

        copy_contents(source, target)?;
        self.mounted.borrow_mut().insert(target.to_path_buf());
        Ok(())
    }

    fn remount_readonly(&self, _source: &Path, _target: &Path) -> Result<()> {
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.unmounts.borrow_mut().push(target.to_path_buf());

        if self.stuck_mounts.borrow().contains(target) {
            return Err(ForkitError::JailConstruction(format!(
                "umount2 failed for {}: EBUSY",
                target.display()
            )));
        }

        if self.mounted.borrow_mut().remove(target) {
            for entry in fs::read_dir(target)? {
                let path = entry?.path();
                if path.is_dir() && !path.is_symlink() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    fn make_char_device(&self, path: &Path, _major: u64, _minor: u64) -> Result<()> {
        if self.fail_mknod.get() {
            return Err(ForkitError::Nix(Errno::EPERM));
        }
        self.mknods.set(self.mknods.get() + 1);
        fs::File::create(path)?;
        Ok(())
    }

    fn change_root(&self, path: &Path) -> Result<()> {
        self.chroots.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn has_capability(&self, cap: Capability) -> Result<bool> {
        self.cap_queries.set(self.cap_queries.get() + 1);
        Ok(!self.revoked.borrow().contains(&cap))
    }

    fn drop_capabilities(&self) -> Result<()> {
        self.cap_drops.set(self.cap_drops.get() + 1);
        Ok(())
    }

    fn apply_filter(&self, program: &BpfProgram) -> Result<()> {
        if self.fail_filter.get() {
            return Err(ForkitError::SandboxInstall(
                "failed to apply filter: EINVAL".into(),
            ));
        }
        assert!(!program.is_empty());
        self.filters.set(self.filters.get() + 1);
        Ok(())
    }

    fn set_rlimit(&self, resource: RlimitResource, limit: u64) -> Result<()> {
        let mut limits = self.rlimits.borrow_mut();
        limits.retain(|(r, _)| *r != resource);
        limits.push((resource, limit));
        Ok(())
    }
}

fn lookup(limits: &[(RlimitResource, u64)], resource: RlimitResource) -> Option<u64> {
    limits
        .iter()
        .find(|(r, _)| *r == resource)
        .map(|(_, limit)| *limit)
}

fn copy_contents(source: &Path, target: &Path) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copy_contents(&entry.path(), &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

/// Scratch system and renderer templates plus a not-yet-created jail root
pub struct Templates {
    _dir: TempDir,
    child_root: PathBuf,
    sys_template: PathBuf,
    lo_template: PathBuf,
}

impl Templates {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let sys_template = dir.path().join("systemplate");
        fs::create_dir_all(sys_template.join("etc")).unwrap();
        fs::write(sys_template.join("etc/hostname"), b"forkit\n").unwrap();

        let lo_template = dir.path().join("lotemplate");
        fs::create_dir_all(lo_template.join("program")).unwrap();
        fs::write(lo_template.join("program/soffice"), b"#!/bin/true\n").unwrap();

        Self {
            child_root: dir.path().join("jails"),
            sys_template,
            lo_template,
            _dir: dir,
        }
    }

    pub fn child_root(&self) -> &Path {
        &self.child_root
    }

    pub fn sys_template(&self) -> &Path {
        &self.sys_template
    }

    pub fn lo_template(&self) -> &Path {
        &self.lo_template
    }

    pub fn config(&self) -> ForkitConfigBuilder {
        ForkitConfig::builder()
            .child_root(self.child_root())
            .sys_template(self.sys_template())
            .lo_template(self.lo_template())
            .lo_subpath("/lo")
            .poll_timeout(Duration::from_millis(10))
    }
}

/// What a renderer saw when it was run
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub jail_id: String,
    pub root: PathBuf,
    pub lo_path: PathBuf,
    pub client_port: u16,
    pub master_location: String,
}

#[derive(Debug)]
pub struct RecordingRenderer {
    exit_code: i32,
    fail_preinit: bool,
    runs: RefCell<Vec<RecordedRun>>,
}

impl RecordingRenderer {
    pub fn new(exit_code: i32) -> Self {
        Self {
            exit_code,
            fail_preinit: false,
            runs: RefCell::new(Vec::new()),
        }
    }

    pub fn failing_preinit() -> Self {
        Self {
            fail_preinit: true,
            ..Self::new(0)
        }
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.borrow().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn preinit(&mut self, lo_template: &Path) -> Result<()> {
        if self.fail_preinit {
            return Err(ForkitError::Io(std::io::Error::other(format!(
                "cannot load renderer from {}",
                lo_template.display()
            ))));
        }
        Ok(())
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> i32 {
        self.runs.borrow_mut().push(RecordedRun {
            jail_id: ctx.jail_id.to_owned(),
            root: ctx.root.clone(),
            lo_path: ctx.lo_path.clone(),
            client_port: ctx.client_port,
            master_location: ctx.master_location.to_owned(),
        });
        self.exit_code
    }
}
