//! OS facilities used by the fork server
//!
//! Everything that needs privileges or touches process state goes through
//! [`Platform`], so pool sizing, command dispatch and jail bookkeeping can be
//! exercised without root. [`LinuxPlatform`] is the real implementation.

use crate::rlimit::RlimitResource;
use crate::worker::EXIT_SETUP_FAILURE;
use crate::{ForkitError, Result};
use caps::{CapSet, Capability};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::{Mode, SFlag};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use seccompiler::BpfProgram;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

/// A child process collected by [`Platform::try_reap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitedChild {
    pub pid: Pid,
    /// Exit code, or `None` when the child was killed by a signal
    pub code: Option<i32>,
}

/// Narrow interface over the OS primitives the fork server relies on
pub trait Platform {
    /// Fork the current process.
    ///
    /// In the child `child` runs and its return value becomes the exit
    /// status; the call never returns there. In the parent the child's pid is
    /// returned.
    fn fork(&self, child: &mut dyn FnMut() -> i32) -> Result<Pid>;

    /// Collect one exited child without blocking
    fn try_reap(&self) -> Result<Option<ExitedChild>>;

    /// Number of threads in the current process
    fn thread_count(&self) -> Result<usize>;

    /// Close an inherited descriptor, ignoring errors
    fn close_fd(&self, fd: RawFd);

    /// Bind-mount `source` onto the existing directory `target`
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Remount an existing bind mount read-only
    fn remount_readonly(&self, source: &Path, target: &Path) -> Result<()>;

    /// Detach whatever is mounted on `target`; not-a-mount-point is success
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Create a character device node
    fn make_char_device(&self, path: &Path, major: u64, minor: u64) -> Result<()>;

    /// chroot into `path` and move to its `/`
    fn change_root(&self, path: &Path) -> Result<()>;

    /// Whether `cap` is in the effective set of this process
    fn has_capability(&self, cap: Capability) -> Result<bool>;

    /// Clear every capability set of this process
    fn drop_capabilities(&self) -> Result<()>;

    /// Load a compiled seccomp program into the current process
    fn apply_filter(&self, program: &BpfProgram) -> Result<()>;

    /// Set both soft and hard limit of `resource`
    fn set_rlimit(&self, resource: RlimitResource, limit: u64) -> Result<()>;
}

/// The real Linux implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn fork(&self, child: &mut dyn FnMut() -> i32) -> Result<Pid> {
        // SAFETY: the fork server is single-threaded when it forks (enforced
        // by the pool typestate), so the child inherits no foreign locks.
        match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Parent { child }) => Ok(child),
            Ok(ForkResult::Child) => {
                let code = child_status(child);
                // SAFETY: terminate the child without running the parent's
                // atexit handlers or destructors.
                unsafe { libc::_exit(code) }
            }
            Err(e) => Err(ForkitError::Fork(e)),
        }
    }

    fn try_reap(&self) -> Result<Option<ExitedChild>> {
        loop {
            match nix::sys::wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(None),
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Ok(Some(ExitedChild {
                        pid,
                        code: Some(code),
                    }));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    tracing::debug!(pid = %pid, ?signal, "child killed by signal");
                    return Ok(Some(ExitedChild { pid, code: None }));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn thread_count(&self) -> Result<usize> {
        Ok(std::fs::read_dir("/proc/self/task")?.count())
    }

    fn close_fd(&self, fd: RawFd) {
        // SAFETY: the descriptor is only closed in a freshly forked child
        // that never uses it again.
        unsafe {
            libc::close(fd);
        }
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            ForkitError::JailConstruction(format!(
                "failed to bind mount {} to {}: {e}",
                source.display(),
                target.display()
            ))
        })
    }

    fn remount_readonly(&self, source: &Path, target: &Path) -> Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_NOATIME
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOSUID
                | MsFlags::MS_RDONLY
                | MsFlags::MS_SILENT,
            None::<&str>,
        )
        .map_err(|e| {
            ForkitError::JailConstruction(format!(
                "failed to remount {} read-only: {e}",
                target.display()
            ))
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if !target.is_dir() {
            return Ok(());
        }

        match nix::mount::umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) => Ok(()),
            Err(e) => Err(ForkitError::JailConstruction(format!(
                "umount2 failed for {}: {e}",
                target.display()
            ))),
        }
    }

    fn make_char_device(&self, path: &Path, major: u64, minor: u64) -> Result<()> {
        nix::sys::stat::mknod(
            path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            nix::sys::stat::makedev(major, minor),
        )?;
        Ok(())
    }

    fn change_root(&self, path: &Path) -> Result<()> {
        nix::unistd::chroot(path).map_err(|e| {
            ForkitError::JailConstruction(format!("chroot({}) failed: {e}", path.display()))
        })?;
        nix::unistd::chdir("/")?;
        Ok(())
    }

    fn has_capability(&self, cap: Capability) -> Result<bool> {
        caps::has_cap(None, CapSet::Effective, cap)
            .map_err(|e| ForkitError::Io(std::io::Error::other(e.to_string())))
    }

    fn drop_capabilities(&self) -> Result<()> {
        for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
            caps::clear(None, set).map_err(|e| {
                ForkitError::JailConstruction(format!("failed to clear {set:?} capabilities: {e}"))
            })?;
        }
        Ok(())
    }

    fn apply_filter(&self, program: &BpfProgram) -> Result<()> {
        seccompiler::apply_filter(program)
            .map_err(|e| ForkitError::SandboxInstall(format!("failed to apply filter: {e}")))
    }

    fn set_rlimit(&self, resource: RlimitResource, limit: u64) -> Result<()> {
        nix::sys::resource::setrlimit(resource.as_nix(), limit, limit).map_err(|e| {
            ForkitError::ResourceLimit(format!("setrlimit({}) failed: {e}", resource.name()))
        })
    }
}

/// Run the child body. A panic must never unwind back into the fork
/// server's frames, so it becomes a setup failure.
fn child_status(child: &mut dyn FnMut() -> i32) -> i32 {
    panic::catch_unwind(AssertUnwindSafe(child)).unwrap_or_else(|_| {
        tracing::error!("worker panicked");
        EXIT_SETUP_FAILURE
    })
}
