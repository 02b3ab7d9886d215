//! Seccomp-BPF syscall filtering for the fork server and its workers

use crate::platform::Platform;
use crate::{ForkitError, Result};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use std::collections::BTreeMap;

/// Which role a filter is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    /// The fork server itself: keeps fork, mount teardown and setrlimit
    Supervisor,
    /// A jailed worker about to parse untrusted documents
    Worker,
}

impl FilterPolicy {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
        }
    }

    /// Syscalls denied under this policy; everything else is allowed
    fn denied_syscalls(self) -> Vec<i64> {
        let mut denied = vec![
            libc::SYS_ptrace,
            libc::SYS_process_vm_readv,
            libc::SYS_process_vm_writev,
            libc::SYS_reboot,
            libc::SYS_kexec_load,
            libc::SYS_init_module,
            libc::SYS_finit_module,
            libc::SYS_delete_module,
            libc::SYS_swapon,
            libc::SYS_swapoff,
            libc::SYS_acct,
            libc::SYS_settimeofday,
            libc::SYS_personality,
            libc::SYS_quotactl,
        ];

        if self == Self::Worker {
            // A jailed worker never needs to reshape its own sandbox.
            denied.extend([
                libc::SYS_mount,
                libc::SYS_umount2,
                libc::SYS_pivot_root,
                libc::SYS_chroot,
                libc::SYS_mknodat,
                libc::SYS_unshare,
                libc::SYS_setns,
                libc::SYS_capset,
                libc::SYS_sethostname,
                libc::SYS_setdomainname,
                libc::SYS_keyctl,
                libc::SYS_add_key,
                libc::SYS_request_key,
                libc::SYS_perf_event_open,
                libc::SYS_bpf,
            ]);

            #[cfg(target_arch = "x86_64")]
            denied.extend([libc::SYS_mknod, libc::SYS_iopl, libc::SYS_ioperm]);
        }

        denied
    }

    /// Action taken when a denied syscall is attempted
    const fn deny_action(self) -> SeccompAction {
        match self {
            Self::Supervisor => SeccompAction::Errno(libc::EPERM as u32),
            Self::Worker => SeccompAction::KillProcess,
        }
    }

    /// Compile this policy into a BPF program for the host architecture
    pub fn compile(self) -> Result<BpfProgram> {
        let rules: BTreeMap<i64, Vec<SeccompRule>> = self
            .denied_syscalls()
            .into_iter()
            .map(|nr| (nr, Vec::new()))
            .collect();

        let arch: TargetArch = std::env::consts::ARCH.try_into().map_err(|e| {
            ForkitError::SandboxInstall(format!("unsupported architecture: {e:?}"))
        })?;

        let filter = SeccompFilter::new(rules, SeccompAction::Allow, self.deny_action(), arch)
            .map_err(|e| {
                ForkitError::SandboxInstall(format!("failed to create {} filter: {e}", self.name()))
            })?;

        filter.try_into().map_err(|e| {
            ForkitError::SandboxInstall(format!("failed to compile {} filter: {e}", self.name()))
        })
    }
}

/// Installs syscall filters, unless sandboxing was switched off by the operator
#[derive(Debug, Clone, Copy)]
pub struct SandboxInstaller {
    enabled: bool,
}

impl SandboxInstaller {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Install `policy` into the calling process.
    ///
    /// With sandboxing disabled nothing is installed and the bypass is
    /// logged at error level every time.
    pub fn install(&self, platform: &impl Platform, policy: FilterPolicy) -> Result<()> {
        if !self.enabled {
            tracing::error!(
                policy = policy.name(),
                "security: running without the ability to filter system calls is ill advised"
            );
            return Ok(());
        }

        let program = policy.compile()?;
        platform.apply_filter(&program)?;
        tracing::info!(policy = policy.name(), instructions = program.len(), "seccomp filter applied");
        Ok(())
    }
}
