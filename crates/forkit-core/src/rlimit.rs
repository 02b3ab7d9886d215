//! setrlimit-based resource limits driven by `setconfig limit_*` directives
//!
//! Limits are set on the fork server itself, so every worker forked after
//! the directive inherits them.

use crate::platform::Platform;
use crate::{ForkitError, Result};
use libc::RLIM_INFINITY;
use nix::sys::resource::Resource;
use std::str::FromStr;

/// Resources that can be limited through `setconfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    /// Address space (`RLIMIT_AS`), given in MiB
    VirtualMemory,
    /// Stack size (`RLIMIT_STACK`), given in KiB
    Stack,
    /// Largest file that may be written (`RLIMIT_FSIZE`), given in MiB
    FileSize,
    /// Open file descriptors (`RLIMIT_NOFILE`)
    OpenFiles,
}

impl RlimitResource {
    #[must_use]
    pub const fn as_nix(self) -> Resource {
        match self {
            Self::VirtualMemory => Resource::RLIMIT_AS,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::FileSize => Resource::RLIMIT_FSIZE,
            Self::OpenFiles => Resource::RLIMIT_NOFILE,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::VirtualMemory => "RLIMIT_AS",
            Self::Stack => "RLIMIT_STACK",
            Self::FileSize => "RLIMIT_FSIZE",
            Self::OpenFiles => "RLIMIT_NOFILE",
        }
    }

    /// Multiplier turning a directive value into the kernel's unit
    const fn unit(self) -> u64 {
        match self {
            Self::VirtualMemory | Self::FileSize => 1024 * 1024,
            Self::Stack => 1024,
            Self::OpenFiles => 1,
        }
    }

    /// Convert a directive value into a limit. Non-positive means unlimited.
    fn limit_for(self, value: i64) -> Result<u64> {
        let Ok(value) = u64::try_from(value) else {
            return Ok(RLIM_INFINITY);
        };
        if value == 0 {
            return Ok(RLIM_INFINITY);
        }
        value.checked_mul(self.unit()).ok_or_else(|| {
            ForkitError::ResourceLimit(format!("{} value {value} overflows", self.name()))
        })
    }
}

impl FromStr for RlimitResource {
    type Err = ForkitError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "limit_virt_mem_mb" => Ok(Self::VirtualMemory),
            "limit_stack_mem_kb" => Ok(Self::Stack),
            "limit_file_size_mb" => Ok(Self::FileSize),
            "limit_num_open_files" | "limit_num_files" => Ok(Self::OpenFiles),
            other => Err(ForkitError::ResourceLimit(format!(
                "unknown resource limit: {other}"
            ))),
        }
    }
}

/// A parsed `limit_<resource> <value>` directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitDirective {
    pub resource: RlimitResource,
    pub limit: u64,
}

impl RlimitDirective {
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        let resource: RlimitResource = name.parse()?;
        let value: i64 = value.trim().parse().map_err(|e| {
            ForkitError::ResourceLimit(format!("invalid value {value:?} for {name}: {e}"))
        })?;
        Ok(Self {
            resource,
            limit: resource.limit_for(value)?,
        })
    }
}

/// Split a `--rlimits` argument (`name:value;name:value`) into pairs.
///
/// Entries without a `:` are kept with an empty value so that applying them
/// reports the problem instead of silently dropping it.
#[must_use]
pub fn parse_rlimits_arg(arg: &str) -> Vec<(String, String)> {
    arg.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, value)) => (name.trim().to_owned(), value.trim().to_owned()),
            None => (entry.to_owned(), String::new()),
        })
        .collect()
}

/// Applies named resource-limit directives to the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceLimitConfigurator;

impl ResourceLimitConfigurator {
    /// Apply one `setconfig` directive.
    ///
    /// Errors are returned for unknown names, bad values and failed
    /// `setrlimit` calls; callers log them and carry on.
    pub fn apply(&self, platform: &impl Platform, name: &str, value: &str) -> Result<()> {
        let directive = RlimitDirective::parse(name, value)?;
        platform.set_rlimit(directive.resource, directive.limit)?;

        if directive.limit == RLIM_INFINITY {
            tracing::info!(resource = directive.resource.name(), "resource limit set to unlimited");
        } else {
            tracing::info!(
                resource = directive.resource.name(),
                limit = directive.limit,
                "resource limit set"
            );
        }
        Ok(())
    }

    /// Apply every startup directive, logging failures without aborting
    pub fn apply_all(&self, platform: &impl Platform, directives: &[(String, String)]) {
        for (name, value) in directives {
            if let Err(e) = self.apply(platform, name, value) {
                tracing::error!(name = %name, value = %value, error = %e, "rlimits directive rejected");
            }
        }
    }
}
