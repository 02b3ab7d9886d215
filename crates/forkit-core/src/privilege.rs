//! Startup check for the capabilities jail construction needs

use crate::platform::Platform;
use crate::{ForkitError, Result};
use caps::Capability;

/// Capabilities required to chroot, create device nodes and fix up ownership
pub const REQUIRED_CAPABILITIES: [Capability; 3] = [
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_MKNOD,
    Capability::CAP_FOWNER,
];

/// Verifies required OS capabilities before any jail operation
#[derive(Debug, Clone, Copy)]
pub struct PrivilegeGate {
    bypass: bool,
}

impl PrivilegeGate {
    #[must_use]
    pub const fn new(bypass: bool) -> Self {
        Self { bypass }
    }

    /// Check every required capability.
    ///
    /// All capabilities are checked even after one is found missing, so a
    /// single failure lists everything the operator has to fix.
    pub fn check(&self, platform: &impl Platform) -> Result<()> {
        if self.bypass {
            tracing::error!(
                "security: running without the capability to enter a chroot jail is ill advised"
            );
            return Ok(());
        }

        let missing: Vec<String> = REQUIRED_CAPABILITIES
            .iter()
            .filter(|&&cap| !have_capability(platform, cap))
            .map(ToString::to_string)
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        tracing::error!(
            missing = %missing.join(", "),
            "capabilities are not set for the fork server; make sure the binary's partition is not mounted nosuid"
        );
        Err(ForkitError::Privilege(missing))
    }
}

fn have_capability(platform: &impl Platform, cap: Capability) -> bool {
    match platform.has_capability(cap) {
        Ok(true) => {
            tracing::info!(capability = %cap, "have capability");
            true
        }
        Ok(false) => {
            tracing::error!(capability = %cap, "capability is not set");
            false
        }
        Err(e) => {
            tracing::error!(capability = %cap, error = %e, "failed to query capability");
            false
        }
    }
}
