//! Placeholder renderer: holds its jail until told to stop

use forkit_core::{ForkitError, Renderer, Result, WorkerContext};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct IdleRenderer {
    terminate: Arc<AtomicBool>,
}

impl IdleRenderer {
    pub const fn new(terminate: Arc<AtomicBool>) -> Self {
        Self { terminate }
    }
}

impl Renderer for IdleRenderer {
    fn preinit(&mut self, lo_template: &Path) -> Result<()> {
        if !lo_template.is_dir() {
            return Err(ForkitError::Preinit(format!(
                "renderer template {} is not a directory",
                lo_template.display()
            )));
        }
        Ok(())
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> i32 {
        tracing::info!(
            jail_id = ctx.jail_id,
            lo_path = ?ctx.lo_path,
            client_port = ctx.client_port,
            master = ctx.master_location,
            "worker idle"
        );

        // The SIGTERM handler installed by the fork server survives the fork.
        while !self.terminate.load(Ordering::SeqCst) {
            nix::unistd::pause();
        }
        0
    }
}
