//! Error types for forkit-core

use thiserror::Error;

/// Exit status for malformed or missing startup parameters (sysexits `EX_USAGE`).
pub const EX_USAGE: u8 = 64;

/// Exit status for internal failures (sysexits `EX_SOFTWARE`).
pub const EX_SOFTWARE: u8 = 70;

#[derive(Error, Debug)]
pub enum ForkitError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("missing capabilities: {}", .0.join(", "))]
    Privilege(Vec<String>),

    #[error("sandbox install error: {0}")]
    SandboxInstall(String),

    #[error("jail construction error: {0}")]
    JailConstruction(String),

    #[error("command protocol error: {0}")]
    CommandProtocol(String),

    #[error("fork failed: {0}")]
    Fork(nix::Error),

    #[error("pre-initialization failed: {0}")]
    Preinit(String),

    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl ForkitError {
    /// Process exit status for an error that aborts the fork server.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => EX_USAGE,
            _ => EX_SOFTWARE,
        }
    }
}
