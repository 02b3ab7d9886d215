//! # forkit-core
//!
//! A pre-forking fork server that runs each worker in its own filesystem jail.
//!
//! This crate provides:
//! - A typestate worker pool driven by a line-oriented control channel
//! - Per-worker jails built from read-only bind mounts (or copies)
//! - Capability checks, seccomp-BPF policies and setrlimit directives
//! - A [`Platform`] seam over every privileged OS call, so the pool logic
//!   can be tested without root

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod error;
pub mod jail;
pub mod platform;
pub mod pool;
pub mod privilege;
pub mod rlimit;
pub mod seccomp;
pub mod worker;

#[cfg(test)]
mod testing;

pub use command::{ChannelEvent, Command, CommandChannel};
pub use config::ForkitConfig;
pub use error::ForkitError;
pub use jail::{DirRole, JailBuilder, TeardownOutcome};
pub use platform::{LinuxPlatform, Platform};
pub use pool::{Forking, PoolManager, PoolStatus, Preinitialized, Uninitialized};
pub use worker::{Renderer, WorkerContext, WorkerRecord};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, ForkitError>;
