//! Per-worker filesystem jails
//!
//! A jail lives at `<child_root>/<jail_id>` and contains:
//! - the system template at its root (read-only bind mount, or a copy),
//! - the renderer template at `<lo_subpath>` (same treatment), whose presence
//!   marks the directory as a jail,
//! - a writable `tmp`, backed in bind mode by `<child_root>/tmp/<jail_id>`,
//! - `dev/random` and `dev/urandom`.
//!
//! Teardown always unmounts before deleting. Deleting through a live bind
//! mount would delete the shared template itself.

use crate::config::ForkitConfig;
use crate::platform::Platform;
use crate::{ForkitError, Result};
use rand::distr::{Alphanumeric, SampleString};
use std::cell::OnceCell;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the scratch directory inside a jail and of the shared scratch
/// container under the jail root
pub const TMP_DIR: &str = "tmp";

/// Mount point used for the startup bind-mount trial
const TEST_MOUNT_DIR: &str = "forkit_test_mount";

/// Random device nodes every jail needs: (name, major, minor)
const DEVICE_NODES: [(&str, u64, u64); 2] = [("random", 1, 8), ("urandom", 1, 9)];

const JAIL_ID_LEN: usize = 16;

/// Fresh filename-safe identifier for a worker's jail directory
#[must_use]
pub fn generate_jail_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), JAIL_ID_LEN)
}

/// What a directory under the jail root is, for cleanup purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRole {
    /// A single worker jail (carries the template-mount marker)
    Jail,
    /// Scratch space, deleted unconditionally and never treated as a jail
    TmpScratch,
    /// Holds jails or other containers
    Container,
}

impl DirRole {
    /// Classify a directory found while walking a container
    fn of_child(name: &OsStr, path: &Path, marker: &Path) -> Self {
        if name == TMP_DIR {
            Self::TmpScratch
        } else {
            Self::of_root(path, marker)
        }
    }

    /// Classify the directory a cleanup starts from; its name is not consulted
    fn of_root(path: &Path, marker: &Path) -> Self {
        if path.join(marker).exists() {
            Self::Jail
        } else {
            Self::Container
        }
    }
}

/// Result of tearing down one jail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The jail directory no longer exists
    Removed,
    /// Something was still mounted or present after unmounting; left in place
    Preserved,
}

/// Builds and tears down worker jails under a shared jail root
#[derive(Debug)]
pub struct JailBuilder {
    child_root: PathBuf,
    sys_template: PathBuf,
    lo_template: PathBuf,
    lo_subpath: PathBuf,
    bind_requested: bool,
    bind_mounts: OnceCell<bool>,
}

impl JailBuilder {
    #[must_use]
    pub fn new(config: &ForkitConfig) -> Self {
        Self {
            child_root: config.child_root.clone(),
            sys_template: config.sys_template.clone(),
            lo_template: config.lo_template.clone(),
            lo_subpath: config.lo_subpath_relative().to_path_buf(),
            bind_requested: config.bind_mount,
            bind_mounts: OnceCell::new(),
        }
    }

    /// Whether jails are built with bind mounts. False until
    /// [`setup_shared_state`](Self::setup_shared_state) has run.
    #[must_use]
    pub fn bind_mounts_enabled(&self) -> bool {
        self.bind_mounts.get().copied().unwrap_or(false)
    }

    #[must_use]
    pub fn jail_path(&self, jail_id: &str) -> PathBuf {
        self.child_root.join(jail_id)
    }

    fn scratch_backing(&self, jail_id: &OsStr) -> PathBuf {
        self.child_root.join(TMP_DIR).join(jail_id)
    }

    /// Whether teardown must assume content may still be mounted.
    ///
    /// Before the trial mount has run, stale jails from an earlier run are
    /// treated according to what the operator requested.
    fn guard_mounted_content(&self) -> bool {
        self.bind_mounts.get().copied().unwrap_or(self.bind_requested)
    }

    /// One-time startup preparation shared by every future jail.
    ///
    /// Wipes stale jails, prepares mount points and device nodes in the
    /// system template and decides whether bind mounting works here.
    pub fn setup_shared_state(&self, platform: &impl Platform) -> Result<()> {
        if self.bind_mounts.get().is_some() {
            return Err(ForkitError::JailConstruction(
                "shared jail state is already set up".into(),
            ));
        }

        // Start with a clean slate.
        self.cleanup_jails(platform, &self.child_root);
        fs::create_dir_all(&self.child_root).map_err(|e| {
            ForkitError::JailConstruction(format!(
                "failed to create jail root {}: {e}",
                self.child_root.display()
            ))
        })?;

        for dir in [Path::new(TMP_DIR), Path::new("dev"), self.lo_subpath.as_path()] {
            let path = self.sys_template.join(dir);
            if let Err(e) = fs::create_dir_all(&path) {
                tracing::warn!(path = ?path, error = %e, "failed to create mount point in system template");
            }
        }
        self.setup_device_nodes(platform, &self.sys_template);

        let enabled = if self.bind_requested {
            self.trial_bind_mount(platform)
        } else {
            tracing::info!("bind mounting of jail contents disabled by configuration");
            false
        };

        self.bind_mounts
            .set(enabled)
            .map_err(|_| ForkitError::JailConstruction("shared jail state is already set up".into()))
    }

    /// Bind and unbind the system template once to see whether mounts work.
    fn trial_bind_mount(&self, platform: &impl Platform) -> bool {
        let target = self.child_root.join(TEST_MOUNT_DIR);
        if let Err(e) = fs::create_dir_all(&target) {
            tracing::error!(target = ?target, error = %e, "failed to create bind mount trial directory");
            return false;
        }

        let mounted = platform
            .bind_mount(&self.sys_template, &target)
            .and_then(|()| platform.remount_readonly(&self.sys_template, &target));

        // Clean up whether or not the mount went through.
        remove_mount_point(platform, &target);

        match mounted {
            Ok(()) => {
                tracing::info!("enabling bind mounting of jail contents");
                true
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "bind mounting fails and will be disabled for this run; jails will be copied"
                );
                false
            }
        }
    }

    /// Build the jail for `jail_id` and return its path.
    ///
    /// Once bind mounting has been enabled any mount failure is fatal for
    /// this worker; copying is only used when bind mounting was never
    /// enabled.
    pub fn mount_for_worker(&self, platform: &impl Platform, jail_id: &str) -> Result<PathBuf> {
        let jail = self.jail_path(jail_id);
        fs::create_dir_all(&jail).map_err(|e| {
            ForkitError::JailConstruction(format!("failed to create jail {}: {e}", jail.display()))
        })?;

        if self.bind_mounts_enabled() {
            self.bind_jail(platform, jail_id, &jail)?;
        } else {
            self.copy_jail(platform, &jail)?;
        }

        tracing::debug!(jail = ?jail, bind = self.bind_mounts_enabled(), "jail ready");
        Ok(jail)
    }

    fn bind_jail(&self, platform: &impl Platform, jail_id: &str, jail: &Path) -> Result<()> {
        bind_readonly(platform, &self.sys_template, jail)?;

        let lo_dest = jail.join(&self.lo_subpath);
        bind_readonly(platform, &self.lo_template, &lo_dest)?;

        let scratch = self.scratch_backing(OsStr::new(jail_id));
        fs::create_dir_all(&scratch).map_err(|e| {
            ForkitError::JailConstruction(format!(
                "failed to create scratch directory {}: {e}",
                scratch.display()
            ))
        })?;
        platform.bind_mount(&scratch, &jail.join(TMP_DIR))
    }

    fn copy_jail(&self, platform: &impl Platform, jail: &Path) -> Result<()> {
        copy_tree(&self.sys_template, jail)?;
        copy_tree(&self.lo_template, &jail.join(&self.lo_subpath))?;
        fs::create_dir_all(jail.join(TMP_DIR))?;
        self.setup_device_nodes(platform, jail);
        Ok(())
    }

    /// Unmount and delete one jail.
    ///
    /// Mounts are released child before ancestor. When content may still be
    /// mounted and the directory is not empty afterwards, the jail is left in
    /// place and reported as [`TeardownOutcome::Preserved`].
    pub fn teardown_for_worker(
        &self,
        platform: &impl Platform,
        jail: &Path,
    ) -> Result<TeardownOutcome> {
        if !jail.exists() {
            return Ok(TeardownOutcome::Removed);
        }

        tracing::info!(jail = ?jail, "removing jail");

        // Scratch contents go regardless of mount state.
        let tmp = jail.join(TMP_DIR);
        remove_dir_contents(&tmp);
        unmount_logged(platform, &tmp);
        unmount_logged(platform, &jail.join(&self.lo_subpath));
        unmount_logged(platform, jail);

        if let Some(jail_id) = jail.file_name() {
            let scratch = self.scratch_backing(jail_id);
            if let Err(e) = fs::remove_dir_all(&scratch)
                && e.kind() != ErrorKind::NotFound
            {
                tracing::warn!(scratch = ?scratch, error = %e, "failed to remove jail scratch directory");
            }
        }

        if self.guard_mounted_content() {
            if !is_empty_dir(jail) {
                tracing::warn!(jail = ?jail, "jail is not empty after unmounting, will not remove it");
                return Ok(TeardownOutcome::Preserved);
            }
            fs::remove_dir(jail)?;
        } else {
            fs::remove_dir_all(jail)?;
        }

        Ok(TeardownOutcome::Removed)
    }

    /// Recursively clean up every jail under `root`.
    ///
    /// Never fails: problems are logged and the affected directories kept.
    pub fn cleanup_jails(&self, platform: &impl Platform, root: &Path) {
        if !root.is_dir() {
            return;
        }

        tracing::info!(root = ?root, "cleaning up jail root");

        match DirRole::of_root(root, &self.lo_subpath) {
            DirRole::Jail => {
                if let Err(e) = self.teardown_for_worker(platform, root) {
                    tracing::warn!(jail = ?root, error = %e, "failed to remove jail");
                }
                return;
            }
            DirRole::TmpScratch | DirRole::Container => self.cleanup_container(platform, root),
        }

        if is_empty_dir(root) {
            if let Err(e) = fs::remove_dir(root) {
                tracing::warn!(root = ?root, error = %e, "failed to remove empty jail directory");
            }
        } else {
            tracing::warn!(root = ?root, "jail root directory is not empty, will not remove it");
        }
    }

    fn cleanup_container(&self, platform: &impl Platform, root: &Path) {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = ?root, error = %e, "failed to list jail directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            match DirRole::of_child(&entry.file_name(), &path, &self.lo_subpath) {
                DirRole::TmpScratch => {
                    if let Err(e) = fs::remove_dir_all(&path) {
                        tracing::warn!(path = ?path, error = %e, "failed to delete scratch directory");
                    }
                }
                DirRole::Jail | DirRole::Container => self.cleanup_jails(platform, &path),
            }
        }
    }

    /// Create `dev/random` and `dev/urandom` under `root` if absent.
    ///
    /// Failures are logged and otherwise ignored: some mounts forbid device
    /// nodes, which the operator has to fix.
    pub fn setup_device_nodes(&self, platform: &impl Platform, root: &Path) {
        let dev = root.join("dev");
        if let Err(e) = fs::create_dir_all(&dev) {
            tracing::error!(dev = ?dev, error = %e, "failed to create dev directory");
            return;
        }

        for (name, major, minor) in DEVICE_NODES {
            let node = dev.join(name);
            if node.symlink_metadata().is_ok() {
                continue;
            }

            tracing::debug!(node = ?node, "making device node");
            if let Err(e) = platform.make_char_device(&node, major, minor) {
                tracing::error!(
                    node = ?node,
                    error = %e,
                    "mknod failed; the mount must not use the nodev flag"
                );
            }
        }
    }
}

fn bind_readonly(platform: &impl Platform, source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(|e| {
        ForkitError::JailConstruction(format!(
            "failed to create mount point {}: {e}",
            target.display()
        ))
    })?;
    platform.bind_mount(source, target)?;
    platform.remount_readonly(source, target)?;
    tracing::trace!(source = ?source, target = ?target, "bind mounted read-only");
    Ok(())
}

/// Unmount `path` and remove it if it is empty afterwards.
fn remove_mount_point(platform: &impl Platform, path: &Path) {
    unmount_logged(platform, path);

    if !is_empty_dir(path) {
        tracing::warn!(path = ?path, "path is not empty after unmounting, will not remove it");
        return;
    }

    if let Err(e) = fs::remove_dir(path)
        && e.kind() != ErrorKind::NotFound
    {
        tracing::warn!(path = ?path, error = %e, "failed to remove mount point");
    }
}

fn unmount_logged(platform: &impl Platform, target: &Path) {
    tracing::debug!(target = ?target, "unmounting");
    if let Err(e) = platform.unmount(target) {
        tracing::error!(target = ?target, error = %e, "failed to unmount");
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

/// Delete everything inside `dir`, keeping `dir` itself
fn remove_dir_contents(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        if let Err(e) = removed {
            tracing::debug!(path = ?path, error = %e, "failed to delete scratch entry");
        }
    }
}

/// Recursively copy `source` into `target`.
///
/// Directories, regular files and symlinks are copied; device nodes, fifos
/// and sockets are skipped.
fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(ForkitError::JailConstruction(format!(
            "template directory does not exist: {}",
            source.display()
        )));
    }

    fs::create_dir_all(target)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            std::os::unix::fs::symlink(link, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::trace!(path = ?from, "skipping special file while copying template");
        }
    }

    // After the contents: a read-only directory cannot be filled.
    fs::set_permissions(target, fs::metadata(source)?.permissions())?;
    Ok(())
}
