//! Fork server configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding a debugger-attach delay in seconds.
///
/// Honoured once by the fork server at startup and once by every freshly
/// forked worker before it builds its jail.
pub const DEBUG_DELAY_ENV: &str = "FORKIT_SLEEP_FOR_DEBUGGER";

/// Default client port handed to the renderer.
pub const DEFAULT_CLIENT_PORT: u16 = 9980;

/// Configuration for the fork server and the workers it spawns
#[derive(Debug, Clone)]
pub struct ForkitConfig {
    /// Directory under which every worker jail is created
    pub child_root: PathBuf,

    /// Read-only base filesystem visible at each jail root
    pub sys_template: PathBuf,

    /// Renderer-specific template tree
    pub lo_template: PathBuf,

    /// Location of the renderer template inside each jail (relative)
    pub lo_subpath: PathBuf,

    /// Opaque client port passed to the renderer
    pub client_port: u16,

    /// Opaque supervisor location passed to the renderer
    pub master_location: String,

    /// Startup resource limits as `(name, value)` pairs
    pub rlimits: Vec<(String, String)>,

    /// Skip the capability check and the chroot (unprivileged environments)
    pub no_capabilities: bool,

    /// Skip syscall filter installation
    pub no_seccomp: bool,

    /// Try bind-mounting templates instead of copying them
    pub bind_mount: bool,

    /// Workers to fork right after startup
    pub prespawn: usize,

    /// Upper bound on a single wait for a control command
    pub poll_timeout: Duration,

    /// Delay before heavy work, to attach a debugger
    pub debug_delay: Option<Duration>,
}

impl Default for ForkitConfig {
    fn default() -> Self {
        Self {
            child_root: PathBuf::from("/opt/forkit/jails"),
            sys_template: PathBuf::from("/opt/forkit/systemplate"),
            lo_template: PathBuf::from("/opt/forkit/lotemplate"),
            lo_subpath: PathBuf::from("lo"),
            client_port: DEFAULT_CLIENT_PORT,
            master_location: String::new(),
            rlimits: Vec::new(),
            no_capabilities: false,
            no_seccomp: false,
            bind_mount: true,
            prespawn: 0,
            poll_timeout: Duration::from_secs(5),
            debug_delay: None,
        }
    }
}

impl ForkitConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ForkitConfigBuilder {
        ForkitConfigBuilder::default()
    }

    /// Renderer subpath with any leading `/` removed, so it joins under a jail.
    #[must_use]
    pub fn lo_subpath_relative(&self) -> &Path {
        self.lo_subpath
            .strip_prefix("/")
            .unwrap_or(self.lo_subpath.as_path())
    }
}

/// Builder for `ForkitConfig`
#[derive(Debug, Default)]
pub struct ForkitConfigBuilder {
    config: ForkitConfig,
}

impl ForkitConfigBuilder {
    #[must_use]
    pub fn child_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.child_root = path.into();
        self
    }

    #[must_use]
    pub fn sys_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sys_template = path.into();
        self
    }

    #[must_use]
    pub fn lo_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.lo_template = path.into();
        self
    }

    #[must_use]
    pub fn lo_subpath(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.lo_subpath = path.into();
        self
    }

    #[must_use]
    pub const fn client_port(mut self, port: u16) -> Self {
        self.config.client_port = port;
        self
    }

    #[must_use]
    pub fn master_location(mut self, location: impl Into<String>) -> Self {
        self.config.master_location = location.into();
        self
    }

    #[must_use]
    pub fn rlimit(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.rlimits.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn no_capabilities(mut self, skip: bool) -> Self {
        self.config.no_capabilities = skip;
        self
    }

    #[must_use]
    pub const fn no_seccomp(mut self, skip: bool) -> Self {
        self.config.no_seccomp = skip;
        self
    }

    #[must_use]
    pub const fn bind_mount(mut self, enabled: bool) -> Self {
        self.config.bind_mount = enabled;
        self
    }

    #[must_use]
    pub const fn prespawn(mut self, count: usize) -> Self {
        self.config.prespawn = count;
        self
    }

    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn debug_delay(mut self, delay: Option<Duration>) -> Self {
        self.config.debug_delay = delay;
        self
    }

    #[must_use]
    pub fn build(self) -> ForkitConfig {
        self.config
    }
}

/// Read the debugger delay from `FORKIT_SLEEP_FOR_DEBUGGER`.
///
/// Unset, unparseable or zero values mean no delay.
pub fn debug_delay_from_env() -> Option<Duration> {
    std::env::var(DEBUG_DELAY_ENV)
        .ok()
        .and_then(|v| parse_debug_delay(&v))
}

fn parse_debug_delay(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
    }
}

/// Sleep for the configured debugger delay, announcing our pid on stderr.
pub fn sleep_for_debugger(delay: Option<Duration>, role: &str) {
    if let Some(delay) = delay {
        eprintln!(
            "{role}: sleeping {} seconds to give you time to attach debugger to process {}",
            delay.as_secs(),
            std::process::id()
        );
        std::thread::sleep(delay);
    }
}
