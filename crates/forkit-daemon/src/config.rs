//! Command line parameters

use clap::Parser;
use forkit_core::ForkitConfig;
use forkit_core::config::{DEFAULT_CLIENT_PORT, debug_delay_from_env};
use forkit_core::rlimit::parse_rlimits_arg;
use std::path::PathBuf;

/// One warm worker is forked before the first command arrives
const DEFAULT_PRESPAWN: usize = 1;

/// Fork server keeping a warm pool of jailed document workers.
///
/// Reads `spawn <N>` and `setconfig <name> <value>` commands from stdin.
#[derive(Parser, Debug)]
#[command(name = "forkit", version, about)]
pub struct Cli {
    /// Directory under which every worker jail is created
    #[arg(long = "childroot", value_name = "PATH", value_parser = non_empty_path)]
    pub child_root: PathBuf,

    /// Read-only base filesystem shown at each jail root
    #[arg(long = "systemplate", value_name = "PATH", value_parser = non_empty_path)]
    pub sys_template: PathBuf,

    /// Renderer installation to expose inside each jail
    #[arg(long = "lotemplate", value_name = "PATH", value_parser = non_empty_path)]
    pub lo_template: PathBuf,

    /// Where the renderer installation appears inside a jail
    #[arg(long = "losubpath", value_name = "PATH", value_parser = non_empty_path)]
    pub lo_subpath: PathBuf,

    /// Client port handed to the renderer
    #[arg(long = "clientport", value_name = "PORT", default_value_t = DEFAULT_CLIENT_PORT)]
    pub client_port: u16,

    /// Supervisor location handed to the renderer
    #[arg(long = "masterport", value_name = "LOCATION", default_value = "")]
    pub master_location: String,

    /// Resource limits applied at startup, as `name:value;name:value`
    #[arg(long = "rlimits", value_name = "LIMITS")]
    pub rlimits: Option<String>,

    /// Run without capabilities and without chroot (ill advised)
    #[arg(long = "nocaps")]
    pub no_caps: bool,

    /// Run without syscall filtering (ill advised)
    #[arg(long = "noseccomp")]
    pub no_seccomp: bool,

    /// Copy templates into jails instead of bind mounting them
    #[arg(long = "nobindmount")]
    pub no_bind_mount: bool,

    /// Workers to fork right after startup; 0 waits for `spawn`
    #[arg(long = "prespawn", value_name = "N", default_value_t = DEFAULT_PRESPAWN)]
    pub prespawn: usize,
}

impl Cli {
    pub fn into_config(self) -> ForkitConfig {
        let mut builder = ForkitConfig::builder()
            .child_root(self.child_root)
            .sys_template(self.sys_template)
            .lo_template(self.lo_template)
            .lo_subpath(self.lo_subpath)
            .client_port(self.client_port)
            .master_location(self.master_location)
            .no_capabilities(self.no_caps)
            .no_seccomp(self.no_seccomp)
            .bind_mount(!self.no_bind_mount)
            .prespawn(self.prespawn)
            .debug_delay(debug_delay_from_env());

        for (name, value) in self.rlimits.as_deref().map(parse_rlimits_arg).unwrap_or_default() {
            builder = builder.rlimit(name, value);
        }

        builder.build()
    }
}

fn non_empty_path(value: &str) -> Result<PathBuf, String> {
    if value.trim().is_empty() {
        Err("path must not be empty".to_owned())
    } else {
        Ok(PathBuf::from(value))
    }
}
