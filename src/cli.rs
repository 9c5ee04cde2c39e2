//! Top-level CLI flag definition (spec §6 "CLI surface").
//!
//! Out of core scope per spec §1 ("a thin CLI ... is also out of scope"),
//! carried as the ambient wrapper spec §9/SPEC_FULL.md §F describes: flag
//! parsing, default path resolution, and `--dump-config`. No subcommands —
//! the daemon has a single mode of operation, unlike the teacher's
//! install/status/scan surface.

use std::path::PathBuf;

use clap::Parser;

/// `keydeckd` — paging daemon for a 14-button LCD control deck.
#[derive(Parser, Debug)]
#[command(name = "keydeckd", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/keydeckd/config.yaml")]
    pub config: PathBuf,

    /// Path to the device service's command/event socket.
    #[arg(long = "ulanzi-sock", default_value = "/run/keydeckd/ulanzi.sock")]
    pub ulanzi_sock: PathBuf,

    /// Path to the control socket (start/stop, load-last-page, simulate-button).
    #[arg(long = "control-sock", default_value = "/run/keydeckd/control.sock")]
    pub control_sock: PathBuf,

    /// Path to the home-automation side-car socket.
    #[arg(long = "ha-sock", default_value = "/run/keydeckd/ha.sock")]
    pub ha_sock: PathBuf,

    /// Persistent icon cache root.
    #[arg(long, default_value = "/var/cache/keydeckd")]
    pub cache: PathBuf,

    /// Fallback icon substituted for pipeline/validation failures.
    #[arg(long = "error-icon")]
    pub error_icon: Option<PathBuf>,

    /// Directory holding pregenerated system icons and the label-style JSON.
    #[arg(long = "sys-pregen-dir")]
    pub sys_pregen_dir: Option<PathBuf>,

    /// Session (tmpfs-backed) state directory: `last_page`, `last_offset`, RAM cache mirror.
    #[arg(long = "state-dir", default_value = "/dev/shm/keydeckd")]
    pub state_dir: PathBuf,

    /// Resolve configuration, print it as JSON, and exit without starting the daemon.
    #[arg(long = "dump-config")]
    pub dump_config: bool,

    /// Verbose logging: disables the interactive status line, logs at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Build the resolved path set the daemon aggregate is constructed from.
    #[must_use]
    pub fn daemon_paths(&self) -> crate::daemon::DaemonPaths {
        crate::daemon::DaemonPaths {
            config: self.config.clone(),
            device_sock: self.ulanzi_sock.clone(),
            control_sock: self.control_sock.clone(),
            ha_sock: self.ha_sock.clone(),
            cache_root: self.cache.clone(),
            state_dir: self.state_dir.clone(),
            error_icon: self.error_icon.clone(),
            sys_pregen_dir: self.sys_pregen_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn defaults_resolve_without_any_flags() {
        let cli = Cli::parse_from(["keydeckd"]);
        assert_eq!(cli.config, std::path::Path::new("/etc/keydeckd/config.yaml"));
        assert!(!cli.dump_config);
        assert!(!cli.verbose);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["keydeckd", "--config", "/tmp/x.yaml", "--dump-config", "-v"]);
        assert_eq!(cli.config, std::path::Path::new("/tmp/x.yaml"));
        assert!(cli.dump_config);
        assert!(cli.verbose);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let result = Cli::try_parse_from(["keydeckd", "--nope"]);
        assert!(result.is_err());
    }
}
