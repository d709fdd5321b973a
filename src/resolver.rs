//! DNS resolver override management.
//!
//! macOS routes queries for `<tld>` to the nameserver named in
//! `/etc/resolver/<tld>`. On Linux the same effect comes from a
//! systemd-resolved drop-in with a routing-only `~<tld>` domain.
//! Both directories are root-owned, so the file is staged in a scratch
//! location and copied into place with `sudo`.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{CommandBuilder, CommandRunner};
use crate::config::DaemonConfig;
use crate::error::ResolverError;

/// macOS per-domain resolver directory.
pub const MACOS_RESOLVER_DIR: &str = "/etc/resolver";
/// systemd-resolved drop-in directory.
pub const RESOLVED_DROPIN_DIR: &str = "/etc/systemd/resolved.conf.d";

/// File layout understood by the host's resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverFlavor {
    /// `/etc/resolver/<tld>` with `nameserver` and `port` lines.
    MacOs,
    /// `<dir>/<tld>.conf` systemd-resolved drop-in.
    Resolved,
}

impl ResolverFlavor {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Resolved
        }
    }

    fn default_dir(self) -> &'static str {
        match self {
            Self::MacOs => MACOS_RESOLVER_DIR,
            Self::Resolved => RESOLVED_DROPIN_DIR,
        }
    }
}

pub struct ResolverConfigurator {
    tld: String,
    nameserver: IpAddr,
    port: u16,
    dir: PathBuf,
    flavor: ResolverFlavor,
    elevate: bool,
    runner: Arc<dyn CommandRunner>,
}

impl ResolverConfigurator {
    pub fn new(cfg: &DaemonConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let flavor = ResolverFlavor::detect();
        Self {
            tld: cfg.tld.clone(),
            nameserver: cfg.dns.bind,
            port: cfg.dns.udp_port,
            dir: cfg
                .resolver_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(flavor.default_dir())),
            flavor,
            elevate: !nix::unistd::geteuid().is_root(),
            runner,
        }
    }

    pub fn with_flavor(mut self, flavor: ResolverFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Whether privileged steps are prefixed with `sudo`.
    pub fn with_elevation(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Location of the override file for the configured TLD.
    pub fn path(&self) -> PathBuf {
        match self.flavor {
            ResolverFlavor::MacOs => self.dir.join(&self.tld),
            ResolverFlavor::Resolved => self.dir.join(format!("{}.conf", self.tld)),
        }
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn contents(&self) -> String {
        match self.flavor {
            ResolverFlavor::MacOs => {
                format!("nameserver {}\nport {}\n", self.nameserver, self.port)
            }
            ResolverFlavor::Resolved => {
                let dns = match self.nameserver {
                    IpAddr::V4(ip) => format!("{ip}:{}", self.port),
                    IpAddr::V6(ip) => format!("[{ip}]:{}", self.port),
                };
                format!("[Resolve]\nDNS={dns}\nDomains=~{}\n", self.tld)
            }
        }
    }

    /// Stage the override in a temp file and copy it into place.
    ///
    /// Overwrites an existing file. The staged copy is removed on every path.
    pub fn create_resolver_file(&self) -> Result<(), ResolverError> {
        let target = self.path();
        let mut staged = tempfile::Builder::new()
            .prefix("devnet-resolver-")
            .tempfile()
            .map_err(ResolverError::Stage)?;
        staged
            .write_all(self.contents().as_bytes())
            .map_err(ResolverError::Stage)?;
        staged.flush().map_err(ResolverError::Stage)?;
        staged.as_file().sync_all().map_err(ResolverError::Stage)?;

        let install = |cmd: CommandBuilder| {
            self.runner
                .run_checked(&self.privileged(cmd))
                .map_err(|source| ResolverError::Install {
                    path: target.clone(),
                    source,
                })
        };
        install(CommandBuilder::new("mkdir").args(["-p", &path_str(&self.dir)]))?;
        install(CommandBuilder::new("cp").args([path_str(staged.path()), path_str(&target)]))?;
        install(CommandBuilder::new("chmod").args(["644", &path_str(&target)]))?;
        if let Some(reload) = self.reload_command() {
            install(reload)?;
        }

        log::info!(
            "Routed .{} to {}:{} via {}",
            self.tld,
            self.nameserver,
            self.port,
            target.display()
        );
        Ok(())
    }

    /// Remove the override. Missing files are not an error.
    pub fn remove_resolver_file(&self) -> Result<(), ResolverError> {
        let target = self.path();
        let cmd = self.privileged(CommandBuilder::new("rm").args(["-f", &path_str(&target)]));
        self.runner
            .run_checked(&cmd)
            .map_err(|source| ResolverError::Remove {
                path: target.clone(),
                source,
            })?;
        if let Some(reload) = self.reload_command() {
            self.runner
                .run_checked(&self.privileged(reload))
                .map_err(|source| ResolverError::Remove {
                    path: target.clone(),
                    source,
                })?;
        }
        log::info!("Removed resolver override {}", target.display());
        Ok(())
    }

    /// systemd-resolved reads drop-ins only when it (re)loads.
    fn reload_command(&self) -> Option<CommandBuilder> {
        match self.flavor {
            ResolverFlavor::MacOs => None,
            ResolverFlavor::Resolved => Some(
                CommandBuilder::new("systemctl").args(["reload-or-restart", "systemd-resolved.service"]),
            ),
        }
    }

    fn privileged(&self, cmd: CommandBuilder) -> CommandBuilder {
        if self.elevate { cmd.elevated() } else { cmd }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use super::*;
    use crate::command::testing::{RecordingRunner, failed, ok};

    /// Executes `mkdir`/`cp`/`rm` for real so file effects can be asserted.
    fn filesystem_runner(staged: Arc<Mutex<Option<PathBuf>>>) -> RecordingRunner {
        RecordingRunner::new(move |cmd| {
            let args = &cmd.args;
            match cmd.program_name().as_str() {
                "mkdir" => fs::create_dir_all(&args[1])?,
                "cp" => {
                    *staged.lock().unwrap() = Some(PathBuf::from(&args[0]));
                    fs::copy(&args[0], &args[1]).map(|_| ())?
                }
                "rm" => {
                    let _ = fs::remove_file(&args[1]);
                }
                _ => {}
            }
            Ok(ok(""))
        })
    }

    fn configurator(dir: &Path, runner: Arc<dyn CommandRunner>) -> ResolverConfigurator {
        ResolverConfigurator::new(&DaemonConfig::default(), runner)
            .with_flavor(ResolverFlavor::MacOs)
            .with_dir(dir)
            .with_elevation(false)
    }

    #[test]
    fn macos_contents_are_two_lines() {
        let resolver = configurator(Path::new("/nonexistent"), Arc::new(RecordingRunner::succeeding()));
        assert_eq!(resolver.contents(), "nameserver 127.0.0.1\nport 8053\n");
        assert_eq!(resolver.path(), PathBuf::from("/nonexistent/test"));
    }

    #[test]
    fn resolved_dropin_routes_tld() {
        let resolver = configurator(Path::new("/etc/systemd/resolved.conf.d"), Arc::new(RecordingRunner::succeeding()))
            .with_flavor(ResolverFlavor::Resolved);
        assert_eq!(
            resolver.contents(),
            "[Resolve]\nDNS=127.0.0.1:8053\nDomains=~test\n"
        );
        assert!(resolver.path().ends_with("test.conf"));
    }

    #[test]
    fn create_overwrites_and_cleans_up_staging() {
        let dir = tempfile::tempdir().unwrap();
        let resolver_dir = dir.path().join("resolver");
        let staged = Arc::new(Mutex::new(None));
        let resolver = configurator(&resolver_dir, Arc::new(filesystem_runner(staged.clone())));

        fs::create_dir_all(&resolver_dir).unwrap();
        fs::write(resolver_dir.join("test"), "nameserver 10.0.0.1\nport 53\nextra\n").unwrap();

        resolver.create_resolver_file().unwrap();
        assert_eq!(
            fs::read_to_string(resolver_dir.join("test")).unwrap(),
            "nameserver 127.0.0.1\nport 8053\n"
        );
        let staged_path = staged.lock().unwrap().clone().unwrap();
        assert!(!staged_path.exists());
        assert!(resolver.exists());

        resolver.remove_resolver_file().unwrap();
        assert!(!resolver.exists());
    }

    #[test]
    fn privileged_copy_failure_is_resolver_error_with_command() {
        let runner = Arc::new(RecordingRunner::new(|cmd| {
            if cmd.program_name() == "sudo" && cmd.args[0] == "cp" {
                Ok(failed(1, "sudo: a password is required"))
            } else {
                Ok(ok(""))
            }
        }));
        let resolver = configurator(Path::new("/etc/resolver"), runner.clone()).with_elevation(true);

        let err = resolver.create_resolver_file().unwrap_err();
        assert!(matches!(err, ResolverError::Install { .. }));
        assert!(err.to_string().contains("/etc/resolver/test"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "sudo mkdir -p /etc/resolver");
        assert!(calls[1].starts_with("sudo cp "));
    }

    #[test]
    fn resolved_is_reloaded_after_create_and_remove() {
        let runner = Arc::new(RecordingRunner::succeeding());
        let resolver = configurator(Path::new(RESOLVED_DROPIN_DIR), runner.clone())
            .with_flavor(ResolverFlavor::Resolved)
            .with_elevation(true);

        resolver.create_resolver_file().unwrap();
        resolver.remove_resolver_file().unwrap();

        let calls = runner.calls();
        let reload = "sudo systemctl reload-or-restart systemd-resolved.service";
        assert_eq!(calls.len(), 6, "{calls:?}");
        assert_eq!(calls[3], reload);
        assert_eq!(calls[4], "sudo rm -f /etc/systemd/resolved.conf.d/test.conf");
        assert_eq!(calls[5], reload);
    }

    #[test]
    fn macos_resolver_is_not_reloaded() {
        let runner = Arc::new(RecordingRunner::succeeding());
        let resolver = configurator(Path::new(MACOS_RESOLVER_DIR), runner.clone()).with_elevation(true);

        resolver.create_resolver_file().unwrap();
        resolver.remove_resolver_file().unwrap();

        assert!(runner.calls().iter().all(|call| !call.contains("systemctl")));
    }

    #[test]
    fn failed_reload_is_an_install_error() {
        let runner = Arc::new(RecordingRunner::new(|cmd| {
            if cmd.args.iter().any(|arg| arg == "reload-or-restart") {
                Ok(failed(1, "Unit systemd-resolved.service not found."))
            } else {
                Ok(ok(""))
            }
        }));
        let resolver = configurator(Path::new(RESOLVED_DROPIN_DIR), runner)
            .with_flavor(ResolverFlavor::Resolved);

        let err = resolver.create_resolver_file().unwrap_err();
        assert!(matches!(err, ResolverError::Install { .. }), "{err}");
        assert!(err.to_string().contains("systemd-resolved"), "{err}");
    }
}
