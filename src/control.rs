//! Daemon lifecycle control - delegates to OS-native service managers
//!
//! Provides a unified interface for managing the daemon across operating systems:
//! - macOS: launchd (launchctl), per-user GUI domain
//! - Linux: systemd user manager (systemctl --user)
//!
//! [`Supervisor`] owns the ordering rules; [`ServiceBackend`] only knows how to
//! render a descriptor and which command performs each capability.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{Flock, FlockArg};

use crate::command::{CommandBuilder, CommandOutput, CommandRunner};
use crate::config::{self, DaemonConfig};
use crate::error::ControlError;
use crate::resolver::ResolverConfigurator;

mod launchd;
mod systemd;

pub use launchd::LaunchdBackend;
pub use systemd::SystemdBackend;

/// What the service manager is asked to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Environment the service manager sets for the daemon.
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl ServiceDescriptor {
    /// Describe the currently running executable as
    /// `<exe> --config <config_path> run`, carrying `env` along.
    ///
    /// The daemon then loads the same file and overrides that shaped the
    /// resolver file at install time.
    pub fn current(
        label: &str,
        config_path: &Path,
        env: BTreeMap<String, String>,
    ) -> Result<Self, ControlError> {
        let exe = std::env::current_exe()
            .and_then(|p| p.canonicalize())
            .map_err(|source| ControlError::Descriptor {
                path: PathBuf::from(label),
                source,
            })?;
        let config_path = std::path::absolute(config_path).map_err(|source| ControlError::Descriptor {
            path: config_path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            label: label.to_string(),
            program: exe,
            args: daemon_args(&config_path),
            env,
            log_file: Some(config::data_dir().join("devnetd.log")),
        })
    }
}

/// Arguments that run the daemon in the foreground against `config_path`.
pub fn daemon_args(config_path: &Path) -> Vec<String> {
    vec![
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
        "run".to_string(),
    ]
}

/// Platform capability set for one service manager.
pub trait ServiceBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn descriptor_path(&self) -> PathBuf;
    fn render(&self, descriptor: &ServiceDescriptor) -> Result<String, ControlError>;
    /// Load the descriptor into the user's domain (and start it).
    fn register(&self) -> CommandBuilder;
    /// Unload the descriptor (and stop it).
    fn unregister(&self) -> CommandBuilder;
    fn start(&self) -> CommandBuilder;
    fn status(&self) -> CommandBuilder;
    /// Whether a completed status query shows the service as registered.
    fn status_loaded(&self, output: &CommandOutput) -> bool;
    /// PID assigned to the service, if the status text shows one.
    fn pid(&self, status: &str) -> Option<u32>;
}

/// Select the backend for the host OS.
pub fn detect_backend(label: &str) -> Result<Box<dyn ServiceBackend>, ControlError> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            Ok(Box::new(LaunchdBackend::for_current_user(label)?))
        } else if #[cfg(target_os = "linux")] {
            Ok(Box::new(SystemdBackend::for_current_user(label)?))
        } else {
            let _ = label;
            Err(ControlError::Unsupported(std::env::consts::OS))
        }
    }
}

/// Lifecycle state derived from registration, resolver file and liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    NotInstalled,
    InstalledStopped,
    InstalledRunning,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotInstalled => "not installed",
            Self::InstalledStopped => "installed, stopped",
            Self::InstalledRunning => "installed, running",
        })
    }
}

/// Installs, starts, stops and queries the background daemon.
///
/// Not safe for concurrent use across processes except through
/// [`install`](Self::install) and [`uninstall`](Self::uninstall), which hold
/// an exclusive lock on `<lock_dir>/<label>.lock`.
pub struct Supervisor {
    backend: Box<dyn ServiceBackend>,
    resolver: ResolverConfigurator,
    runner: Arc<dyn CommandRunner>,
    descriptor: ServiceDescriptor,
    settle_delay: Duration,
    lock_dir: PathBuf,
}

impl Supervisor {
    pub fn new(
        backend: Box<dyn ServiceBackend>,
        resolver: ResolverConfigurator,
        runner: Arc<dyn CommandRunner>,
        descriptor: ServiceDescriptor,
    ) -> Self {
        Self {
            backend,
            resolver,
            runner,
            descriptor,
            settle_delay: Duration::from_secs(1),
            lock_dir: config::data_dir(),
        }
    }

    /// Wire up the host backend, resolver and current executable.
    ///
    /// `config_path` is the file `cfg` was loaded from. The `DEVNET_*`
    /// overrides in this process's environment are handed to the service.
    pub fn from_config(
        cfg: &DaemonConfig,
        config_path: &Path,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ControlError> {
        let backend = detect_backend(&cfg.label)?;
        log::debug!("using {} service backend", backend.name());
        let resolver = ResolverConfigurator::new(cfg, runner.clone());
        let env = DaemonConfig::env_overrides(|key| std::env::var(key).ok());
        let descriptor = ServiceDescriptor::current(&cfg.label, config_path, env)?;
        Ok(Self::new(backend, resolver, runner, descriptor).with_settle_delay(cfg.settle_delay()))
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.backend.descriptor_path()
    }

    /// True iff the service manager knows the service and the resolver file exists.
    pub fn installed(&self) -> bool {
        let registered = match self.runner.run(&self.backend.status()) {
            Ok(output) => self.backend.status_loaded(&output),
            Err(e) => {
                log::debug!("status query failed: {e}");
                false
            }
        };
        registered && self.resolver.exists()
    }

    /// Resolver file, then descriptor, then registration. Fail-fast without
    /// rollback: a failed registration leaves the resolver file in place.
    pub fn install(&self) -> Result<(), ControlError> {
        let _lock = self.lock()?;

        self.resolver.create_resolver_file()?;
        self.write_descriptor()?;

        let register = self.backend.register();
        let output = self.runner.run(&register).map_err(|source| {
            crate::error::CommandError::Spawn {
                command: register.to_string(),
                source,
            }
        })?;
        let stderr = output.stderr.trim();
        if !stderr.is_empty() || !output.success() {
            let stderr = if stderr.is_empty() {
                format!("exited with status {:?}", output.code)
            } else {
                stderr.to_string()
            };
            return Err(ControlError::LaunchService {
                command: register.to_string(),
                stderr,
            });
        }

        log::info!(
            "Registered {} with {}",
            self.descriptor.label,
            self.backend.name()
        );
        Ok(())
    }

    /// Unregister from the service manager.
    pub fn stop(&self) -> Result<(), ControlError> {
        self.runner.run_checked(&self.backend.unregister())?;
        log::info!("Unregistered {}", self.descriptor.label);
        Ok(())
    }

    /// Liveness: a status query showing an assigned PID.
    pub fn running(&self) -> bool {
        match self.runner.run(&self.backend.status()) {
            Ok(output) if output.success() => self.backend.pid(&output.stdout).is_some(),
            Ok(_) => false,
            Err(e) => {
                log::debug!("status query failed: {e}");
                false
            }
        }
    }

    /// Issue one start, wait the settle delay, re-check once.
    pub fn run_server(&self) -> Result<(), ControlError> {
        let start = self.backend.start();
        let output = self.runner.run(&start).map_err(|source| {
            crate::error::CommandError::Spawn {
                command: start.to_string(),
                source,
            }
        })?;

        std::thread::sleep(self.settle_delay);

        if self.running() {
            log::info!("{} is running", self.descriptor.label);
            return Ok(());
        }
        let captured = [output.stdout.trim(), output.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Err(ControlError::StartFailed {
            label: self.descriptor.label.clone(),
            output: if captured.is_empty() {
                format!("`{start}` produced no output")
            } else {
                captured
            },
        })
    }

    /// Unregister, delete the descriptor, delete the resolver file.
    pub fn uninstall(&self) -> Result<(), ControlError> {
        let _lock = self.lock()?;

        if let Err(e) = self.runner.run_checked(&self.backend.unregister()) {
            log::warn!("Unregister failed (service may not be loaded): {e}");
        }

        let path = self.backend.descriptor_path();
        match fs::remove_file(&path) {
            Ok(()) => log::info!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ControlError::Descriptor { path, source }),
        }

        self.resolver.remove_resolver_file()?;
        Ok(())
    }

    pub fn state(&self) -> DaemonState {
        if !self.installed() {
            DaemonState::NotInstalled
        } else if self.running() {
            DaemonState::InstalledRunning
        } else {
            DaemonState::InstalledStopped
        }
    }

    fn write_descriptor(&self) -> Result<(), ControlError> {
        let path = self.backend.descriptor_path();
        let content = self.backend.render(&self.descriptor)?;
        let io_err = |source| ControlError::Descriptor {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        if let Some(log_dir) = self.descriptor.log_file.as_deref().and_then(Path::parent) {
            fs::create_dir_all(log_dir).map_err(io_err)?;
        }
        write_file_atomic(&path, &content).map_err(io_err)?;
        log::info!("Wrote service descriptor {}", path.display());
        Ok(())
    }

    fn lock(&self) -> Result<Flock<File>, ControlError> {
        let path = self.lock_dir.join(format!("{}.lock", self.descriptor.label));
        let lock_err = |reason: String| ControlError::Lock {
            path: path.clone(),
            reason,
        };
        fs::create_dir_all(&self.lock_dir).map_err(|e| lock_err(e.to_string()))?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| lock_err(e.to_string()))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| lock_err(errno.to_string()))
    }
}

/// Write via temp file + rename so a half-written descriptor is never loaded.
fn write_file_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}
