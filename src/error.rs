//! Error types shared across the supervisor, resolver and trust layers.

use std::fmt;
use std::path::PathBuf;

/// A single external command that could not be run or exited unsuccessfully.
///
/// The display form always carries the exact command line so operators can
/// re-run it by hand.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitCode,
        stderr: String,
    },
}

impl CommandError {
    /// The command line that failed.
    pub fn command(&self) -> &str {
        match self {
            Self::Spawn { command, .. } | Self::Failed { command, .. } => command,
        }
    }
}

/// Exit code wrapper so signal terminations render sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub Option<i32>);

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "status {code}"),
            None => f.write_str("a signal"),
        }
    }
}

/// Resolver override file could not be written, copied or removed.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("failed to stage resolver file: {0}")]
    Stage(#[source] std::io::Error),
    #[error("failed to install resolver file {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to remove resolver file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: CommandError,
    },
}

/// Errors raised by the service supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("failed to write service descriptor {path}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render service descriptor: {0}")]
    Render(String),
    #[error("failed to launch service: `{command}` reported: {stderr}")]
    LaunchService { command: String, stderr: String },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to start {label}: {output}")]
    StartFailed { label: String, output: String },
    #[error("failed to lock {path}: {reason}")]
    Lock { path: PathBuf, reason: String },
    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),
}

/// Configuration file or environment override problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which direction a trust-store mutation was going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustAction {
    Install,
    Uninstall,
}

impl fmt::Display for TrustAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        })
    }
}

/// Errors raised by the certificate trust manager.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// A trust-store utility failed; the message names the exact command line.
    #[error("failed to {action} {}: {source}", path.display())]
    Command {
        action: TrustAction,
        path: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to {action} `{}`", path.display())]
    Failed {
        action: TrustAction,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid certificate: {0}")]
    Certificate(String),
}

/// The trust-on-first-use root fetch failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}
