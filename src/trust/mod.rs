//! Root CA trust management across system, browser and runtime stores.
//!
//! Mutations run sequentially in consumer order and stop at the first
//! failure. Stores already updated are left as they are.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::CommandRunner;
use crate::config::DaemonConfig;
use crate::error::{CommandError, FetchError, TrustAction, TrustError};

mod certificate;
pub mod fetch;
mod java;
mod nss;
mod system;

pub use certificate::{RootCertificate, short_text, trusted, trusted_with_roots};
pub use fetch::FetchConfig;
pub use java::JavaStore;
pub use nss::NssStore;
pub use system::SystemStore;

/// Kind of certificate consumer a store serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum TrustConsumer {
    System,
    Browser,
    Runtime,
}

impl TrustConsumer {
    pub const ALL: [TrustConsumer; 3] = [Self::System, Self::Browser, Self::Runtime];
}

impl fmt::Display for TrustConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::Browser => "browser",
            Self::Runtime => "runtime",
        })
    }
}

/// What a store needs to know about the certificate being (un)installed.
#[derive(Debug, Clone)]
pub struct TrustTarget {
    pub path: PathBuf,
    pub nickname: String,
}

impl TrustTarget {
    pub fn new(path: &Path, cert: &RootCertificate, prefix: &str) -> Result<Self, TrustError> {
        Ok(Self {
            path: path.to_path_buf(),
            nickname: format!("{prefix} {}", cert.serial_hex()?),
        })
    }

    /// File name used when the certificate is copied into an anchor directory.
    pub fn file_name(&self) -> String {
        format!("{}.crt", self.nickname.replace(char::is_whitespace, "-"))
    }

    pub fn path_arg(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{0}")]
    Unavailable(String),
}

/// One platform-native certificate store.
pub trait TrustStore: Send + Sync {
    fn consumer(&self) -> TrustConsumer;
    fn install(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError>;
    fn uninstall(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError>;
}

pub struct TrustManager {
    runner: Arc<dyn CommandRunner>,
    stores: Vec<Box<dyn TrustStore>>,
    consumers: BTreeSet<TrustConsumer>,
    nickname_prefix: String,
    fetch: FetchConfig,
}

impl TrustManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        mut stores: Vec<Box<dyn TrustStore>>,
        nickname_prefix: impl Into<String>,
        fetch: FetchConfig,
    ) -> Self {
        stores.sort_by_key(|store| store.consumer());
        Self {
            runner,
            stores,
            consumers: TrustConsumer::ALL.into_iter().collect(),
            nickname_prefix: nickname_prefix.into(),
            fetch,
        }
    }

    /// Stores detected on this host.
    pub fn from_config(cfg: &DaemonConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let elevate = !nix::unistd::geteuid().is_root();
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        let java_home = std::env::var_os("JAVA_HOME").map(PathBuf::from);
        let stores: Vec<Box<dyn TrustStore>> = vec![
            Box::new(SystemStore::detect(elevate)),
            Box::new(NssStore::detect(&home)),
            Box::new(JavaStore::detect(java_home.as_deref(), elevate)),
        ];
        Self::new(runner, stores, cfg.trust.nickname.clone(), FetchConfig::from_config(cfg))
    }

    /// Restrict mutations to `consumers`. An empty set means all of them.
    pub fn with_consumers(mut self, consumers: impl IntoIterator<Item = TrustConsumer>) -> Self {
        let consumers: BTreeSet<_> = consumers.into_iter().collect();
        if !consumers.is_empty() {
            self.consumers = consumers;
        }
        self
    }

    pub fn consumers(&self) -> &BTreeSet<TrustConsumer> {
        &self.consumers
    }

    pub fn install_file(&self, path: &Path) -> Result<(), TrustError> {
        self.apply(TrustAction::Install, path)
    }

    pub fn uninstall_file(&self, path: &Path) -> Result<(), TrustError> {
        self.apply(TrustAction::Uninstall, path)
    }

    fn apply(&self, action: TrustAction, path: &Path) -> Result<(), TrustError> {
        let failed = |source: Box<dyn std::error::Error + Send + Sync>| TrustError::Failed {
            action,
            path: path.to_path_buf(),
            source,
        };
        let target = RootCertificate::read(path)
            .and_then(|cert| TrustTarget::new(path, &cert, &self.nickname_prefix))
            .map_err(|e| failed(Box::new(e)))?;

        let stores = self
            .stores
            .iter()
            .filter(|store| self.consumers.contains(&store.consumer()));
        for store in stores {
            log::info!("{action}: {} trust store ({})", store.consumer(), target.nickname);
            let result = match action {
                TrustAction::Install => store.install(&target, self.runner.as_ref()),
                TrustAction::Uninstall => store.uninstall(&target, self.runner.as_ref()),
            };
            result.map_err(|e| match e {
                StoreError::Command(source) => TrustError::Command {
                    action,
                    path: path.to_path_buf(),
                    source,
                },
                other => failed(Box::new(other)),
            })?;
        }
        Ok(())
    }

    /// Insecure trust-on-first-use download; see [`fetch::insecure_fetch_root_certificate`].
    pub async fn fetch_root_certificate(&self, host: &str) -> Result<Vec<u8>, FetchError> {
        fetch::insecure_fetch_root_certificate(&self.fetch, host).await
    }
}
