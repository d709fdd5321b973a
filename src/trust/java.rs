//! Java runtime `cacerts` keystore.

use std::path::{Path, PathBuf};

use super::{StoreError, TrustConsumer, TrustStore, TrustTarget};
use crate::command::{CommandBuilder, CommandRunner};

const STOREPASS: &str = "changeit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keystore {
    pub keytool: PathBuf,
    pub cacerts: PathBuf,
    pub elevate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaStore {
    keystore: Option<Keystore>,
}

impl JavaStore {
    pub fn new(keystore: Option<Keystore>) -> Self {
        Self { keystore }
    }

    /// Locate `keytool` and `cacerts` under `JAVA_HOME`. Elevation is only
    /// requested when the keystore is not writable by the current user.
    pub fn detect(java_home: Option<&Path>, elevate: bool) -> Self {
        let keystore = java_home.and_then(|home| {
            let keytool = home.join("bin").join("keytool");
            let cacerts = [
                home.join("lib").join("security").join("cacerts"),
                home.join("jre").join("lib").join("security").join("cacerts"),
            ]
            .into_iter()
            .find(|p| p.is_file())?;
            let writable = std::fs::OpenOptions::new().append(true).open(&cacerts).is_ok();
            Some(Keystore {
                keytool,
                cacerts,
                elevate: elevate && !writable,
            })
        });
        Self::new(keystore)
    }

    fn keystore(&self) -> Option<&Keystore> {
        if self.keystore.is_none() {
            log::warn!("No Java keystore found (JAVA_HOME unset or without cacerts), skipping runtime trust store");
        }
        self.keystore.as_ref()
    }
}

impl Keystore {
    fn keytool(&self, args: Vec<String>) -> CommandBuilder {
        let cmd = CommandBuilder::new(&self.keytool).args(args);
        if self.elevate { cmd.elevated() } else { cmd }
    }
}

impl TrustStore for JavaStore {
    fn consumer(&self) -> TrustConsumer {
        TrustConsumer::Runtime
    }

    fn install(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        let Some(keystore) = self.keystore() else {
            return Ok(());
        };
        let cmd = keystore.keytool(vec![
            "-importcert".into(),
            "-noprompt".into(),
            "-alias".into(),
            target.nickname.clone(),
            "-keystore".into(),
            keystore.cacerts.to_string_lossy().into_owned(),
            "-storepass".into(),
            STOREPASS.into(),
            "-file".into(),
            target.path_arg(),
        ]);
        runner.run_checked(&cmd)?;
        log::info!("Installed {} into {}", target.nickname, keystore.cacerts.display());
        Ok(())
    }

    fn uninstall(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        let Some(keystore) = self.keystore() else {
            return Ok(());
        };
        let cmd = keystore.keytool(vec![
            "-delete".into(),
            "-alias".into(),
            target.nickname.clone(),
            "-keystore".into(),
            keystore.cacerts.to_string_lossy().into_owned(),
            "-storepass".into(),
            STOREPASS.into(),
        ]);
        runner.run_checked(&cmd)?;
        log::info!("Removed {} from {}", target.nickname, keystore.cacerts.display());
        Ok(())
    }
}
