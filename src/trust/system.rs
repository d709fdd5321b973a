//! Operating-system trust store.

use std::path::{Path, PathBuf};

use super::{StoreError, TrustConsumer, TrustStore, TrustTarget};
use crate::command::{CommandBuilder, CommandRunner};

const MACOS_SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Linux anchor directories and the refresh command each distribution family uses.
const LINUX_ANCHORS: &[(&str, &[&str])] = &[
    // Debian, Ubuntu, Alpine
    ("/usr/local/share/ca-certificates", &["update-ca-certificates"]),
    // Fedora, RHEL
    ("/etc/pki/ca-trust/source/anchors", &["update-ca-trust", "extract"]),
    // Arch
    ("/etc/ca-certificates/trust-source/anchors", &["trust", "extract-compat"]),
    // openSUSE
    ("/usr/share/pki/trust/anchors", &["update-ca-certificates"]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemStore {
    /// macOS admin trust settings in the System keychain.
    Keychain { keychain: PathBuf, elevate: bool },
    /// Linux anchor directory plus refresh command.
    Anchors {
        dir: PathBuf,
        refresh: Vec<String>,
        elevate: bool,
    },
    Unsupported,
}

impl SystemStore {
    pub fn detect(elevate: bool) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                Self::system_keychain(elevate)
            } else if #[cfg(target_os = "linux")] {
                Self::detect_anchors(Path::new("/"), elevate)
            } else {
                let _ = elevate;
                Self::Unsupported
            }
        }
    }

    pub fn system_keychain(elevate: bool) -> Self {
        Self::Keychain {
            keychain: PathBuf::from(MACOS_SYSTEM_KEYCHAIN),
            elevate,
        }
    }

    /// First known anchor directory that exists under `root`.
    pub fn detect_anchors(root: &Path, elevate: bool) -> Self {
        LINUX_ANCHORS
            .iter()
            .map(|(dir, refresh)| (root.join(dir.trim_start_matches('/')), refresh))
            .find(|(dir, _)| dir.is_dir())
            .map(|(dir, refresh)| Self::Anchors {
                dir,
                refresh: refresh.iter().map(|s| s.to_string()).collect(),
                elevate,
            })
            .unwrap_or(Self::Unsupported)
    }

    fn privileged(cmd: CommandBuilder, elevate: bool) -> CommandBuilder {
        if elevate { cmd.elevated() } else { cmd }
    }

    fn refresh_command(refresh: &[String], elevate: bool) -> Option<CommandBuilder> {
        let (program, args) = refresh.split_first()?;
        Some(Self::privileged(
            CommandBuilder::new(program).args(args.iter().cloned()),
            elevate,
        ))
    }
}

impl TrustStore for SystemStore {
    fn consumer(&self) -> TrustConsumer {
        TrustConsumer::System
    }

    fn install(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        match self {
            Self::Keychain { keychain, elevate } => {
                let cmd = CommandBuilder::new("security").args([
                    "add-trusted-cert".to_string(),
                    "-d".to_string(),
                    "-k".to_string(),
                    keychain.to_string_lossy().into_owned(),
                    target.path_arg(),
                ]);
                runner.run_checked(&Self::privileged(cmd, *elevate))?;
            }
            Self::Anchors { dir, refresh, elevate } => {
                let dest = dir.join(target.file_name());
                let cp = CommandBuilder::new("cp")
                    .args([target.path_arg(), dest.to_string_lossy().into_owned()]);
                runner.run_checked(&Self::privileged(cp, *elevate))?;
                if let Some(cmd) = Self::refresh_command(refresh, *elevate) {
                    runner.run_checked(&cmd)?;
                }
            }
            Self::Unsupported => {
                return Err(StoreError::Unavailable("no supported system trust store found".into()));
            }
        }
        log::info!("Installed {} into the system trust store", target.nickname);
        Ok(())
    }

    fn uninstall(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        match self {
            Self::Keychain { elevate, .. } => {
                let cmd = CommandBuilder::new("security")
                    .args(["remove-trusted-cert".to_string(), "-d".to_string(), target.path_arg()]);
                runner.run_checked(&Self::privileged(cmd, *elevate))?;
            }
            Self::Anchors { dir, refresh, elevate } => {
                let dest = dir.join(target.file_name());
                let rm = CommandBuilder::new("rm").args(["-f".to_string(), dest.to_string_lossy().into_owned()]);
                runner.run_checked(&Self::privileged(rm, *elevate))?;
                if let Some(cmd) = Self::refresh_command(refresh, *elevate) {
                    runner.run_checked(&cmd)?;
                }
            }
            Self::Unsupported => {
                return Err(StoreError::Unavailable("no supported system trust store found".into()));
            }
        }
        log::info!("Removed {} from the system trust store", target.nickname);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{RecordingRunner, failed};

    fn target() -> TrustTarget {
        TrustTarget {
            path: PathBuf::from("/home/dev/root.pem"),
            nickname: "devnet 0a1b".into(),
        }
    }

    #[test]
    fn keychain_commands() {
        let store = SystemStore::system_keychain(true);
        let runner = RecordingRunner::succeeding();
        store.install(&target(), &runner).unwrap();
        store.uninstall(&target(), &runner).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "sudo security add-trusted-cert -d -k /Library/Keychains/System.keychain /home/dev/root.pem",
                "sudo security remove-trusted-cert -d /home/dev/root.pem",
            ]
        );
    }

    #[test]
    fn detects_first_existing_anchor_dir() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(SystemStore::detect_anchors(root.path(), true), SystemStore::Unsupported);

        std::fs::create_dir_all(root.path().join("etc/pki/ca-trust/source/anchors")).unwrap();
        let store = SystemStore::detect_anchors(root.path(), false);
        assert_eq!(
            store,
            SystemStore::Anchors {
                dir: root.path().join("etc/pki/ca-trust/source/anchors"),
                refresh: vec!["update-ca-trust".into(), "extract".into()],
                elevate: false,
            }
        );
    }

    #[test]
    fn anchor_commands_copy_then_refresh() {
        let store = SystemStore::Anchors {
            dir: PathBuf::from("/usr/local/share/ca-certificates"),
            refresh: vec!["update-ca-certificates".into()],
            elevate: true,
        };
        let runner = RecordingRunner::succeeding();
        store.install(&target(), &runner).unwrap();
        store.uninstall(&target(), &runner).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "sudo cp /home/dev/root.pem /usr/local/share/ca-certificates/devnet-0a1b.crt",
                "sudo update-ca-certificates",
                "sudo rm -f /usr/local/share/ca-certificates/devnet-0a1b.crt",
                "sudo update-ca-certificates",
            ]
        );
    }

    #[test]
    fn failed_copy_skips_refresh() {
        let store = SystemStore::Anchors {
            dir: PathBuf::from("/usr/local/share/ca-certificates"),
            refresh: vec!["update-ca-certificates".into()],
            elevate: true,
        };
        let runner = RecordingRunner::new(|_| Ok(failed(1, "sudo: a password is required")));
        let err = store.install(&target(), &runner).unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn unsupported_is_unavailable() {
        let runner = RecordingRunner::succeeding();
        let err = SystemStore::Unsupported.install(&target(), &runner).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(runner.calls().is_empty());
    }
}
