//! NSS databases used by Chromium on Linux and by Firefox everywhere.

use std::path::{Path, PathBuf};

use super::{StoreError, TrustConsumer, TrustStore, TrustTarget};
use crate::command::{CommandBuilder, CommandRunner};

/// Directories holding one Firefox profile per subdirectory, relative to `$HOME`.
const FIREFOX_PROFILE_ROOTS: &[&str] = &[
    ".mozilla/firefox",
    "snap/firefox/common/.mozilla/firefox",
    "Library/Application Support/Firefox/Profiles",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NssStore {
    certutil: Option<PathBuf>,
    databases: Vec<String>,
}

impl NssStore {
    pub fn new(certutil: Option<PathBuf>, databases: Vec<String>) -> Self {
        Self { certutil, databases }
    }

    pub fn detect(home: &Path) -> Self {
        Self::new(which::which("certutil").ok(), find_databases(home))
    }

    fn usable(&self) -> Option<&Path> {
        match &self.certutil {
            None => {
                log::warn!("certutil not found, skipping browser trust stores");
                None
            }
            Some(_) if self.databases.is_empty() => {
                log::warn!("No NSS databases found, skipping browser trust stores");
                None
            }
            Some(certutil) => Some(certutil),
        }
    }
}

/// `sql:`/`dbm:` database arguments under `home`, sorted.
pub fn find_databases(home: &Path) -> Vec<String> {
    let mut dirs = vec![home.join(".pki").join("nssdb")];
    for root in FIREFOX_PROFILE_ROOTS {
        if let Ok(entries) = std::fs::read_dir(home.join(root)) {
            dirs.extend(entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()));
        }
    }

    let mut databases: Vec<String> = dirs
        .into_iter()
        .filter_map(|dir| {
            if dir.join("cert9.db").is_file() {
                Some(format!("sql:{}", dir.display()))
            } else if dir.join("cert8.db").is_file() {
                Some(format!("dbm:{}", dir.display()))
            } else {
                None
            }
        })
        .collect();
    databases.sort();
    databases
}

impl TrustStore for NssStore {
    fn consumer(&self) -> TrustConsumer {
        TrustConsumer::Browser
    }

    fn install(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        let Some(certutil) = self.usable() else {
            return Ok(());
        };
        for db in &self.databases {
            let cmd = CommandBuilder::new(certutil).args([
                "-A".to_string(),
                "-d".to_string(),
                db.clone(),
                "-t".to_string(),
                "C,,".to_string(),
                "-n".to_string(),
                target.nickname.clone(),
                "-i".to_string(),
                target.path_arg(),
            ]);
            runner.run_checked(&cmd)?;
            log::info!("Installed {} into {db}", target.nickname);
        }
        Ok(())
    }

    fn uninstall(&self, target: &TrustTarget, runner: &dyn CommandRunner) -> Result<(), StoreError> {
        let Some(certutil) = self.usable() else {
            return Ok(());
        };
        for db in &self.databases {
            let cmd = CommandBuilder::new(certutil).args([
                "-D".to_string(),
                "-d".to_string(),
                db.clone(),
                "-n".to_string(),
                target.nickname.clone(),
            ]);
            runner.run_checked(&cmd)?;
            log::info!("Removed {} from {db}", target.nickname);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::command::testing::RecordingRunner;

    fn target() -> TrustTarget {
        TrustTarget {
            path: PathBuf::from("/home/dev/root.pem"),
            nickname: "devnet 0a1b".into(),
        }
    }

    #[test]
    fn finds_shared_db_and_firefox_profiles() {
        let home = tempfile::tempdir().unwrap();
        let nssdb = home.path().join(".pki/nssdb");
        let profile = home.path().join(".mozilla/firefox/abcd.default-release");
        let legacy = home.path().join(".mozilla/firefox/old.default");
        let empty = home.path().join(".mozilla/firefox/empty");
        for dir in [&nssdb, &profile, &legacy, &empty] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(nssdb.join("cert9.db"), b"").unwrap();
        fs::write(profile.join("cert9.db"), b"").unwrap();
        fs::write(legacy.join("cert8.db"), b"").unwrap();

        let mut expected = vec![
            format!("sql:{}", nssdb.display()),
            format!("sql:{}", profile.display()),
            format!("dbm:{}", legacy.display()),
        ];
        expected.sort();
        assert_eq!(find_databases(home.path()), expected);
    }

    #[test]
    fn certutil_per_database() {
        let store = NssStore::new(
            Some(PathBuf::from("certutil")),
            vec!["sql:/home/dev/.pki/nssdb".into()],
        );
        let runner = RecordingRunner::succeeding();
        store.install(&target(), &runner).unwrap();
        store.uninstall(&target(), &runner).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "certutil -A -d sql:/home/dev/.pki/nssdb -t C,, -n 'devnet 0a1b' -i /home/dev/root.pem",
                "certutil -D -d sql:/home/dev/.pki/nssdb -n 'devnet 0a1b'",
            ]
        );
    }

    #[test]
    fn skipped_without_certutil_or_databases() {
        let runner = RecordingRunner::succeeding();
        NssStore::new(None, vec!["sql:/x".into()])
            .install(&target(), &runner)
            .unwrap();
        NssStore::new(Some(PathBuf::from("certutil")), Vec::new())
            .install(&target(), &runner)
            .unwrap();
        assert!(runner.calls().is_empty());
    }
}
