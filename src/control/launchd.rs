//! macOS backend using launchd (launchctl) in the user's GUI domain.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use plist::{Dictionary, Value};
use regex::Regex;

use super::{ServiceBackend, ServiceDescriptor};
use crate::command::{CommandBuilder, CommandOutput};
use crate::error::ControlError;

/// `launchctl list <label>` prints `"PID" = 1234;` while the job has a process.
static PID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""PID"\s*=\s*(\d+);"#).expect("static regex"));

pub struct LaunchdBackend {
    label: String,
    agent_dir: PathBuf,
    uid: u32,
}

impl LaunchdBackend {
    pub fn new(label: impl Into<String>, agent_dir: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            label: label.into(),
            agent_dir: agent_dir.into(),
            uid,
        }
    }

    /// `~/Library/LaunchAgents` for the current user.
    pub fn for_current_user(label: &str) -> Result<Self, ControlError> {
        let home = dirs::home_dir().ok_or(ControlError::Unsupported("no home directory"))?;
        Ok(Self::new(
            label,
            home.join("Library").join("LaunchAgents"),
            nix::unistd::getuid().as_raw(),
        ))
    }

    fn domain(&self) -> String {
        format!("gui/{}", self.uid)
    }

    fn plist_path(&self) -> String {
        self.descriptor_path().to_string_lossy().into_owned()
    }
}

impl ServiceBackend for LaunchdBackend {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn descriptor_path(&self) -> PathBuf {
        self.agent_dir.join(format!("{}.plist", self.label))
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> Result<String, ControlError> {
        let mut dict = Dictionary::new();
        dict.insert("Label".into(), Value::String(descriptor.label.clone()));

        let mut program_args = vec![Value::String(descriptor.program.to_string_lossy().into_owned())];
        program_args.extend(descriptor.args.iter().cloned().map(Value::String));
        dict.insert("ProgramArguments".into(), Value::Array(program_args));

        if !descriptor.env.is_empty() {
            let mut env = Dictionary::new();
            for (key, value) in &descriptor.env {
                env.insert(key.clone(), Value::String(value.clone()));
            }
            dict.insert("EnvironmentVariables".into(), Value::Dictionary(env));
        }

        dict.insert("RunAtLoad".into(), Value::Boolean(true));
        let mut keep_alive = Dictionary::new();
        keep_alive.insert("SuccessfulExit".into(), Value::Boolean(false));
        dict.insert("KeepAlive".into(), Value::Dictionary(keep_alive));

        if let Some(log) = &descriptor.log_file {
            let log = Value::String(log.to_string_lossy().into_owned());
            dict.insert("StandardOutPath".into(), log.clone());
            dict.insert("StandardErrorPath".into(), log);
        }

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))
            .map_err(|e| ControlError::Render(format!("Failed to generate plist: {e}")))?;
        String::from_utf8(buf)
            .map_err(|e| ControlError::Render(format!("Plist contains invalid UTF-8: {e}")))
    }

    fn register(&self) -> CommandBuilder {
        CommandBuilder::new("launchctl").args(["bootstrap".to_string(), self.domain(), self.plist_path()])
    }

    fn unregister(&self) -> CommandBuilder {
        CommandBuilder::new("launchctl").args(["bootout".to_string(), self.domain(), self.plist_path()])
    }

    fn start(&self) -> CommandBuilder {
        CommandBuilder::new("launchctl")
            .args(["kickstart".to_string(), format!("{}/{}", self.domain(), self.label)])
    }

    fn status(&self) -> CommandBuilder {
        CommandBuilder::new("launchctl").args(["list", self.label.as_str()])
    }

    fn status_loaded(&self, output: &CommandOutput) -> bool {
        output.success()
    }

    fn pid(&self, status: &str) -> Option<u32> {
        PID_PATTERN
            .captures(status)
            .and_then(|caps| caps[1].parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LaunchdBackend {
        LaunchdBackend::new("dev.devnet.devnetd", "/Users/dev/Library/LaunchAgents", 501)
    }

    #[test]
    fn commands_target_gui_domain() {
        let b = backend();
        assert_eq!(
            b.register().to_string(),
            "launchctl bootstrap gui/501 /Users/dev/Library/LaunchAgents/dev.devnet.devnetd.plist"
        );
        assert_eq!(
            b.unregister().to_string(),
            "launchctl bootout gui/501 /Users/dev/Library/LaunchAgents/dev.devnet.devnetd.plist"
        );
        assert_eq!(
            b.start().to_string(),
            "launchctl kickstart gui/501/dev.devnet.devnetd"
        );
        assert_eq!(b.status().to_string(), "launchctl list dev.devnet.devnetd");
    }

    #[test]
    fn pid_is_read_from_list_output() {
        let running = "{\n\t\"LimitLoadToSessionType\" = \"Aqua\";\n\t\"Label\" = \"dev.devnet.devnetd\";\n\t\"PID\" = 1234;\n};\n";
        let stopped = "{\n\t\"Label\" = \"dev.devnet.devnetd\";\n\t\"LastExitStatus\" = 0;\n};\n";
        assert_eq!(backend().pid(running), Some(1234));
        assert_eq!(backend().pid(stopped), None);
    }

    #[test]
    fn plist_carries_label_and_program() {
        let descriptor = ServiceDescriptor {
            label: "dev.devnet.devnetd".into(),
            program: PathBuf::from("/usr/local/bin/devnetd"),
            args: vec!["run".into()],
            env: Default::default(),
            log_file: None,
        };
        let xml = backend().render(&descriptor).unwrap();
        assert!(xml.contains("<key>Label</key>"));
        assert!(xml.contains("<string>dev.devnet.devnetd</string>"));
        assert!(xml.contains("<string>/usr/local/bin/devnetd</string>"));
        assert!(xml.contains("<string>run</string>"));
        assert!(xml.contains("<key>RunAtLoad</key>"));
        assert!(!xml.contains("EnvironmentVariables"));
    }

    #[test]
    fn plist_carries_config_path_and_overrides() {
        let descriptor = ServiceDescriptor {
            label: "dev.devnet.devnetd".into(),
            program: PathBuf::from("/usr/local/bin/devnetd"),
            args: crate::control::daemon_args(std::path::Path::new(
                "/Users/dev/Library/Application Support/devnet/devnet.toml",
            )),
            env: [("DEVNET_DNS_PORT".to_string(), "9053".to_string())].into(),
            log_file: None,
        };
        let xml = backend().render(&descriptor).unwrap();
        let value = plist::Value::from_reader_xml(xml.as_bytes()).unwrap();
        let dict = value.as_dictionary().unwrap();

        let args: Vec<&str> = dict.get("ProgramArguments").unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_string().unwrap())
            .collect();
        assert_eq!(
            args,
            [
                "/usr/local/bin/devnetd",
                "--config",
                "/Users/dev/Library/Application Support/devnet/devnet.toml",
                "run",
            ]
        );

        let env = dict.get("EnvironmentVariables").unwrap().as_dictionary().unwrap();
        assert_eq!(env.get("DEVNET_DNS_PORT").and_then(plist::Value::as_string), Some("9053"));
    }
}
