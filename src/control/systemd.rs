//! Linux backend using a systemd user unit (systemctl --user).

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ServiceBackend, ServiceDescriptor};
use crate::command::{CommandBuilder, CommandOutput};
use crate::error::ControlError;

static PID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^MainPID=([1-9][0-9]*)\s*$").expect("static regex"));

pub struct SystemdBackend {
    label: String,
    unit_dir: PathBuf,
}

impl SystemdBackend {
    pub fn new(label: impl Into<String>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            unit_dir: unit_dir.into(),
        }
    }

    /// `~/.config/systemd/user` for the current user.
    pub fn for_current_user(label: &str) -> Result<Self, ControlError> {
        let config = dirs::config_dir().ok_or(ControlError::Unsupported("no config directory"))?;
        Ok(Self::new(label, config.join("systemd").join("user")))
    }

    fn unit(&self) -> String {
        format!("{}.service", self.label)
    }

    fn systemctl(&self) -> CommandBuilder {
        CommandBuilder::new("systemctl").arg("--user")
    }
}

impl ServiceBackend for SystemdBackend {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn descriptor_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit())
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> Result<String, ControlError> {
        let program = descriptor.program.to_string_lossy();
        let exec = std::iter::once(&*program)
            .chain(descriptor.args.iter().map(String::as_str))
            .map(exec_word)
            .collect::<Vec<_>>()
            .join(" ");
        let mut content = String::with_capacity(512);

        content.push_str("[Unit]\n");
        content.push_str("Description=devnet local DNS and HTTPS roots endpoint\n");
        content.push_str("After=network.target\n\n");

        content.push_str("[Service]\n");
        content.push_str("Type=simple\n");
        content.push_str(&format!("ExecStart={exec}\n"));
        for (key, value) in &descriptor.env {
            content.push_str(&format!("Environment={}\n", quoted(&format!("{key}={value}"))));
        }
        content.push_str("Restart=on-failure\n");
        content.push_str("RestartSec=5s\n");
        if let Some(log) = &descriptor.log_file {
            let log = log.to_string_lossy();
            content.push_str(&format!("StandardOutput=append:{log}\n"));
            content.push_str(&format!("StandardError=append:{log}\n"));
        }
        content.push_str(&format!("SyslogIdentifier={}\n\n", descriptor.label));

        content.push_str("[Install]\n");
        content.push_str("WantedBy=default.target\n");
        Ok(content)
    }

    fn register(&self) -> CommandBuilder {
        // --quiet keeps "Created symlink" chatter off stderr
        self.systemctl().args(["--quiet", "enable", "--now"]).arg(self.unit())
    }

    fn unregister(&self) -> CommandBuilder {
        self.systemctl().args(["--quiet", "disable", "--now"]).arg(self.unit())
    }

    fn start(&self) -> CommandBuilder {
        self.systemctl().arg("start").arg(self.unit())
    }

    fn status(&self) -> CommandBuilder {
        self.systemctl()
            .args(["show", "--property=LoadState", "--property=MainPID"])
            .arg(self.unit())
    }

    fn status_loaded(&self, output: &CommandOutput) -> bool {
        output.success() && output.stdout.lines().any(|line| line.trim() == "LoadState=loaded")
    }

    fn pid(&self, status: &str) -> Option<u32> {
        PID_PATTERN
            .captures(status)
            .and_then(|caps| caps[1].parse().ok())
    }
}

/// Double-quote a unit file value using systemd's C-style escapes.
fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// One `ExecStart=` word. `$` would otherwise start a variable expansion.
fn exec_word(word: &str) -> String {
    quoted(&word.replace('$', "$$"))
}
