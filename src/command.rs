//! External command invocation.
//!
//! Every call into the service manager, `sudo`, or a trust-store utility goes
//! through [`CommandRunner`], which captures exit status, stdout and stderr.

use std::ffi::OsString;
use std::fmt;
use std::process::Command;

use crate::error::{CommandError, ExitCode};

/// A program plus its arguments, renderable as a shell-style command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    pub program: OsString,
    pub args: Vec<String>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Prefix the command with `sudo`.
    pub fn elevated(self) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program.to_string_lossy().into_owned());
        args.extend(self.args);
        Self {
            program: OsString::from("sudo"),
            args,
        }
    }

    /// Program name as a lossy string.
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl fmt::Display for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program.to_string_lossy())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam for running external programs.
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Only spawn failures are errors here;
    /// a non-zero exit is reported through [`CommandOutput::code`].
    fn run(&self, cmd: &CommandBuilder) -> std::io::Result<CommandOutput>;

    /// Run and turn a spawn failure or non-zero exit into [`CommandError`].
    fn run_checked(&self, cmd: &CommandBuilder) -> Result<CommandOutput, CommandError> {
        let output = self.run(cmd).map_err(|source| CommandError::Spawn {
            command: cmd.to_string(),
            source,
        })?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: cmd.to_string(),
                status: ExitCode(output.code),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Runs commands on the host with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &CommandBuilder) -> std::io::Result<CommandOutput> {
        log::debug!("running `{cmd}`");
        let output = Command::new(&cmd.program).args(&cmd.args).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
