//! External capabilities, run as blocking child processes

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info};

use crate::error::PartimgError;

/// One call to an external tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: vec![], env: vec![] }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// File name of the program, used in error reports
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Arguments as they would be typed, lossy
    pub fn arg_strings(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    pub fn has_arg(&self, arg: impl AsRef<Path>) -> bool {
        self.args.iter().any(|a| Path::new(a) == arg.as_ref())
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Result of a finished invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit status, `None` when killed by a signal
    pub status: Option<i32>,
    /// stdout followed by stderr
    pub output: String,
}

impl ToolOutput {
    pub fn success() -> Self {
        Self { status: Some(0), output: String::new() }
    }

    /// Map a non-zero status to [`PartimgError::ToolFailure`], a signal to
    /// [`PartimgError::Interrupted`]
    pub fn check(self, invocation: &ToolInvocation) -> Result<Self, PartimgError> {
        match self.status {
            Some(0) => Ok(self),
            Some(status) => {
                error!("{invocation} exited with {status}:\n{}", self.output);
                Err(PartimgError::ToolFailure { tool: invocation.name(), status, output: self.output })
            }
            None => Err(PartimgError::Interrupted(invocation.name())),
        }
    }
}

/// Runs external tools, replaced by a recording fake in tests
pub trait ToolRunner {
    /// Run to completion, without interpreting the exit status
    fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PartimgError>;

    /// Run to completion and require a zero exit status
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PartimgError> {
        info!("running {invocation}");
        self.execute(invocation)?.check(invocation)
    }
}

/// [`ToolRunner`] spawning real child processes, with no timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PartimgError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.envs(invocation.env.iter().map(|(k, v)| (k, v)));
        let output = cmd.output()?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("{} finished with {:?}", invocation.name(), output.status.code());
        Ok(ToolOutput { status: output.status.code(), output: text })
    }
}
