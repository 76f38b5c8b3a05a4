//! Centralized command execution with consistent error handling.
//!
//! Stages never spawn processes directly. They describe an [`Invocation`]
//! with the [`Cmd`] builder and hand it to a [`ShellRunner`], which either
//! runs it on the host (optionally inside a chroot) or, in tests, records it.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// A fully described command, ready to hand to a [`ShellRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Run inside `chroot <root>` instead of on the host.
    pub root: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Don't fail on non-zero exit.
    pub allow_fail: bool,
    /// Custom error message prefix.
    pub error_prefix: Option<String>,
}

impl Invocation {
    /// Program and arguments joined with spaces, for logs and test asserts.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Turn a finished result into an error if the invocation requires success.
    pub fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if self.allow_fail || result.success() {
            return Ok(result);
        }

        let prefix = self
            .error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program));

        let stderr = result.stderr_trimmed();
        if stderr.is_empty() {
            bail!("{} (exit code {})", prefix, result.code());
        } else {
            bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Some(root) => write!(f, "[chroot {}] {}", root.display(), self.command_line()),
            None => f.write_str(&self.command_line()),
        }
    }
}

/// Executes OS-level commands. Either the command succeeds or the call
/// returns an error; there are no partial results.
pub trait ShellRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult>;
}

/// Runs commands on the build host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostShell;

impl ShellRunner for HostShell {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult> {
        let mut cmd = match &invocation.root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&invocation.program);
                cmd
            }
            None => Command::new(&invocation.program),
        };
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        tracing::debug!("Running: {}", invocation);
        let output = cmd.output().with_context(|| {
            format!(
                "Failed to execute '{}'. Is it installed?",
                invocation.program
            )
        })?;

        invocation.check(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    invocation: Invocation,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            invocation: Invocation {
                program: program.as_ref().to_string(),
                args: Vec::new(),
                root: None,
                env: Vec::new(),
                allow_fail: false,
                error_prefix: None,
            },
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.invocation.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.invocation.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.invocation
            .args
            .push(path.to_string_lossy().into_owned());
        self
    }

    /// Run inside a changed root.
    pub fn chroot(mut self, root: &Path) -> Self {
        self.invocation.root = Some(root.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.invocation
            .env
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.invocation.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.invocation.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run through the given runner.
    pub fn run_with(self, shell: &dyn ShellRunner) -> Result<CommandResult> {
        shell.run(&self.invocation)
    }
}

/// Check if a program exists in PATH.
///
/// Returns the full path if found, None otherwise.
pub fn which(program: &str) -> Option<PathBuf> {
    ::which::which(program).ok()
}

/// True when the effective user is root.
pub fn running_as_root() -> bool {
    rustix::process::geteuid().is_root()
}
