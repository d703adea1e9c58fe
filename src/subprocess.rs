//! Isolated execution of external tools.
//!
//! External optimizers and the primary quantifier run as child processes that
//! exchange data through files. Output is captured to files in the working
//! directory, and a child still running at the deadline is killed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Interval between liveness checks of a running child
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors from an external tool invocation
#[derive(Error, Debug)]
pub enum ExternalError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("External tool {tool} exited with {status}: {stderr}")]
    ExecutionFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("External tool {tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Malformed output from {tool}: {reason}")]
    MalformedOutput { tool: String, reason: String },

    #[error("Invalid argument template '{template}': {reason}")]
    InvalidArguments { template: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A program plus the arguments that always precede call-specific ones
/// (e.g. an interpreter and its script)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    /// Executable to run
    pub program: PathBuf,
    /// Leading arguments
    #[serde(default)]
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    /// A bare executable
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// An executable with fixed leading arguments
    pub fn with_prefix(program: impl Into<PathBuf>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    /// Display name for errors
    #[must_use]
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Captured result of a successful run
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Captured standard output
    pub stdout: String,
    /// Wall-clock duration
    pub elapsed: Duration,
}

/// Run `tool` with `args` inside `workdir`, bounded by `timeout`.
///
/// # Errors
///
/// Returns `ToolNotFound` if the program cannot be spawned, `Timeout` if it
/// outlives the deadline, `ExecutionFailed` on a non-zero exit status.
pub fn run_tool(
    tool: &ToolCommand,
    args: &[String],
    workdir: &Path,
    timeout: Duration,
) -> Result<ToolOutput, ExternalError> {
    let name = tool.display_name();
    let stdout_path = workdir.join("stdout.log");
    let stderr_path = workdir.join("stderr.log");

    let mut cmd = Command::new(&tool.program);
    cmd.args(&tool.prefix_args)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(std::fs::File::create(&stdout_path)?)
        .stderr(std::fs::File::create(&stderr_path)?);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ExternalError::ToolNotFound(name.clone())
        }
        _ => ExternalError::IoError(e),
    })?;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() > timeout {
            // the child may exit between try_wait and kill
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExternalError::Timeout {
                tool: name,
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    let elapsed = start.elapsed();

    if !status.success() {
        let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
        return Err(ExternalError::ExecutionFailed {
            tool: name,
            status: describe_status(status),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(ToolOutput {
        stdout: std::fs::read_to_string(&stdout_path)?,
        elapsed,
    })
}

fn describe_status(status: ExitStatus) -> String {
    status
        .code()
        .map_or_else(|| "signal".to_string(), |code| format!("exit code {code}"))
}

/// Parse output that must consist of exactly one number
///
/// # Errors
///
/// Returns `MalformedOutput` for empty, multi-token or non-finite output.
pub fn parse_scalar(tool: &str, output: &str) -> Result<f64, ExternalError> {
    let malformed = |reason: String| ExternalError::MalformedOutput {
        tool: tool.to_string(),
        reason,
    };
    let mut tokens = output.split_whitespace();
    let token = tokens
        .next()
        .ok_or_else(|| malformed("empty output".to_string()))?;
    if tokens.next().is_some() {
        return Err(malformed(format!("expected a single value, got '{}'", output.trim())));
    }
    let value: f64 = token
        .parse()
        .map_err(|_| malformed(format!("not a number: '{token}'")))?;
    if !value.is_finite() {
        return Err(malformed(format!("non-finite value: {value}")));
    }
    Ok(value)
}
