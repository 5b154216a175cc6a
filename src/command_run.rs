//! External process capability.
//!
//! The image converter and the transfer tool are reached only through
//! [`CommandRunner`]: arguments in, exit status plus the tail of stderr out.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::system_check;

/// How a finished external command exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExit {
    pub code: Option<i32>,
    /// Trailing part of the command's stderr.
    pub stderr: String,
}

impl ToolExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {code}")?,
            None => f.write_str("terminated by signal")?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {stderr}")?;
        }
        Ok(())
    }
}

/// A spawned command that the caller polls.
pub trait RunningTool {
    /// Return the exit once the command has finished, without blocking.
    fn try_finish(&mut self) -> io::Result<Option<ToolExit>>;

    /// Stop the command and reap it.
    fn kill(&mut self);
}

pub trait CommandRunner {
    /// Full path of `program` if it can be executed.
    fn lookup(&self, program: &str) -> Option<PathBuf>;

    /// Run to completion.
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<ToolExit>;

    /// Start without waiting.
    fn spawn(&self, program: &str, args: &[OsString]) -> io::Result<Box<dyn RunningTool>>;
}

/// Runs commands on the host, capturing stderr in an anonymous temp file.
pub struct HostRunner;

fn host_command(program: &str, args: &[OsString], stderr: &File) -> io::Result<Command> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stderr(stderr.try_clone()?);
    tracing::debug!("exec: {}", render_command(program, args));
    Ok(cmd)
}

/// Printable rendering of a command line for logs.
pub fn render_command(program: &str, args: &[OsString]) -> String {
    std::iter::once(OsStr::new(program))
        .chain(args.iter().map(OsString::as_os_str))
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn exit_from(status: ExitStatus, stderr: File) -> ToolExit {
    ToolExit {
        code: status.code(),
        stderr: last_utf8_content_from_file(stderr),
    }
}

fn last_utf8_content_from_file(mut f: File) -> String {
    // Only the trailing bytes, to avoid pathological error messages.
    const MAX_STDERR_BYTES: u64 = 1024;
    let size = f.metadata().map(|m| m.len()).unwrap_or(0).min(MAX_STDERR_BYTES);
    let mut buf = Vec::with_capacity(size as usize);
    match f
        .seek(io::SeekFrom::End(-(size as i64)))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".to_string()
        }
    }
}

impl CommandRunner for HostRunner {
    fn lookup(&self, program: &str) -> Option<PathBuf> {
        system_check::find_program(program).ok()
    }

    fn run(&self, program: &str, args: &[OsString]) -> io::Result<ToolExit> {
        let stderr = tempfile::tempfile()?;
        let status = host_command(program, args, &stderr)?.status()?;
        Ok(exit_from(status, stderr))
    }

    fn spawn(&self, program: &str, args: &[OsString]) -> io::Result<Box<dyn RunningTool>> {
        let stderr = tempfile::tempfile()?;
        let child = host_command(program, args, &stderr)?.spawn()?;
        Ok(Box::new(HostChild {
            child,
            stderr: Some(stderr),
        }))
    }
}

struct HostChild {
    child: Child,
    stderr: Option<File>,
}

impl RunningTool for HostChild {
    fn try_finish(&mut self) -> io::Result<Option<ToolExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let exit = match self.stderr.take() {
            Some(stderr) => exit_from(status, stderr),
            None => ToolExit {
                code: status.code(),
                stderr: String::new(),
            },
        };
        Ok(Some(exit))
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for HostChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}
