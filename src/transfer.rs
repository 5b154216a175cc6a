//! Transfer coordinator: stream the prepared local content to the remote
//! operation's data endpoint.
//!
//! The transfer tool runs as a child process. While it runs, the operation
//! is polled for progress and the cancel token is checked between polls.
//! Success is only reported once the tool has exited cleanly *and* the
//! remote operation has reached `Success`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::command_run::{CommandRunner, RunningTool};
use crate::error::{MigrateError, Result};
use crate::progress::ProgressObserver;
use crate::remote::{Operation, OperationStatus};

/// Local content handed to the transfer tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Root of the synthesized filesystem tree.
    Tree(PathBuf),
    /// Read-only bind-mounted disk image.
    Image(PathBuf),
}

impl TransferTarget {
    pub fn path(&self) -> &Path {
        match self {
            TransferTarget::Tree(p) | TransferTarget::Image(p) => p,
        }
    }
}

const TREE_ARGS: &[&str] = &[
    "-aHAX",
    "--numeric-ids",
    "--devices",
    "--specials",
    "--sparse",
    "--partial",
    "--delete",
];

const IMAGE_ARGS: &[&str] = &["--sparse", "--partial", "--inplace", "--copy-links"];

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Program used to move the data, `rsync` unless configured otherwise.
    pub tool: String,
    /// Extra user arguments, placed before the paths.
    pub extra_args: Vec<String>,
    pub poll_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            tool: "rsync".to_string(),
            extra_args: Vec::new(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Split a user-supplied argument string with shell quoting rules.
pub fn split_extra_args(raw: &str) -> Option<Vec<String>> {
    shlex::split(raw)
}

/// Full argument list for the transfer tool.
pub fn transfer_args(target: &TransferTarget, extra: &[String], endpoint: &str) -> Vec<OsString> {
    let (base, source) = match target {
        TransferTarget::Tree(root) => {
            // Trailing slash: copy the tree's contents, not the directory.
            let mut source = root.as_os_str().to_owned();
            if !source.to_string_lossy().ends_with('/') {
                source.push("/");
            }
            (TREE_ARGS, source)
        }
        TransferTarget::Image(image) => (IMAGE_ARGS, image.as_os_str().to_owned()),
    };
    let mut args: Vec<OsString> = base.iter().map(OsString::from).collect();
    args.extend(extra.iter().map(OsString::from));
    args.push(source);
    args.push(OsString::from(endpoint));
    args
}

/// Run the transfer to completion.
pub fn run(
    target: &TransferTarget,
    operation: &mut dyn Operation,
    runner: &dyn CommandRunner,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
    options: &TransferOptions,
) -> Result<()> {
    cancel.check()?;
    if runner.lookup(&options.tool).is_none() {
        return Err(MigrateError::ToolNotFound(options.tool.clone()));
    }

    let args = transfer_args(target, &options.extra_args, operation.data_endpoint());
    tracing::info!(
        "transferring {} for operation {}",
        target.path().display(),
        operation.id()
    );
    let mut tool = runner.spawn(&options.tool, &args).map_err(|e| {
        MigrateError::RemoteOperation(format!("failed to start {}: {e}", options.tool))
    })?;

    let result = drive(tool.as_mut(), operation, observer, cancel, options);
    observer.finish();
    result
}

fn drive(
    tool: &mut dyn RunningTool,
    operation: &mut dyn Operation,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
    options: &TransferOptions,
) -> Result<()> {
    let mut remote_done = false;
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("cancelled, stopping {}", options.tool);
            tool.kill();
            return Err(MigrateError::Cancelled);
        }

        let finished = tool
            .try_finish()
            .map_err(|e| MigrateError::io(format!("failed to wait for {}", options.tool), e))?;
        if let Some(exit) = finished {
            if !exit.is_success() {
                // An interrupt reaches the tool through the terminal's process
                // group, usually before the listener has flagged the token.
                if interrupted(cancel, options.poll_interval) {
                    return Err(MigrateError::Cancelled);
                }
                return Err(MigrateError::RemoteOperation(format!(
                    "{} failed: {exit}",
                    options.tool
                )));
            }
            tracing::debug!("{} finished", options.tool);
            break;
        }

        if !remote_done {
            match operation.poll()? {
                OperationStatus::Running { progress } => {
                    if let Some(progress) = progress {
                        observer.update(&progress);
                    }
                }
                OperationStatus::Succeeded => remote_done = true,
                OperationStatus::Failed(err) => {
                    tool.kill();
                    cancel.check()?;
                    return Err(MigrateError::RemoteOperation(err));
                }
            }
        }
        std::thread::sleep(options.poll_interval);
    }

    if remote_done {
        return Ok(());
    }
    wait_for_operation(operation, observer, cancel, options.poll_interval)
}

/// Poll until the operation reaches a terminal state.
fn wait_for_operation(
    operation: &mut dyn Operation,
    observer: &dyn ProgressObserver,
    cancel: &CancelToken,
    interval: Duration,
) -> Result<()> {
    loop {
        cancel.check()?;
        match operation.poll()? {
            OperationStatus::Succeeded => return Ok(()),
            OperationStatus::Failed(err) => {
                cancel.check()?;
                return Err(MigrateError::RemoteOperation(err));
            }
            OperationStatus::Running { progress } => {
                if let Some(progress) = progress {
                    observer.update(&progress);
                }
            }
        }
        std::thread::sleep(interval);
    }
}

/// Whether the token is cancelled now or within one more poll interval.
fn interrupted(cancel: &CancelToken, interval: Duration) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    std::thread::sleep(interval);
    cancel.is_cancelled()
}
