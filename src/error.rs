//! Error taxonomy for the migration pipeline.
//!
//! Every pipeline component returns a [`MigrateError`]. Only best-effort
//! teardown swallows errors; everything else propagates to the session
//! controller, which attaches the stage it was in (see
//! [`crate::session::SessionFailure`]).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("source path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("insufficient privilege: {0}")]
    Privilege(String),

    #[error("failed to mount {}: {source}", path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to find required command {0:?}")]
    ToolNotFound(String),

    #[error("failed to convert image {} for importing: {reason}", path.display())]
    Conversion { path: PathBuf, reason: String },

    #[error("remote operation failed: {0}")]
    RemoteOperation(String),

    #[error("migration cancelled")]
    Cancelled,

    #[error("{} cannot be used here: {reason}", path.display())]
    UnsupportedSource { path: PathBuf, reason: String },

    #[error("invalid mount plan: {0}")]
    InvalidPlan(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl MigrateError {
    pub(crate) fn mount(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MigrateError::Mount {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        MigrateError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrateError::Cancelled)
    }
}

pub type Result<T, E = MigrateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_error_names_path() {
        let err = MigrateError::mount("/data/a", io::Error::from_raw_os_error(libc::EPERM));
        let msg = err.to_string();
        assert!(msg.contains("/data/a"), "unexpected message: {msg}");
    }

    #[test]
    fn test_conversion_error_names_source() {
        let err = MigrateError::Conversion {
            path: PathBuf::from("/img/disk.qcow2"),
            reason: "exit status 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to convert image /img/disk.qcow2 for importing: exit status 1"
        );
    }

    #[test]
    fn test_is_cancelled() {
        assert!(MigrateError::Cancelled.is_cancelled());
        assert!(!MigrateError::ToolNotFound("qemu-img".into()).is_cancelled());
    }
}
