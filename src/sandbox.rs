//! Private mount namespace for the migration session.
//!
//! Mount namespace membership is per thread. After [`Sandbox::enter`] the
//! whole pipeline must keep running on the calling thread; mounts made from
//! any other thread would land in the host namespace.

use std::io;
use std::ptr;

use crate::error::{MigrateError, Result};

pub trait Sandbox {
    /// Move the calling thread into a fresh mount namespace whose mounts do
    /// not propagate back to the parent.
    fn enter(&self) -> Result<()>;
}

pub struct HostSandbox;

impl Sandbox for HostSandbox {
    fn enter(&self) -> Result<()> {
        let ret = unsafe { libc::unshare(libc::CLONE_NEWNS) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) => {
                    MigrateError::Privilege(format!("failed to unshare mount namespace: {err}"))
                }
                _ => MigrateError::io("failed to unshare mount namespace", err),
            });
        }
        tracing::debug!("unshared mount namespace");

        // Prevent mount propagation back to the initial namespace.
        let ret = unsafe {
            libc::mount(
                ptr::null(),
                c"/".as_ptr(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            )
        };
        if ret != 0 {
            return Err(MigrateError::mount("/", io::Error::last_os_error()));
        }
        tracing::debug!("remounted / as private");
        Ok(())
    }
}
