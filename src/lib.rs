//! vmigrate: move a local root filesystem, disk or disk image into an
//! instance or custom volume on a remote host.
//!
//! The pipeline is driven by [`session::Session`]: the source is resolved,
//! a private mount namespace is entered, a read-only view of the source is
//! assembled under a temporary root, the remote resource is created and
//! the data is pushed to it. Everything that touches the host (mounts,
//! namespaces, external programs, the remote API) sits behind a trait so
//! the orchestration can be tested without privileges.

pub mod cancel;
pub mod command_run;
pub mod config;
pub mod disk;
pub mod error;
pub mod mounts;
pub mod progress;
pub mod remote;
pub mod request;
pub mod sandbox;
pub mod session;
pub mod source;
pub mod system_check;
pub mod transfer;
pub mod tree;

#[cfg(test)]
mod testing;

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{bail, Result};

pub use error::MigrateError;

/// Longest instance name the remote host accepts.
pub const MAX_NAME_LEN: usize = 63;

pub struct SudoUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Returns info about the real user behind `sudo`, if applicable.
///
/// Looks up `SUDO_USER` in the environment. Returns `None` if the variable
/// is unset, empty, or set to "root" (running `sudo` as root is a no-op).
pub fn sudo_user() -> Option<SudoUser> {
    let name = std::env::var("SUDO_USER").ok()?;
    if name.is_empty() || name == "root" {
        return None;
    }
    let c_name = CString::new(name.as_bytes()).ok()?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) }
        .to_str()
        .ok()?;
    Some(SudoUser {
        name,
        uid: unsafe { (*pw).pw_uid },
        gid: unsafe { (*pw).pw_gid },
        home: PathBuf::from(home),
    })
}

pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check an instance name: a letter first, then letters, digits and
/// hyphens, no trailing hyphen.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("instance name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("instance name cannot be longer than {MAX_NAME_LEN} characters");
    }
    if !name.as_bytes()[0].is_ascii_alphabetic() {
        bail!("instance name must start with a letter");
    }
    if name.ends_with('-') {
        bail!("instance name cannot end with a hyphen");
    }
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' {
            bail!("instance name may only contain letters, digits, and hyphens");
        }
    }
    Ok(())
}
